use hex::encode;
use std::io::Error as IoError;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Server offered no authentication mechanism")]
    NoMechanism,
    #[error("Could not authenticate with any offered mechanism")]
    NoAuthentication,
    #[error("Authentication rejected: {0}")]
    Rejected(String),
    #[error("Could not negotiate unix fd passing: {0}")]
    NegotiateUnixFd(String),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

const LINE_END: &str = "\r\n";

/// The SASL exchange that precedes the message stream. Only the `EXTERNAL`
/// and `ANONYMOUS` mechanisms are supported; the daemon picks which of them
/// it accepts.
pub(super) struct Handshake<T>(BufStream<T>);

impl<T> Handshake<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn new(stream: T) -> Result<Handshake<T>, IoError> {
        let mut buf_stream = BufStream::new(stream);
        // The exchange starts with a single NUL credentials byte.
        let zero: [u8; 1] = [0; 1];
        buf_stream.write_all(&zero[..]).await?;
        Ok(Handshake(buf_stream))
    }

    async fn read_line(&mut self) -> Result<String, IoError> {
        let mut line = String::new();
        self.0.read_line(&mut line).await?;
        if let Some(line) = line.strip_suffix(LINE_END) {
            Ok(line.to_owned())
        } else {
            Ok(line)
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), IoError> {
        self.0.write_all(line.as_bytes()).await?;
        self.0.write_all(LINE_END.as_bytes()).await?;
        self.0.flush().await?;
        Ok(())
    }

    async fn request(&mut self, line: &str) -> Result<String, IoError> {
        self.write_line(line).await?;
        self.read_line().await
    }

    /// A bare `AUTH` makes the server list the mechanisms it supports.
    async fn mechanisms(&mut self) -> Result<Vec<String>, HandshakeError> {
        let response = self.request("AUTH").await?;
        match response.strip_prefix("REJECTED ") {
            Some(list) if !list.is_empty() => {
                Ok(list.split(' ').map(str::to_owned).collect())
            }
            _ => Err(HandshakeError::NoMechanism),
        }
    }

    async fn auth_external(&mut self) -> Result<(), HandshakeError> {
        // EXTERNAL authenticates by the uid of the process, hex-encoded.
        let uid = unsafe { libc::getuid() };
        let cmd = format!("AUTH EXTERNAL {}", encode(uid.to_string()));
        let response = self.request(&cmd).await?;
        if response.starts_with("OK ") {
            Ok(())
        } else {
            Err(HandshakeError::Rejected(response))
        }
    }

    async fn auth_anonymous(&mut self) -> Result<(), HandshakeError> {
        // The argument is a hex-encoded trace string ("dbus-lite").
        let response = self.request("AUTH ANONYMOUS 646275732d6c697465").await?;
        if response.starts_with("OK ") {
            Ok(())
        } else {
            Err(HandshakeError::Rejected(response))
        }
    }

    async fn authenticate(&mut self) -> Result<(), HandshakeError> {
        for mechanism in self.mechanisms().await? {
            let result = match mechanism.as_str() {
                "EXTERNAL" => self.auth_external().await,
                "ANONYMOUS" => self.auth_anonymous().await,
                other => {
                    debug!("skipping unsupported mechanism: {}", other);
                    continue;
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => error!("could not authenticate ({}): {}", mechanism, e),
            }
        }
        Err(HandshakeError::NoAuthentication)
    }

    async fn negotiate_unix_fd(&mut self) -> Result<(), HandshakeError> {
        let response = self.request("NEGOTIATE_UNIX_FD").await?;
        if response == "AGREE_UNIX_FD" {
            Ok(())
        } else {
            Err(HandshakeError::NegotiateUnixFd(response))
        }
    }

    async fn begin(mut self) -> Result<(), IoError> {
        self.write_line("BEGIN").await
    }

    /// Run the whole exchange on `stream`. Fd passing is only negotiated on
    /// unix transports.
    pub(super) async fn run(
        stream: &mut T,
        negotiate_unix_fd: bool,
    ) -> Result<(), HandshakeError> {
        let mut handshake = Handshake::new(stream).await?;
        handshake.authenticate().await?;
        if negotiate_unix_fd {
            handshake.negotiate_unix_fd().await?;
        }
        handshake.begin().await?;
        Ok(())
    }
}
