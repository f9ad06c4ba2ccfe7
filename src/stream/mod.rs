mod handshake;

pub use handshake::HandshakeError;

use crate::error::ConnectError;
use dbus_server_address_parser::{Address, Family, Tcp, Unix, UnixType};
use handshake::Handshake;
use std::io::Result as IoResult;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, tcp, unix, TcpStream, UnixStream};

/// The transport to the bus daemon.
#[derive(Debug)]
pub(crate) enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    async fn unix(unix: &Unix) -> Result<Stream, ConnectError> {
        match &unix.r#type {
            UnixType::Path(path) => {
                debug!("connecting to {}", path);
                let mut stream = UnixStream::connect(path).await?;
                Handshake::run(&mut stream, true).await?;
                Ok(Stream::Unix(stream))
            }
            _ => Err(ConnectError::UnsupportedTransport),
        }
    }

    fn family_matches(socket_addr: &SocketAddr, family: &Option<Family>) -> bool {
        match family {
            Some(Family::Ipv4) => socket_addr.is_ipv4(),
            Some(Family::Ipv6) => socket_addr.is_ipv6(),
            None => true,
        }
    }

    async fn tcp_connect(
        socket_addr: &SocketAddr,
        family: &Option<Family>,
    ) -> Result<TcpStream, ConnectError> {
        if !Stream::family_matches(socket_addr, family) {
            return Err(ConnectError::NoMatchingAddress);
        }
        debug!("connecting to {}", socket_addr);
        let mut stream = TcpStream::connect(socket_addr).await?;
        Handshake::run(&mut stream, false).await?;
        Ok(stream)
    }

    async fn tcp(tcp: &Tcp) -> Result<Stream, ConnectError> {
        let (host, port) = match (&tcp.host, tcp.port) {
            (Some(host), Some(port)) => (host, port),
            _ => return Err(ConnectError::NotConnectable),
        };

        if let Ok(ip_addr) = host.parse::<IpAddr>() {
            let socket_addr = SocketAddr::new(ip_addr, port);
            let stream = Stream::tcp_connect(&socket_addr, &tcp.family).await?;
            return Ok(Stream::Tcp(stream));
        }

        let host_port = format!("{}:{}", host, port);
        for socket_addr in lookup_host(host_port).await? {
            match Stream::tcp_connect(&socket_addr, &tcp.family).await {
                Ok(stream) => return Ok(Stream::Tcp(stream)),
                Err(e) => error!("could not connect to {}: {}", socket_addr, e),
            }
        }
        Err(ConnectError::NoMatchingAddress)
    }

    async fn connect_one(address: &Address) -> Result<Stream, ConnectError> {
        if !address.is_connectable() {
            return Err(ConnectError::NotConnectable);
        }
        match address {
            Address::Unix(unix) => Stream::unix(unix).await,
            Address::Tcp(tcp) => Stream::tcp(tcp).await,
            _ => Err(ConnectError::UnsupportedTransport),
        }
    }

    /// Try every address in the list, in order, and keep the first transport
    /// that connects and authenticates.
    pub(crate) async fn connect(addresses: &str) -> Result<(Address, Stream), ConnectError> {
        let addresses = Address::decode(addresses)?;
        for address in addresses.iter() {
            match Stream::connect_one(address).await {
                Ok(stream) => return Ok((address.clone(), stream)),
                Err(e) => error!("could not connect to {}: {}", address, e),
            }
        }
        Err(ConnectError::NoUsableAddress)
    }

    pub(crate) fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Stream::Unix(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Unix(read), WriteHalf::Unix(write))
            }
            Stream::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
        }
    }
}

/// Read half of the transport, so receiving does not contend with sending.
#[derive(Debug)]
pub(crate) enum ReadHalf {
    Unix(unix::OwnedReadHalf),
    Tcp(tcp::OwnedReadHalf),
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        match self.get_mut() {
            ReadHalf::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            ReadHalf::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

/// Write half of the transport.
#[derive(Debug)]
pub(crate) enum WriteHalf {
    Unix(unix::OwnedWriteHalf),
    Tcp(tcp::OwnedWriteHalf),
}

impl AsyncWrite for WriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        match self.get_mut() {
            WriteHalf::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            WriteHalf::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.get_mut() {
            WriteHalf::Unix(stream) => Pin::new(stream).poll_flush(cx),
            WriteHalf::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.get_mut() {
            WriteHalf::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            WriteHalf::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
