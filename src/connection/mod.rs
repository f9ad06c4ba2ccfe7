mod dispatch;

pub use dispatch::{CallbackResult, SignalCallback};
pub(crate) use dispatch::SubscriptionId;

use crate::address::BusAddress;
use crate::error::{CallError, ConnectError, ReceiveError, TransportError};
use crate::stream::{ReadHalf, Stream, WriteHalf};
use bytes::{Buf, BytesMut};
use dbus_message_parser::decode::DecodeError;
use dbus_message_parser::message::{Message, MessageType};
use dbus_message_parser::value::Value;
use dispatch::DispatchTable;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};

struct Reader {
    half: ReadHalf,
    /// Bytes read from the socket but not yet decoded. A partial frame stays
    /// here across calls.
    buffer: BytesMut,
}

struct Inner {
    server_address: String,
    unique_name: Option<String>,
    reader: AsyncMutex<Reader>,
    writer: AsyncMutex<WriteHalf>,
    serial: AtomicU32,
    dispatch: StdMutex<DispatchTable>,
    closed: watch::Sender<bool>,
    // Held for the connection's lifetime so `closed.send` always has a
    // receiver and the flag is never lost.
    closed_rx: watch::Receiver<bool>,
}

/// A handle to the single open transport to the bus daemon.
///
/// Cheap to clone; every clone shares the same socket, serial counter and
/// dispatch table. Proxies read from and register into the connection but
/// never close it; [`close`](Connection::close) is the owner's call.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to the bus at `address`: open the transport, authenticate and
    /// register with the daemon (`Hello()`).
    pub async fn connect(address: &BusAddress) -> Result<Connection, ConnectError> {
        let addresses = address.resolve()?;
        let (server_address, stream) = Stream::connect(&addresses).await?;
        let (read, write) = stream.into_split();

        let (closed, closed_rx) = watch::channel(false);
        let mut connection = Connection {
            inner: Arc::new(Inner {
                server_address: server_address.to_string(),
                unique_name: None,
                reader: AsyncMutex::new(Reader {
                    half: read,
                    buffer: BytesMut::new(),
                }),
                writer: AsyncMutex::new(write),
                serial: AtomicU32::new(0),
                dispatch: StdMutex::new(DispatchTable::default()),
                closed,
                closed_rx,
            }),
        };

        let unique_name = connection.hello().await?;
        debug!(
            "connected to {} as {}",
            connection.inner.server_address, unique_name
        );
        // No other clone exists yet, so this always succeeds.
        if let Some(inner) = Arc::get_mut(&mut connection.inner) {
            inner.unique_name = Some(unique_name);
        }
        Ok(connection)
    }

    /// Call the `Hello()` method of the daemon to get our unique name.
    async fn hello(&self) -> Result<String, ConnectError> {
        let msg = Message::method_call(
            "org.freedesktop.DBus".try_into().unwrap(),
            "/org/freedesktop/DBus".try_into().unwrap(),
            "org.freedesktop.DBus".try_into().unwrap(),
            "Hello".try_into().unwrap(),
        );
        let reply = self.call(msg).await?;
        if reply.get_type() == MessageType::Error {
            let error = reply
                .get_error_name()
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no error name".to_string());
            return Err(ConnectError::Hello(error));
        }
        match reply.get_body().get(0) {
            Some(Value::String(unique_name)) => Ok(unique_name.clone()),
            _ => Err(ConnectError::Hello("reply carried no unique name".to_string())),
        }
    }

    /// The server address the transport was established against.
    pub fn server_address(&self) -> &str {
        &self.inner.server_address
    }

    /// The unique name the daemon assigned at registration.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.as_deref()
    }

    /// Send a message. Returns the serial number assigned to it.
    pub async fn send(&self, mut msg: Message) -> Result<u32, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed) + 1;
        msg.set_serial(serial);
        let bytes = msg.encode().map_err(TransportError::Encode)?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(serial)
    }

    /// Send a method call and wait for its reply, which may be a
    /// `MethodReturn` or an `Error` message.
    ///
    /// Frames that are not the awaited reply are routed through the dispatch
    /// table meanwhile, so signals arriving during the round trip are not
    /// lost.
    pub async fn call(&self, msg: Message) -> Result<Message, CallError> {
        let serial = self.send(msg).await?;
        loop {
            let msg = self.receive_next().await?;
            if msg.get_reply_serial() == Some(serial) {
                return Ok(msg);
            }
            self.dispatch(&msg);
        }
    }

    /// Receive the next frame, waiting until one whole message has been
    /// decoded.
    ///
    /// Fails with [`ReceiveError::Closed`] instead of hanging once the
    /// connection is closed, locally or by the peer.
    pub async fn receive_next(&self) -> Result<Message, ReceiveError> {
        let mut closed = self.inner.closed_rx.clone();
        if *closed.borrow() {
            return Err(ReceiveError::Closed);
        }
        let mut guard = tokio::select! {
            guard = self.inner.reader.lock() => guard,
            _ = closed.changed() => return Err(ReceiveError::Closed),
        };
        let reader = &mut *guard;
        loop {
            if !reader.buffer.is_empty() {
                match Message::decode(reader.buffer.clone().freeze()) {
                    Ok((msg, read)) => {
                        reader.buffer.advance(read);
                        return Ok(msg);
                    }
                    Err(DecodeError::NotEnoughBytes(have, need)) => {
                        trace!("partial frame: {} of {} bytes", have, need);
                    }
                    Err(e) => return Err(ReceiveError::Decode(e)),
                }
            }
            let read = tokio::select! {
                read = reader.half.read_buf(&mut reader.buffer) => read?,
                _ = closed.changed() => return Err(ReceiveError::Closed),
            };
            if read == 0 {
                // EOF: the daemon went away.
                self.close();
                return Err(ReceiveError::Closed);
            }
        }
    }

    /// Route a frame to the matching signal subscriptions. Callback errors
    /// are logged here, at the dispatch boundary, and never propagate.
    pub fn dispatch(&self, msg: &Message) {
        if msg.get_type() != MessageType::Signal {
            debug!("unhandled frame: {:?}", msg);
            return;
        }
        let (path, interface, member) =
            match (msg.get_path(), msg.get_interface(), msg.get_member()) {
                (Some(path), Some(interface), Some(member)) => {
                    (path.to_string(), interface.to_string(), member.to_string())
                }
                _ => {
                    // A valid signal carries all three envelope fields.
                    debug!("signal without full envelope: {:?}", msg);
                    return;
                }
            };

        let callbacks = self.lock_dispatch().matching(&path, &interface, &member);
        if callbacks.is_empty() {
            debug!("unhandled signal: {}.{} at {}", interface, member, path);
            return;
        }
        for callback in callbacks {
            let mut callback = callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = callback(msg) {
                error!("signal callback failed for {}.{}: {}", interface, member, e);
            }
        }
    }

    /// Close the connection. Blocked receivers are woken and fail with
    /// [`ReceiveError::Closed`]; every registered subscription is dropped.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        // An Err only means no receiver is currently subscribed.
        let _ = self.inner.closed.send(true);
        debug!("connection to {} closed", self.inner.server_address);
        self.lock_dispatch().clear();
    }

    /// Whether [`close`](Connection::close) was called or the peer hung up.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_rx.borrow()
    }

    pub(crate) fn add_signal(
        &self,
        path: String,
        interface: String,
        member: String,
        callback: SignalCallback,
    ) -> SubscriptionId {
        self.lock_dispatch().add_signal(path, interface, member, callback)
    }

    pub(crate) fn remove_signal(&self, id: SubscriptionId) {
        self.lock_dispatch().remove_signal(id);
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, DispatchTable> {
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
