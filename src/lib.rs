//! A minimal asynchronous DBus client facade.
//!
//! The crate has three layers. A [`Connection`] owns the only open transport
//! to the bus daemon, performs the handshake and registration, and routes
//! inbound frames through a dispatch table of signal subscriptions. A
//! [`Proxy`] stands in for a remote object at a known destination and object
//! path, and exposes property reads, method calls, signal subscription and
//! introspection by delegating to the connection. An [`EventLoop`] drives the
//! connection's receive loop and invokes subscription callbacks until it is
//! stopped or the connection closes.
//!
//! All dispatch is single-threaded and cooperative: whichever task is driving
//! the event loop (or an in-flight method call) is the only driver of I/O,
//! and callbacks run synchronously on that task.
//!
//! ```no_run
//! use dbus_lite::{BusAddress, Connection, EventLoop, Proxy};
//! use std::convert::TryInto;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::connect(&BusAddress::Session).await?;
//! let proxy = Proxy::new(
//!     "net.sourceforge.cmus".try_into()?,
//!     "/net/sourceforge/cmus".try_into()?,
//!     &connection,
//! );
//!
//! let artist = proxy
//!     .get_property("net.sourceforge.cmus".try_into()?, "artist")
//!     .await?;
//! println!("artist: {:?}", artist);
//!
//! let _subscription = proxy
//!     .subscribe("net.sourceforge.cmus".try_into()?, "track_change", |_msg| {
//!         println!("track changed");
//!         Ok(())
//!     })
//!     .await?;
//!
//! let mut event_loop = EventLoop::new(connection.clone());
//! event_loop.run().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

mod address;
mod connection;
mod error;
mod event_loop;
pub mod proxy;
mod stream;

pub use address::BusAddress;
pub use connection::{CallbackResult, Connection, SignalCallback};
pub use error::{CallError, ConnectError, ReceiveError, TransportError};
pub use event_loop::{EventLoop, LoopHandle, LoopState, RunError};
pub use proxy::{Proxy, ProxyError, ProxyResult, SignalSubscription};
pub use stream::HandshakeError;
