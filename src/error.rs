use crate::stream::HandshakeError;
use dbus_message_parser::decode::DecodeError;
use dbus_message_parser::encode::EncodeError;
use dbus_server_address_parser::DecodeError as AddressDecodeError;
use std::io::Error as IoError;
use thiserror::Error;

/// Errors that are fatal to establishing a [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("DBUS_SESSION_BUS_ADDRESS environment variable is not defined")]
    SessionBusAddress,
    #[error("Could not parse address: {0}")]
    Address(#[from] AddressDecodeError),
    #[error("Address is not connectable")]
    NotConnectable,
    #[error("Transport is not supported")]
    UnsupportedTransport,
    #[error("Could not resolve an IP address matching the requested family")]
    NoMatchingAddress,
    #[error("Could not connect to any address")]
    NoUsableAddress,
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Hello failed: {0}")]
    Hello(String),
    #[error(transparent)]
    Call(#[from] CallError),
}

/// A send failed before the frame reached the socket. Not fatal to the
/// connection; the caller may retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Could not encode message: {0:?}")]
    Encode(EncodeError),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("Connection is closed")]
    Closed,
}

/// Errors from [`Connection::receive_next`](crate::Connection::receive_next).
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The connection was closed, locally or by the peer. Terminal: every
    /// later receive fails the same way.
    #[error("Connection is closed")]
    Closed,
    #[error("Could not decode message: {0:?}")]
    Decode(DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

/// A method call round trip failed before a reply arrived.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}
