//! Types returned by [`Proxy::introspect`], deserialized from the standard
//! [introspection XML] format.
//!
//! [introspection XML]: https://dbus.freedesktop.org/doc/dbus-specification.html#introspection-format

use super::{Proxy, ProxyError};
use dbus_message_parser::message::Message;
use dbus_message_parser::value::Value;
use serde_derive::Deserialize;
use std::convert::TryInto;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntrospectError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("Reply carried no introspection XML")]
    NoData,
    #[error("Could not parse introspection XML: {0}")]
    Xml(#[from] serde_xml_rs::Error),
}

impl<'a> Proxy<'a> {
    /// Ask the object to describe itself via
    /// `org.freedesktop.DBus.Introspectable.Introspect`.
    ///
    /// Best effort: plenty of services do not implement it, so a failure
    /// here does not prevent using the proxy with static knowledge.
    pub async fn introspect(&self) -> Result<Node, IntrospectError> {
        let msg = Message::method_call(
            self.destination.clone(),
            self.object_path.clone(),
            "org.freedesktop.DBus.Introspectable".try_into().unwrap(),
            "Introspect".try_into().unwrap(),
        );
        let reply = self.call(msg).await?;
        match reply.get_body().get(0) {
            Some(Value::String(xml)) => Ok(serde_xml_rs::from_str(xml)?),
            _ => Err(IntrospectError::NoData),
        }
    }
}

/// One node of the object tree: its interfaces and child nodes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Node {
    pub name: Option<String>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<Interface>,
    #[serde(rename = "node", default)]
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Interface {
    pub name: String,
    #[serde(rename = "method", default)]
    pub methods: Vec<Method>,
    #[serde(rename = "signal", default)]
    pub signals: Vec<Signal>,
    #[serde(rename = "property", default)]
    pub properties: Vec<Property>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Method {
    pub name: String,
    #[serde(rename = "arg", default)]
    pub args: Vec<MethodArg>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Signal {
    pub name: String,
    #[serde(rename = "arg", default)]
    pub args: Vec<SignalArg>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub signature: String,
    pub access: Access,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MethodArg {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub signature: String,
    #[serde(default = "method_arg_direction")]
    pub direction: Direction,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SignalArg {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub signature: String,
    #[serde(default = "signal_arg_direction")]
    pub direction: Direction,
}

// Unannotated method args are inputs; signal args are always outputs.
fn method_arg_direction() -> Direction {
    Direction::In
}

fn signal_arg_direction() -> Direction {
    Direction::Out
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "out")]
    Out,
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
pub enum Access {
    #[serde(rename = "readwrite")]
    ReadWrite,
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "write")]
    Write,
}
