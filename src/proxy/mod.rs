//! Client-side stand-ins for remote objects: the [`Proxy`] type and signal
//! subscriptions.

pub mod introspect;

use crate::connection::{CallbackResult, Connection, SubscriptionId};
use crate::error::CallError;
use dbus_message_parser::message::{Message, MessageType};
use dbus_message_parser::value::{Bus, Interface, Member, MemberError, ObjectPath, Value};
use std::collections::HashMap;
use std::convert::TryInto;
use thiserror::Error;

/// The error name well-behaved services report for a missing property.
const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Call(#[from] CallError),
    /// The remote object has no such property.
    #[error("No such property: {0}")]
    NoSuchProperty(String),
    /// Any other error reported by the remote side.
    #[error("{name}: {text}")]
    Remote { name: String, text: String },
    #[error("Reply had an unexpected shape: {0:?}")]
    UnexpectedReply(Message),
    #[error(transparent)]
    Member(#[from] MemberError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// A client-side stand-in for a remote object: a destination (service name)
/// plus an object path, sharing the caller's [`Connection`].
///
/// Creating a proxy has no effect on the remote side; it can be built from
/// static knowledge or after [`introspect`](Proxy::introspect)ing the object.
pub struct Proxy<'a> {
    destination: Bus,
    object_path: ObjectPath,
    connection: &'a Connection,
}

impl<'a> Proxy<'a> {
    pub fn new(destination: Bus, object_path: ObjectPath, connection: &'a Connection) -> Proxy<'a> {
        Proxy {
            destination,
            object_path,
            connection,
        }
    }

    pub fn destination(&self) -> &Bus {
        &self.destination
    }

    pub fn object_path(&self) -> &ObjectPath {
        &self.object_path
    }

    async fn call(&self, msg: Message) -> ProxyResult<Message> {
        if log_enabled!(log::Level::Trace) {
            if let (Some(interface), Some(member)) = (msg.get_interface(), msg.get_member()) {
                trace!("{} {}.{}", self.object_path, interface, member);
            }
        }
        let reply = self.connection.call(msg).await?;
        if reply.get_type() == MessageType::Error {
            return Err(remote_error(reply));
        }
        Ok(reply)
    }

    /// Call `interface.member(args)` on the remote object.
    pub async fn method_call<A>(
        &self,
        interface: Interface,
        member: Member,
        args: A,
    ) -> ProxyResult<Message>
    where
        A: IntoIterator<Item = Value>,
    {
        let mut msg = Message::method_call(
            self.destination.clone(),
            self.object_path.clone(),
            interface,
            member,
        );
        for value in args {
            msg.add_value(value);
        }
        self.call(msg).await
    }

    /// Read one property via `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(
        &self,
        interface: Interface,
        property: &str,
    ) -> ProxyResult<Box<Value>> {
        let msg = Message::property_get(
            self.destination.clone(),
            self.object_path.clone(),
            interface,
            property,
        );
        let reply = match self.call(msg).await {
            Ok(reply) => reply,
            Err(ProxyError::Remote { name, .. }) if name == UNKNOWN_PROPERTY => {
                return Err(ProxyError::NoSuchProperty(property.to_string()));
            }
            Err(e) => return Err(e),
        };
        let mut body = reply.get_body().to_vec();
        if body.len() == 1 {
            if let Some(Value::Variant(value)) = body.pop() {
                return Ok(value);
            }
        }
        Err(ProxyError::UnexpectedReply(reply))
    }

    /// Read every property of `interface` via
    /// `org.freedesktop.DBus.Properties.GetAll`.
    pub async fn get_properties(
        &self,
        interface: Interface,
    ) -> ProxyResult<HashMap<String, Box<Value>>> {
        let msg = Message::properties_get_all(
            self.destination.clone(),
            self.object_path.clone(),
            interface,
        );
        let reply = self.call(msg).await?;
        let mut properties = HashMap::new();
        if let Some(Value::Array(entries)) = reply.get_body().get(0) {
            for entry in entries.as_ref() {
                if let Value::DictEntry(entry) = entry {
                    if let (Value::String(name), Value::Variant(value)) = entry.as_ref() {
                        properties.insert(name.clone(), value.clone());
                    }
                }
            }
            return Ok(properties);
        }
        Err(ProxyError::UnexpectedReply(reply))
    }

    /// Write one property via `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(
        &self,
        interface: Interface,
        property: &str,
        value: Value,
    ) -> ProxyResult<()> {
        let msg = Message::property_set(
            self.destination.clone(),
            self.object_path.clone(),
            interface,
            property,
            value,
        );
        self.call(msg).await?;
        Ok(())
    }

    /// Subscribe to `interface.signal` emitted by this object.
    ///
    /// Installs a match rule at the daemon and registers the callback in the
    /// connection's dispatch table. The callback runs synchronously on the
    /// task driving the event loop; keep it short or other subscriptions
    /// starve.
    pub async fn subscribe<F>(
        &self,
        interface: Interface,
        signal: &str,
        callback: F,
    ) -> ProxyResult<SignalSubscription>
    where
        F: FnMut(&Message) -> CallbackResult + Send + 'static,
    {
        let member: Member = signal.try_into()?;
        let mut msg = Message::method_call(
            "org.freedesktop.DBus".try_into().unwrap(),
            "/org/freedesktop/DBus".try_into().unwrap(),
            "org.freedesktop.DBus".try_into().unwrap(),
            "AddMatch".try_into().unwrap(),
        );
        msg.add_value(Value::String(format!(
            "type='signal',sender='{}',path='{}',interface='{}',member='{}'",
            self.destination, self.object_path, interface, member,
        )));
        self.call(msg).await?;

        let id = self.connection.add_signal(
            self.object_path.to_string(),
            interface.to_string(),
            member.to_string(),
            Box::new(callback),
        );
        Ok(SignalSubscription {
            id,
            connection: self.connection.clone(),
        })
    }
}

fn remote_error(reply: Message) -> ProxyError {
    let name = reply
        .get_error_name()
        .map(|name| name.to_string())
        .unwrap_or_default();
    let text = match reply.get_body().get(0) {
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    };
    ProxyError::Remote { name, text }
}

/// A registered signal subscription.
///
/// Lives until [`cancel`](SignalSubscription::cancel) is called or the owning
/// connection closes; dropping the value leaves the subscription in place.
pub struct SignalSubscription {
    id: SubscriptionId,
    connection: Connection,
}

impl SignalSubscription {
    /// Remove the callback from the dispatch table. Frames already dispatched
    /// are unaffected; nothing further is delivered.
    pub fn cancel(self) {
        self.connection.remove_signal(self.id);
    }
}
