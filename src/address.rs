use crate::error::ConnectError;
use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// The well-known fallback of the system bus, used when
/// `DBUS_SYSTEM_BUS_ADDRESS` is not defined.
const SYSTEM_BUS_FALLBACK: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Identifies which bus to connect to. Chosen once, at connect time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusAddress {
    /// The per-login session bus. The `DBUS_SESSION_BUS_ADDRESS` environment
    /// variable **has to** be defined.
    Session,
    /// The system bus. Uses `DBUS_SYSTEM_BUS_ADDRESS` if defined, else the
    /// well-known socket path.
    System,
    /// A literal server address in the DBus [address grammar], for example
    /// `unix:path=/tmp/bus`.
    ///
    /// [address grammar]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses
    Address(String),
}

impl BusAddress {
    /// Resolve to a server address string. The result may contain multiple
    /// addresses separated by `;`; they are tried in order at connect time.
    pub(crate) fn resolve(&self) -> Result<String, ConnectError> {
        match self {
            BusAddress::Session => match env::var("DBUS_SESSION_BUS_ADDRESS") {
                Ok(addresses) => Ok(addresses),
                Err(_) => Err(ConnectError::SessionBusAddress),
            },
            BusAddress::System => match env::var("DBUS_SYSTEM_BUS_ADDRESS") {
                Ok(addresses) => Ok(addresses),
                Err(_) => Ok(SYSTEM_BUS_FALLBACK.to_string()),
            },
            BusAddress::Address(addresses) => Ok(addresses.clone()),
        }
    }
}

impl Display for BusAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BusAddress::Session => write!(f, "session bus"),
            BusAddress::System => write!(f, "system bus"),
            BusAddress::Address(addresses) => write!(f, "{}", addresses),
        }
    }
}
