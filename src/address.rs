//! Connection strings, and turning them into a [Listener] or [Connection].
//!
//! ```text
//! pipe:<absolute-path>
//! tcp:<host>:<port>
//! usb:<hex-vid>:<hex-pid>:<serial>
//! ```

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{connection::Connection, listener::Listener};

/// Reasons a connection string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The part before the first `:` is not `pipe`, `tcp` or `usb`.
    #[error("unknown address scheme in {0:?}")]
    UnknownScheme(String),

    /// `pipe:` with nothing after it.
    #[error("pipe address needs a path")]
    EmptyPipePath,

    /// `tcp:` without both a host and a port.
    #[error("tcp address must look like tcp:<host>:<port>, got {0:?}")]
    InvalidTcpAddress(String),

    /// The tcp port is not a 16-bit unsigned integer.
    #[error("invalid tcp port {0:?}")]
    InvalidPort(String),

    /// `usb:` without `<hex-vid>:<hex-pid>:<serial>`.
    #[error("usb address must look like usb:<hex-vid>:<hex-pid>:<serial>, got {0:?}")]
    InvalidUsbAddress(String),
}

/// Failures while binding or connecting an [Address].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Another live server already owns this pipe.
    #[error("another server is already listening on {0}")]
    AlreadyRunning(PathBuf),

    /// Only pipe and tcp addresses can be listened on.
    #[error("can not listen on {0}")]
    ListenNotSupported(Address),

    /// This platform has no support for the scheme.
    #[error("{0} addresses are not supported on this platform")]
    Unsupported(&'static str),

    /// No attached USB device matched the address.
    #[error("no usb device {vendor_id:04x}:{product_id:04x} with serial {serial:?}")]
    DeviceNotFound {
        /// Vendor id searched for.
        vendor_id: u16,
        /// Product id searched for.
        product_id: u16,
        /// Serial number searched for.
        serial: String,
    },

    /// The matched USB device exposes no bulk endpoint pair.
    #[error("usb device has no bulk in/out endpoint pair")]
    NoBulkEndpoints,

    /// Socket level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// libusb failure.
    #[cfg(feature = "usb")]
    #[error(transparent)]
    Usb(#[from] rusb::Error),

    /// The blocking USB worker went away.
    #[error(transparent)]
    Worker(#[from] tokio::task::JoinError),
}

/// A parsed, typed description of how to reach a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// Unix domain socket at a filesystem path.
    Pipe {
        /// Socket path.
        path: PathBuf,
    },

    /// TCP socket.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port number.
        port: u16,
    },

    /// USB device talking over a bulk endpoint pair.
    Usb {
        /// USB vendor id.
        vendor_id: u16,
        /// USB product id.
        product_id: u16,
        /// Serial number, used to tell identical devices apart.
        serial: String,
    },
}

impl Address {
    /// Scheme name as it appears in the connection string.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Pipe { .. } => "pipe",
            Self::Tcp { .. } => "tcp",
            Self::Usb { .. } => "usb",
        }
    }

    /// Bind a [Listener] on this address. Only pipe and tcp can listen.
    ///
    /// A pipe path that is already bound is probed: if something answers,
    /// [TransportError::AlreadyRunning] is returned; if not, the path is
    /// considered stale, removed, and bound once more.
    pub async fn listen(&self) -> Result<Listener, TransportError> {
        match self {
            Self::Pipe { path } => Listener::bind_pipe(path).await,
            Self::Tcp { host, port } => Listener::bind_tcp(host, *port).await,
            Self::Usb { .. } => Err(TransportError::ListenNotSupported(self.clone())),
        }
    }

    /// Open a [Connection] to the peer at this address.
    pub async fn connect(&self) -> Result<Connection, TransportError> {
        match self {
            Self::Pipe { path } => Connection::connect_pipe(path).await,
            Self::Tcp { host, port } => Connection::connect_tcp(host, *port).await,
            Self::Usb {
                vendor_id,
                product_id,
                serial,
            } => Connection::connect_usb(*vendor_id, *product_id, serial).await,
        }
    }
}

fn parse_hex_id(field: &str) -> Option<u16> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = s.split_once(':') else {
            return Err(AddressError::UnknownScheme(s.to_owned()));
        };

        match scheme {
            "pipe" => {
                if rest.is_empty() {
                    return Err(AddressError::EmptyPipePath);
                }
                Ok(Self::Pipe { path: PathBuf::from(rest) })
            }
            "tcp" => {
                let Some((host, port)) = rest.rsplit_once(':') else {
                    return Err(AddressError::InvalidTcpAddress(s.to_owned()));
                };
                if host.is_empty() {
                    return Err(AddressError::InvalidTcpAddress(s.to_owned()));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(port.to_owned()))?;
                Ok(Self::Tcp {
                    host: host.to_owned(),
                    port,
                })
            }
            "usb" => {
                let fields: Vec<&str> = rest.splitn(3, ':').collect();
                let [vendor_id, product_id, serial] = fields[..] else {
                    return Err(AddressError::InvalidUsbAddress(s.to_owned()));
                };
                let (Some(vendor_id), Some(product_id)) = (parse_hex_id(vendor_id), parse_hex_id(product_id)) else {
                    return Err(AddressError::InvalidUsbAddress(s.to_owned()));
                };
                Ok(Self::Usb {
                    vendor_id,
                    product_id,
                    serial: serial.to_owned(),
                })
            }
            _ => Err(AddressError::UnknownScheme(scheme.to_owned())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe { path } => write!(f, "pipe:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Self::Usb {
                vendor_id,
                product_id,
                serial,
            } => write!(f, "usb:{:04x}:{:04x}:{}", vendor_id, product_id, serial),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse() {
        assert_eq!(
            "pipe:/tmp/machined.socket".parse::<Address>().unwrap(),
            Address::Pipe {
                path: PathBuf::from("/tmp/machined.socket")
            }
        );
        assert_eq!(
            "tcp:localhost:9999".parse::<Address>().unwrap(),
            Address::Tcp {
                host: "localhost".to_owned(),
                port: 9999
            }
        );
        assert_eq!(
            "usb:23C1:0x0007:ABC:123".parse::<Address>().unwrap(),
            Address::Usb {
                vendor_id: 0x23c1,
                product_id: 0x0007,
                serial: "ABC:123".to_owned()
            }
        );
    }

    #[test]
    fn test_round_trip() {
        for s in [
            "pipe:/var/run/machined.socket",
            "tcp:127.0.0.1:0",
            "tcp:::1:65535",
            "tcp:printer.local:9999",
            "usb:23c1:d314:0123456789",
            "usb:23C1:D314:",
            "usb:0x1:2:serial",
        ] {
            let parsed: Address = s.parse().unwrap();
            let reparsed: Address = parsed.to_string().parse().unwrap();
            assert_eq!(reparsed, parsed, "{}", s);
        }
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            ("tcp:host", AddressError::InvalidTcpAddress("tcp:host".to_owned())),
            ("tcp::80", AddressError::InvalidTcpAddress("tcp::80".to_owned())),
            ("tcp:host:http", AddressError::InvalidPort("http".to_owned())),
            ("tcp:host:65536", AddressError::InvalidPort("65536".to_owned())),
            ("tcp:host:-1", AddressError::InvalidPort("-1".to_owned())),
            ("usb:1,2", AddressError::InvalidUsbAddress("usb:1,2".to_owned())),
            ("usb:1:2", AddressError::InvalidUsbAddress("usb:1:2".to_owned())),
            ("usb:xyz:2:s", AddressError::InvalidUsbAddress("usb:xyz:2:s".to_owned())),
            ("usb:10000:2:s", AddressError::InvalidUsbAddress("usb:10000:2:s".to_owned())),
            ("pipe:", AddressError::EmptyPipePath),
            ("serial:/dev/ttyUSB0", AddressError::UnknownScheme("serial".to_owned())),
            ("/tmp/socket", AddressError::UnknownScheme("/tmp/socket".to_owned())),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<Address>().unwrap_err(), expected, "{}", input);
        }
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Deserialize, Serialize)]
        struct Holder {
            address: Address,
        }

        let holder: Holder = toml::from_str(r#"address = "tcp:127.0.0.1:9999""#).unwrap();
        assert_eq!(holder.address.scheme(), "tcp");
        assert_eq!(toml::to_string(&holder).unwrap().trim(), r#"address = "tcp:127.0.0.1:9999""#);

        assert!(toml::from_str::<Holder>(r#"address = "tcp:nope""#).is_err());
    }

    #[tokio::test]
    async fn test_usb_can_not_listen() {
        let address: Address = "usb:1:2:3".parse().unwrap();
        assert!(matches!(
            address.listen().await,
            Err(TransportError::ListenNotSupported(_))
        ));
    }
}
