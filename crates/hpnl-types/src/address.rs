use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IPv4 endpoint address of a listener or a connection side.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address in network byte order (big-endian).
    pub ip: u32,
    /// Port number.
    pub port: u16,
}

impl Address {
    /// Wildcard IP used by listeners that accept on every interface.
    pub const UNSPECIFIED_IP: u32 = 0;

    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// Create an address from four octets and a port.
    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    /// Loopback address `127.0.0.1:port`.
    pub fn localhost(port: u16) -> Self {
        Self::from_octets(127, 0, 0, 1, port)
    }

    /// Resolve a host string (dotted quad, `localhost` or `*`) and a port.
    pub fn from_host(host: &str, port: u16) -> Result<Self, AddressParseError> {
        match host {
            "localhost" => Ok(Self::localhost(port)),
            "*" => Ok(Self::new(Self::UNSPECIFIED_IP, port)),
            _ => {
                let ip: Ipv4Addr = host
                    .parse()
                    .map_err(|_| AddressParseError::InvalidIp(host.to_string()))?;
                Ok(Self::new(u32::from(ip), port))
            }
        }
    }

    /// Return the four IP octets.
    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    /// Whether the IP part is the wildcard address.
    pub fn is_unspecified(&self) -> bool {
        self.ip == Self::UNSPECIFIED_IP
    }

    /// Same port, wildcard IP.
    pub fn with_unspecified_ip(&self) -> Self {
        Self::new(Self::UNSPECIFIED_IP, self.port)
    }

    pub fn to_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(u32::from(*sa.ip()), sa.port())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parse `"host:port"`, where host is anything accepted by [`Address::from_host`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(port.to_string()))?;
        Self::from_host(host, port)
    }
}

/// Errors when parsing an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),
}
