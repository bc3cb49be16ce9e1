//! Network endpoint types.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// IP family a receiver binds to when no explicit address is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Ipv4,
    Ipv6,
}

impl Protocol {
    /// The any-address of this family.
    #[must_use]
    pub const fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// All interfaces of the given family on `port`.
    #[must_use]
    pub const fn any(protocol: Protocol, port: u16) -> Self {
        Self::new(protocol.unspecified(), port)
    }

    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Parses a bind address for a receiver.
    ///
    /// An empty string selects the any-address of `protocol`.
    ///
    /// # Errors
    ///
    /// Returns the parse error if `address` is neither empty nor an IP.
    pub fn resolve(
        address: &str,
        port: u16,
        protocol: Protocol,
    ) -> Result<Self, std::net::AddrParseError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Ok(Self::any(protocol, port));
        }
        Ok(Self::new(trimmed.parse()?, port))
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a remote sender.
///
/// The source port is deliberately excluded: a peer sends from an
/// ephemeral port that may differ from the one it listens on, while its
/// address and `sender_id` stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub address: IpAddr,
    pub sender_id: u32,
}

impl EndpointId {
    #[must_use]
    pub const fn new(address: IpAddr, sender_id: u32) -> Self {
        Self { address, sender_id }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.address, self.sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_empty_uses_family_any() {
        let v4 = Endpoint::resolve("", 9000, Protocol::Ipv4).unwrap();
        assert_eq!(v4.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(v4.port(), 9000);

        let v6 = Endpoint::resolve("  ", 9001, Protocol::Ipv6).unwrap();
        assert_eq!(v6.ip(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn resolve_explicit_address() {
        let ep = Endpoint::resolve("192.168.1.20", 8888, Protocol::Ipv4).unwrap();
        assert_eq!(ep, Endpoint::new_v4(192, 168, 1, 20, 8888));
        assert!(Endpoint::resolve("not-an-ip", 1, Protocol::Ipv4).is_err());
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::new_v4(127, 0, 0, 1, 8080);
        assert_eq!(format!("{ep}"), "127.0.0.1:8080");
    }

    #[test]
    fn endpoint_id_ignores_port() {
        let a = EndpointId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7);
        let b = EndpointId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7);
        assert_eq!(a, b);
        assert_eq!(format!("{a}"), "127.0.0.1#00000007");
    }
}
