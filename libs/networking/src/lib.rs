//! Transport address helpers for the proxy.
//!
//! This library provides:
//! - Transport family selection (`tcp4` / `tcp6`) for a resolved address
//! - The immutable backend endpoint the proxy forwards to
//!
//! The socket layer used by the proxy does not take a generic "tcp" token:
//! an IPv4 or IPv6 socket has to be created explicitly, so callers must
//! disambiguate the family of every address they bind or dial.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid socket address.
    #[error("invalid socket address: {0}")]
    InvalidAddress(String),
}

// ============================================================================
// Transport family
// ============================================================================

/// Transport family of a TCP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6.
    Tcp6,
}

impl TransportFamily {
    /// Network token for this family.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportFamily::Tcp4 => "tcp4",
            TransportFamily::Tcp6 => "tcp6",
        }
    }

    /// Family of a socket address.
    pub fn of(addr: &SocketAddr) -> Self {
        if ipv4_representation(addr.ip()).is_some() {
            TransportFamily::Tcp4
        } else {
            TransportFamily::Tcp6
        }
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPv4 form of an address, if it has one.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) count as IPv4. The deprecated
/// IPv4-compatible form (`::a.b.c.d`) does not.
fn ipv4_representation(ip: IpAddr) -> Option<std::net::Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Rewrite an IPv4-mapped IPv6 address to plain IPv4.
///
/// This is the address a socket of [`TransportFamily::of`] can bind or
/// connect to. Every other address is returned unchanged.
pub fn unmap_ipv4(addr: SocketAddr) -> SocketAddr {
    match ipv4_representation(addr.ip()) {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
        None => addr,
    }
}

/// Decode a resolved address into its transport family and address text.
///
/// Returns `tcp4` when the address has an IPv4 representation and `tcp6`
/// otherwise. The address text is the address's own display form.
pub fn decode_address(addr: SocketAddr) -> (TransportFamily, String) {
    (TransportFamily::of(&addr), addr.to_string())
}

// ============================================================================
// Backend endpoint
// ============================================================================

/// The fixed endpoint that authorized traffic is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    family: TransportFamily,
    address: String,
    socket_addr: SocketAddr,
}

impl BackendEndpoint {
    /// Create an endpoint from a resolved address.
    pub fn new(socket_addr: SocketAddr) -> Self {
        let (family, address) = decode_address(socket_addr);
        Self {
            family,
            address,
            socket_addr,
        }
    }

    /// Transport family derived from the resolved address.
    pub fn family(&self) -> TransportFamily {
        self.family
    }

    /// Address text, exactly as resolved.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The resolved socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Address to connect a socket of [`Self::family`] to.
    ///
    /// IPv4-mapped IPv6 addresses are unwrapped so an IPv4 socket can reach
    /// them. Every other address is returned as is.
    pub fn dial_addr(&self) -> SocketAddr {
        unmap_ipv4(self.socket_addr)
    }
}

impl FromStr for BackendEndpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr =
            SocketAddr::from_str(s).map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(addr))
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.5:8080", "tcp4")]
    #[case("127.0.0.1:1", "tcp4")]
    #[case("0.0.0.0:443", "tcp4")]
    #[case("[::ffff:10.0.0.5]:8080", "tcp4")]
    #[case("[::1]:443", "tcp6")]
    #[case("[fd00::1]:8080", "tcp6")]
    #[case("[::]:443", "tcp6")]
    #[case("[::10.0.0.5]:80", "tcp6")]
    fn test_decode_address(#[case] input: &str, #[case] expected: &str) {
        let addr: SocketAddr = input.parse().unwrap();
        let (family, text) = decode_address(addr);
        assert_eq!(family.as_str(), expected);
        assert_eq!(text, addr.to_string());
    }

    #[test]
    fn test_decode_address_keeps_mapped_text() {
        let addr: SocketAddr = "[::ffff:10.0.0.5]:8080".parse().unwrap();
        let (family, text) = decode_address(addr);
        assert_eq!(family, TransportFamily::Tcp4);
        assert_eq!(text, "[::ffff:10.0.0.5]:8080");
    }

    #[test]
    fn test_endpoint_dial_addr() {
        let mapped: BackendEndpoint = "[::ffff:10.0.0.5]:8080".parse().unwrap();
        assert_eq!(mapped.family(), TransportFamily::Tcp4);
        assert_eq!(mapped.address(), "[::ffff:10.0.0.5]:8080");
        assert_eq!(
            mapped.dial_addr(),
            "10.0.0.5:8080".parse::<SocketAddr>().unwrap()
        );

        let v6: BackendEndpoint = "[fd00::1]:8080".parse().unwrap();
        assert_eq!(v6.family(), TransportFamily::Tcp6);
        assert_eq!(v6.dial_addr(), v6.socket_addr());
    }

    #[test]
    fn test_unmap_ipv4() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:9000".parse().unwrap();
        assert_eq!(unmap_ipv4(mapped).to_string(), "127.0.0.1:9000");

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(unmap_ipv4(v6), v6);
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint: BackendEndpoint = "10.0.0.5:8080".parse().unwrap();
        assert_eq!(endpoint.to_string(), "tcp4/10.0.0.5:8080");
    }

    #[test]
    fn test_endpoint_rejects_hostname() {
        let err = "backend.internal:8080".parse::<BackendEndpoint>().unwrap_err();
        assert!(matches!(err, NetworkError::InvalidAddress(_)));
    }
}
