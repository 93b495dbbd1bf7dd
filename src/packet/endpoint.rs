use crate::types::NetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A destination the guest may (or may not) reach: an IPv4 address and port.
/// Compares by value and hashes, so it can key allowlists and flow tables.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint { addr, port }
    }

    pub fn octets(&self) -> [u8; 4] {
        self.addr.octets()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(sa: SocketAddrV4) -> Self {
        Endpoint::new(*sa.ip(), sa.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetError::InvalidEndpoint(s.to_string()))?;
        let addr = Ipv4Addr::from_str(addr).map_err(|_| NetError::InvalidEndpoint(s.to_string()))?;
        let port = u16::from_str(port).map_err(|_| NetError::InvalidEndpoint(s.to_string()))?;
        Ok(Endpoint { addr, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_display_roundtrip() {
        let e: Endpoint = "203.0.113.50:51900".parse().unwrap();
        assert_eq!(e.addr, Ipv4Addr::new(203, 0, 113, 50));
        assert_eq!(e.port, 51900);
        assert_eq!(e.to_string().parse::<Endpoint>().unwrap(), e);
    }

    #[test]
    fn rejects_malformed() {
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!("256.0.0.1:1".parse::<Endpoint>().is_err());
        assert!("1.2.3.4:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn value_equality() {
        let a = Endpoint::new(Ipv4Addr::new(10, 99, 0, 1), 51900);
        let b: Endpoint = "10.99.0.1:51900".parse().unwrap();
        assert_eq!(a, b);
    }
}
