//! Address types for candidate bookkeeping.
//!
//! `TransportAddress` keeps the full socket address (including any IPv6
//! scope id, which is needed to bind link-local sockets) but compares and
//! hashes without it, and strips it when the address is serialised for the
//! peer. Two candidates differing only in scope are the same candidate.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr, SocketAddrV6};

use serde::{Deserialize, Serialize};

/// An `(IP, port)` pair with family preserved.
#[derive(Debug, Clone, Copy)]
pub struct TransportAddress(SocketAddr);

impl TransportAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The full socket address, scope id included. Use for binding and
    /// sending only.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// The address as shown to the peer: scope id removed.
    pub fn unscoped(&self) -> SocketAddr {
        match self.0 {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => {
                SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), v6.flowinfo(), 0))
            }
            other => other,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// fe80::/10
    pub fn is_ipv6_link_local(&self) -> bool {
        match self.0.ip() {
            IpAddr::V6(ip) => (ip.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(_) => false,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.0.ip().is_loopback()
    }

    /// Candidates are only paired within one address family.
    pub fn same_family(&self, other: &Self) -> bool {
        self.0.is_ipv4() == other.0.is_ipv4()
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl PartialEq for TransportAddress {
    fn eq(&self, other: &Self) -> bool {
        // scope ids are deliberately ignored
        self.0.ip() == other.0.ip() && self.0.port() == other.0.port()
    }
}

impl Eq for TransportAddress {}

impl Hash for TransportAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.ip().hash(state);
        self.0.port().hash(state);
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unscoped())
    }
}

/// A local interface address an agent may gather candidates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddress {
    pub addr: IpAddr,
    /// Network (interface) id; distinct networks get distinct local
    /// preferences when priorities are computed.
    pub network: u32,
    /// VPN interfaces get the lowest host type preference.
    pub is_vpn: bool,
}

impl LocalAddress {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            network: 0,
            is_vpn: false,
        }
    }
}

/// Operator-supplied static NAT mapping for a local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddress {
    pub base: LocalAddress,
    pub addr: IpAddr,
    /// When `None`, any local port on `base` qualifies for the mapping.
    pub port_base: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_scope_id_ignored_in_comparison() {
        let scoped: SocketAddr = "[fe80::1%3]:5000".parse().unwrap_or_else(|_| {
            // some libcs reject %zone parsing; build it by hand
            SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 5000, 0, 3))
        });
        let plain: SocketAddr = "[fe80::1]:5000".parse().unwrap();

        let a = TransportAddress::from(scoped);
        let b = TransportAddress::from(plain);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_unscoped_strips_zone() {
        let scoped = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 5000, 0, 7));
        let addr = TransportAddress::from(scoped);
        assert!(addr.is_ipv6_link_local());
        match addr.unscoped() {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 0),
            _ => panic!("family changed"),
        }
        // the bindable form keeps the zone
        match addr.socket_addr() {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 7),
            _ => panic!("family changed"),
        }
    }

    #[test]
    fn test_family_matching() {
        let v4 = TransportAddress::new("192.0.2.1".parse().unwrap(), 1);
        let v6 = TransportAddress::new("2001:db8::1".parse().unwrap(), 1);
        assert!(v4.same_family(&v4));
        assert!(!v4.same_family(&v6));
    }
}
