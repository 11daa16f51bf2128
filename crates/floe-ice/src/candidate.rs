//! Candidate model: types, priorities, foundations, and the signalling
//! exchange shape.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addr::TransportAddress;
use crate::credentials::random_credential;

/// Candidate type per RFC 8445 Section 5.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    /// Type preference for the priority formula. Peer-reflexive outranks
    /// server-reflexive (RFC 8445 B.7); VPN hosts drop to the bottom.
    pub fn type_preference(self, is_vpn: bool) -> u32 {
        match self {
            CandidateType::Host => {
                if is_vpn {
                    0
                } else {
                    126
                }
            }
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::Relayed => write!(f, "relay"),
        }
    }
}

impl FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(()),
        }
    }
}

/// Candidate priority per RFC 8445 Section 5.1.2.1:
/// `(typePref << 24) | (localPref << 8) | (256 - componentId)`.
pub fn candidate_priority(type_pref: u32, local_pref: u32, component_id: u16) -> u32 {
    debug_assert!(type_pref <= 126);
    debug_assert!(local_pref <= 65535);
    debug_assert!((1..=256).contains(&component_id));
    (type_pref << 24) | (local_pref << 8) | (256 - component_id as u32)
}

/// Everything the check-list logic needs to know about one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub component_id: u16,
    pub kind: CandidateType,
    pub addr: TransportAddress,
    pub base: TransportAddress,
    pub related: Option<TransportAddress>,
    pub priority: u32,
    pub foundation: String,
    pub network: u32,
    /// Signalling-level id, unique within the agent
    pub id: String,
}

impl CandidateInfo {
    /// Remote peer-reflexive candidate learned from an inbound check
    /// (RFC 8445 Section 7.3.1.3). The foundation is random: nothing groups
    /// with a candidate the peer never signalled.
    pub fn remote_peer_reflexive(component_id: u16, addr: TransportAddress, priority: u32) -> Self {
        Self {
            component_id,
            kind: CandidateType::PeerReflexive,
            addr,
            base: addr,
            related: None,
            priority,
            foundation: random_credential(8),
            network: 0,
            id: random_credential(10),
        }
    }
}

impl std::fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (prio {}, fnd {})",
            self.kind, self.addr, self.priority, self.foundation
        )
    }
}

/// Protocol a candidate's discovery used; part of the foundation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FoundationProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FoundationKey {
    kind: CandidateType,
    base: IpAddr,
    server: Option<IpAddr>,
    proto: FoundationProtocol,
}

/// Interns a deterministic foundation string per
/// `(type, base IP, server IP, protocol)`: candidates sharing a NAT pinhole
/// share a foundation (RFC 8445 Section 5.1.1.3).
#[derive(Debug, Default)]
pub struct FoundationRegistry {
    map: HashMap<FoundationKey, String>,
}

impl FoundationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foundation(
        &mut self,
        kind: CandidateType,
        base: IpAddr,
        server: Option<IpAddr>,
        proto: FoundationProtocol,
    ) -> String {
        self.map
            .entry(FoundationKey {
                kind,
                base,
                server,
                proto,
            })
            .or_insert_with(|| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(format!("{kind}|{base}").as_bytes());
                if let Some(server) = server {
                    hasher.update(format!("|{server}").as_bytes());
                }
                hasher.update(match proto {
                    FoundationProtocol::Udp => b"|udp",
                    FoundationProtocol::Tcp => b"|tcp",
                });
                hex::encode(&hasher.finalize().as_bytes()[..4])
            })
            .clone()
    }
}

/// The candidate tuple carried verbatim by the signalling layer
/// (XEP-0176/XEP-0371 shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateExchange {
    pub component: u16,
    pub foundation: String,
    pub generation: u32,
    pub id: String,
    pub ip: IpAddr,
    pub network: u32,
    pub port: u16,
    pub priority: u32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_addr: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rem_addr: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rem_port: Option<u16>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&CandidateInfo> for CandidateExchange {
    fn from(info: &CandidateInfo) -> Self {
        let unscoped = info.addr.unscoped();
        let related = if info.kind == CandidateType::Host {
            None
        } else {
            info.related.map(|r| r.unscoped())
        };
        Self {
            component: info.component_id,
            foundation: info.foundation.clone(),
            generation: 0,
            id: info.id.clone(),
            ip: unscoped.ip(),
            network: info.network,
            port: unscoped.port(),
            priority: info.priority,
            protocol: "udp".into(),
            rel_addr: related.map(|r| r.ip()),
            rel_port: related.map(|r| r.port()),
            rem_addr: None,
            rem_port: None,
            kind: info.kind.to_string(),
        }
    }
}

impl TryFrom<&CandidateExchange> for CandidateInfo {
    type Error = String;

    fn try_from(c: &CandidateExchange) -> Result<Self, Self::Error> {
        let kind: CandidateType = c
            .kind
            .parse()
            .map_err(|_| format!("unknown candidate type {:?}", c.kind))?;
        if !(1..=256).contains(&c.component) {
            return Err(format!("component {} out of range", c.component));
        }
        let addr = TransportAddress::new(c.ip, c.port);
        let related = match (c.rel_addr, c.rel_port) {
            (Some(ip), Some(port)) => Some(TransportAddress::new(ip, port)),
            _ => None,
        };
        // the wire tuple carries the related address, never the base; the
        // base follows from the kind: relayed candidates are their own base
        // (their related address is the separately discovered reflexive
        // one), reflexive candidates are based on their related address
        let base = match kind {
            CandidateType::Relayed => addr,
            _ => related.unwrap_or(addr),
        };
        Ok(Self {
            component_id: c.component,
            kind,
            addr,
            base,
            related,
            priority: c.priority,
            foundation: c.foundation.clone(),
            network: c.network,
            id: c.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ta(s: &str) -> TransportAddress {
        TransportAddress::from(s.parse::<std::net::SocketAddr>().unwrap())
    }

    #[test]
    fn test_priority_formula_exact() {
        // host, single interface, component 1
        assert_eq!(candidate_priority(126, 65535, 1), 2_130_706_431);
        // srflx
        assert_eq!(candidate_priority(100, 65535, 1), 1_694_498_815);
        // relayed bottoms out at the local pref band
        assert_eq!(candidate_priority(0, 65535, 1), 16_777_215);
        // component id is subtracted from 256
        assert_eq!(
            candidate_priority(126, 65535, 2),
            2_130_706_431 - 1
        );
    }

    #[test]
    fn test_priority_monotonic_across_types() {
        let host = candidate_priority(CandidateType::Host.type_preference(false), 65535, 1);
        let prflx =
            candidate_priority(CandidateType::PeerReflexive.type_preference(false), 65535, 1);
        let srflx =
            candidate_priority(CandidateType::ServerReflexive.type_preference(false), 65535, 1);
        let relay = candidate_priority(CandidateType::Relayed.type_preference(false), 65535, 1);
        assert!(host > prflx && prflx > srflx && srflx > relay);

        // a VPN host ranks with relays, not hosts
        let vpn_host = candidate_priority(CandidateType::Host.type_preference(true), 65535, 1);
        assert_eq!(vpn_host, relay);
    }

    #[test]
    fn test_foundation_determinism() {
        let mut reg = FoundationRegistry::new();
        let base: IpAddr = "10.0.0.2".parse().unwrap();
        let stun: IpAddr = "198.51.100.1".parse().unwrap();

        let a = reg.foundation(
            CandidateType::ServerReflexive,
            base,
            Some(stun),
            FoundationProtocol::Udp,
        );
        let b = reg.foundation(
            CandidateType::ServerReflexive,
            base,
            Some(stun),
            FoundationProtocol::Udp,
        );
        assert_eq!(a, b);

        // any component of the key changing yields a different foundation
        let other_type =
            reg.foundation(CandidateType::Host, base, Some(stun), FoundationProtocol::Udp);
        let other_server = reg.foundation(
            CandidateType::ServerReflexive,
            base,
            Some("198.51.100.2".parse().unwrap()),
            FoundationProtocol::Udp,
        );
        let other_proto = reg.foundation(
            CandidateType::ServerReflexive,
            base,
            Some(stun),
            FoundationProtocol::Tcp,
        );
        assert_ne!(a, other_type);
        assert_ne!(a, other_server);
        assert_ne!(a, other_proto);
    }

    #[test]
    fn test_exchange_roundtrip_host() {
        let info = CandidateInfo {
            component_id: 1,
            kind: CandidateType::Host,
            addr: ta("192.0.2.1:40000"),
            base: ta("192.0.2.1:40000"),
            related: None,
            priority: candidate_priority(126, 65535, 1),
            foundation: "abcd1234".into(),
            network: 3,
            id: "candid0001".into(),
        };
        let wire = CandidateExchange::from(&info);
        assert_eq!(wire.kind, "host");
        assert!(wire.rel_addr.is_none());

        let back = CandidateInfo::try_from(&wire).unwrap();
        assert_eq!(back, info);

        // and through serde, as the signalling layer would carry it
        let json = serde_json::to_string(&wire).unwrap();
        let rewire: CandidateExchange = serde_json::from_str(&json).unwrap();
        assert_eq!(rewire, wire);
    }

    #[test]
    fn test_exchange_roundtrip_srflx() {
        let info = CandidateInfo {
            component_id: 1,
            kind: CandidateType::ServerReflexive,
            addr: ta("198.51.100.5:41000"),
            base: ta("10.0.0.2:40000"),
            related: Some(ta("10.0.0.2:40000")),
            priority: candidate_priority(100, 65535, 1),
            foundation: "ffff0000".into(),
            network: 0,
            id: "candid0002".into(),
        };
        let wire = CandidateExchange::from(&info);
        assert_eq!(wire.rel_addr, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(wire.rel_port, Some(40000));

        let back = CandidateInfo::try_from(&wire).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_exchange_roundtrip_relay() {
        // for a relayed candidate the base is the relay address itself while
        // the related address is the reflexive one, so base and related
        // genuinely differ on the wire
        let info = CandidateInfo {
            component_id: 1,
            kind: CandidateType::Relayed,
            addr: ta("203.0.113.9:49152"),
            base: ta("203.0.113.9:49152"),
            related: Some(ta("198.51.100.5:41000")),
            priority: candidate_priority(0, 65535, 1),
            foundation: "0badcafe".into(),
            network: 0,
            id: "candid0003".into(),
        };
        let wire = CandidateExchange::from(&info);
        assert_eq!(wire.kind, "relay");
        assert_eq!(wire.rel_addr, Some("198.51.100.5".parse().unwrap()));
        assert_eq!(wire.rel_port, Some(41000));

        let back = CandidateInfo::try_from(&wire).unwrap();
        assert_eq!(back.base, info.addr, "a relayed candidate is its own base");
        assert_eq!(back, info);

        // a relay without a known reflexive address still round-trips
        let bare = CandidateInfo {
            related: None,
            id: "candid0004".into(),
            ..info
        };
        let back = CandidateInfo::try_from(&CandidateExchange::from(&bare)).unwrap();
        assert_eq!(back, bare);
    }

    #[test]
    fn test_exchange_rejects_garbage() {
        let mut wire = CandidateExchange::from(&CandidateInfo::remote_peer_reflexive(
            1,
            ta("192.0.2.7:1000"),
            1000,
        ));
        wire.kind = "warp".into();
        assert!(CandidateInfo::try_from(&wire).is_err());

        wire.kind = "host".into();
        wire.component = 0;
        assert!(CandidateInfo::try_from(&wire).is_err());
    }

    #[test]
    fn test_remote_prflx_foundations_do_not_collide() {
        let a = CandidateInfo::remote_peer_reflexive(1, ta("192.0.2.7:1000"), 1000);
        let b = CandidateInfo::remote_peer_reflexive(1, ta("192.0.2.7:1001"), 1000);
        assert_ne!(a.foundation, b.foundation);
        assert_eq!(a.base, a.addr);
    }
}
