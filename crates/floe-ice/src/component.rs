//! Per-component candidate bookkeeping.
//!
//! A component aggregates the local transports for one component id and
//! turns discovery results into candidates: host candidates when a
//! transport starts, pre-assigned server-reflexive candidates from static
//! NAT mappings, discovered server-reflexive and relayed candidates as
//! addresses appear, and peer-reflexive candidates during checks. The
//! candidate set is kept non-redundant (RFC 8445 Section 5.1.3).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;

use tracing::debug;

use crate::addr::{LocalAddress, TransportAddress};
use crate::candidate::{
    candidate_priority, CandidateInfo, CandidateType, FoundationProtocol, FoundationRegistry,
};
use crate::credentials::random_credential;
use crate::pair::PairId;
use crate::transport::{TransportHandle, TransportId, PATH_RELAYED};

/// A gathered local candidate bound to the transport that owns it.
#[derive(Debug, Clone)]
pub(crate) struct LocalCandidate {
    pub info: CandidateInfo,
    pub transport: TransportId,
    pub path: u8,
}

/// One local transport as seen by its component.
pub(crate) struct ComponentTransport {
    pub handle: TransportHandle,
    pub local: LocalAddress,
    /// Position of the local address in the configured list; feeds the
    /// local preference so distinct interfaces get distinct priorities
    pub addr_index: usize,
    pub started: bool,
    pub stun_started: bool,
    /// Binding discovery concluded (successfully or not)
    pub stun_finished: bool,
    /// Allocation discovery concluded (successfully or not)
    pub turn_finished: bool,
    /// Static NAT mapping assigned to this transport
    pub ext_addr: Option<IpAddr>,
    pub ext_finished: bool,
    pub borrowed: bool,
    pub stopping: bool,
    pub reflexive: Option<TransportAddress>,
    pub relayed: Option<TransportAddress>,
    pub has_bind_service: bool,
    pub has_relay_service: bool,
}

/// State for one media component.
pub(crate) struct Component {
    /// 1-based component id
    pub id: u16,
    pub transports: Vec<ComponentTransport>,
    /// All host candidates are out
    pub local_finished: bool,
    pub gathering_complete: bool,
    /// Channel binding requested for the remote peers of valid pairs
    pub low_overhead: bool,
    /// Candidate id -> peers already flagged for channel binding
    pub channel_peers: HashMap<String, HashSet<TransportAddress>>,
    pub has_valid: bool,
    pub has_nominated: bool,
    /// Final pair; set once, never replaced
    pub selected: Option<PairId>,
    /// Highest-priority valid pair so far
    pub highest: Option<PairId>,
    /// A final (regular) nomination check is in flight
    pub nominating: bool,
    pub nomination_deadline: Option<Instant>,
    pub last_inbound: Option<Instant>,
    pub last_keepalive: Option<Instant>,
    pub stopped: bool,
}

impl Component {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            transports: Vec::new(),
            local_finished: false,
            gathering_complete: false,
            low_overhead: false,
            channel_peers: HashMap::new(),
            has_valid: false,
            has_nominated: false,
            selected: None,
            highest: None,
            nominating: false,
            nomination_deadline: None,
            last_inbound: None,
            last_keepalive: None,
            stopped: false,
        }
    }

    pub fn transport(&self, id: TransportId) -> Option<&ComponentTransport> {
        self.transports.iter().find(|t| t.handle.id == id)
    }

    pub fn transport_mut(&mut self, id: TransportId) -> Option<&mut ComponentTransport> {
        self.transports.iter_mut().find(|t| t.handle.id == id)
    }

    /// All host candidates emitted?
    pub fn all_transports_started(&self) -> bool {
        self.transports.iter().filter(|t| !t.stopping).all(|t| t.started)
    }

    /// Gathering is complete when every live transport has started and both
    /// discovery paths (where configured) have concluded.
    pub fn gathering_complete_now(&self) -> bool {
        self.transports.iter().filter(|t| !t.stopping).all(|t| {
            t.started
                && (!t.has_bind_service || t.stun_finished)
                && (!t.has_relay_service || t.turn_finished)
        })
    }

    /// Priority claimed for not-yet-known peer-reflexive candidates
    /// discovered through this transport/path. Later transports rank lower;
    /// the relayed path sits 512 rungs down, and the (reserved) TCP relay
    /// rung is 1024, keeping the ladder monotone across transports.
    pub fn peer_reflexive_priority(&self, transport: TransportId, path: u8) -> u32 {
        let mut addr_at = self
            .transports
            .iter()
            .position(|t| t.handle.id == transport)
            .unwrap_or(self.transports.len());
        if path == PATH_RELAYED {
            addr_at += 512;
        }
        candidate_priority(
            CandidateType::PeerReflexive.type_preference(false),
            65535u32.saturating_sub(addr_at as u32),
            self.id,
        )
    }

    // ---- candidate construction ----

    pub fn host_candidate(
        &self,
        t: &ComponentTransport,
        registry: &mut FoundationRegistry,
    ) -> CandidateInfo {
        let addr = t.handle.local_addr;
        CandidateInfo {
            component_id: self.id,
            kind: CandidateType::Host,
            addr,
            base: addr,
            related: None,
            priority: candidate_priority(
                CandidateType::Host.type_preference(t.local.is_vpn),
                local_pref(t.addr_index),
                self.id,
            ),
            foundation: registry.foundation(
                CandidateType::Host,
                addr.ip(),
                None,
                FoundationProtocol::Udp,
            ),
            network: t.local.network,
            id: random_credential(10),
        }
    }

    /// Pre-assigned server-reflexive candidate from a static NAT mapping.
    pub fn ext_candidate(
        &self,
        t: &ComponentTransport,
        registry: &mut FoundationRegistry,
    ) -> Option<CandidateInfo> {
        let ext = t.ext_addr?;
        let base = t.handle.local_addr;
        Some(CandidateInfo {
            component_id: self.id,
            kind: CandidateType::ServerReflexive,
            addr: TransportAddress::new(ext, base.port()),
            base,
            related: Some(base),
            priority: candidate_priority(
                CandidateType::ServerReflexive.type_preference(t.local.is_vpn),
                local_pref(t.addr_index),
                self.id,
            ),
            foundation: registry.foundation(
                CandidateType::ServerReflexive,
                base.ip(),
                None,
                FoundationProtocol::Udp,
            ),
            network: t.local.network,
            id: random_credential(10),
        })
    }

    pub fn srflx_candidate(
        &self,
        t: &ComponentTransport,
        source: Option<IpAddr>,
        registry: &mut FoundationRegistry,
    ) -> Option<CandidateInfo> {
        let reflexive = t.reflexive?;
        let base = t.handle.local_addr;
        Some(CandidateInfo {
            component_id: self.id,
            kind: CandidateType::ServerReflexive,
            addr: reflexive,
            base,
            related: Some(base),
            priority: candidate_priority(
                CandidateType::ServerReflexive.type_preference(t.local.is_vpn),
                local_pref(t.addr_index),
                self.id,
            ),
            foundation: registry.foundation(
                CandidateType::ServerReflexive,
                base.ip(),
                source,
                FoundationProtocol::Udp,
            ),
            network: t.local.network,
            id: random_credential(10),
        })
    }

    pub fn relayed_candidate(
        &self,
        t: &ComponentTransport,
        relay_server: IpAddr,
        registry: &mut FoundationRegistry,
    ) -> Option<CandidateInfo> {
        let relayed = t.relayed?;
        Some(CandidateInfo {
            component_id: self.id,
            kind: CandidateType::Relayed,
            addr: relayed,
            base: relayed,
            related: t.reflexive,
            priority: candidate_priority(
                CandidateType::Relayed.type_preference(t.local.is_vpn),
                local_pref(t.addr_index),
                self.id,
            ),
            foundation: registry.foundation(
                CandidateType::Relayed,
                relayed.ip(),
                Some(relay_server),
                FoundationProtocol::Udp,
            ),
            network: t.local.network,
            id: random_credential(10),
        })
    }

    /// Local peer-reflexive candidate discovered from a check response
    /// whose mapped address was unknown (RFC 8445 Section 7.2.5.3.1).
    pub fn prflx_candidate(
        &self,
        mapped: TransportAddress,
        base: &CandidateInfo,
        priority: u32,
        registry: &mut FoundationRegistry,
    ) -> CandidateInfo {
        CandidateInfo {
            component_id: self.id,
            kind: CandidateType::PeerReflexive,
            addr: mapped,
            base: base.addr,
            related: Some(base.addr),
            priority,
            foundation: registry.foundation(
                CandidateType::PeerReflexive,
                base.addr.ip(),
                None,
                FoundationProtocol::Udp,
            ),
            network: base.network,
            id: random_credential(10),
        }
    }

    /// Track a channel-peer flag; returns true when the transport should be
    /// told to bind a channel (first time only per candidate/peer).
    pub fn flag_channel_peer(&mut self, candidate_id: &str, peer: TransportAddress) -> bool {
        let peers = self.channel_peers.entry(candidate_id.to_string()).or_default();
        if peers.contains(&peer) {
            return false;
        }
        peers.insert(peer);
        debug!(component = self.id, candidate = candidate_id, %peer, "flagged low-overhead peer");
        true
    }
}

fn local_pref(addr_index: usize) -> u32 {
    65535u32.saturating_sub(addr_index as u32)
}

/// RFC 8445 Section 5.1.3: a prospective candidate matching an existing one
/// on `(transport address, base)` with equal-or-lower priority is redundant.
pub(crate) fn is_redundant(candidates: &[LocalCandidate], info: &CandidateInfo) -> bool {
    candidates.iter().any(|c| {
        c.info.addr == info.addr && c.info.base == info.base && c.info.priority >= info.priority
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ta(s: &str) -> TransportAddress {
        TransportAddress::from(s.parse::<std::net::SocketAddr>().unwrap())
    }

    fn candidate(addr: &str, base: &str, priority: u32) -> LocalCandidate {
        LocalCandidate {
            info: CandidateInfo {
                component_id: 1,
                kind: CandidateType::Host,
                addr: ta(addr),
                base: ta(base),
                related: None,
                priority,
                foundation: "f".into(),
                network: 0,
                id: "x".into(),
            },
            transport: 0,
            path: 0,
        }
    }

    #[test]
    fn test_redundancy_rule() {
        let existing = vec![candidate("10.0.0.1:1000", "10.0.0.1:1000", 200)];

        // same (addr, base), lower priority: redundant
        let lower = candidate("10.0.0.1:1000", "10.0.0.1:1000", 100);
        assert!(is_redundant(&existing, &lower.info));

        // same (addr, base), higher priority: kept
        let higher = candidate("10.0.0.1:1000", "10.0.0.1:1000", 300);
        assert!(!is_redundant(&existing, &higher.info));

        // different base: kept
        let other = candidate("10.0.0.1:1000", "10.0.0.2:1000", 100);
        assert!(!is_redundant(&existing, &other.info));
    }

    #[test]
    fn test_channel_peer_flagged_once() {
        let mut c = Component::new(1);
        let peer = ta("192.0.2.9:5000");
        assert!(c.flag_channel_peer("cand1", peer));
        assert!(!c.flag_channel_peer("cand1", peer));
        assert!(c.flag_channel_peer("cand2", peer));
    }

    #[test]
    fn test_gathering_complete_empty_component() {
        let c = Component::new(1);
        assert!(c.gathering_complete_now());
        assert!(c.all_transports_started());
    }
}
