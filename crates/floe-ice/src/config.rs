//! Agent configuration.
//!
//! The configuration is an immutable snapshot taken at
//! [`crate::IceAgent::new`]. There is no post-start mutation surface: every
//! "set once" rule from the negotiation protocol holds by construction.

use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use crate::addr::{ExternalAddress, LocalAddress};
use crate::credentials::Password;
use crate::error::{IceError, IceResult};
use crate::port_reserver::UdpPortReserver;

/// Which side of the negotiation this agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceMode {
    /// Offers first; starts out controlling
    Initiator,
    /// Answers; starts out controlled
    Responder,
}

impl std::fmt::Display for IceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceMode::Initiator => write!(f, "initiator"),
            IceMode::Responder => write!(f, "responder"),
        }
    }
}

/// Capability flags exchanged with the peer by the signalling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u16);

impl Features {
    /// Additional candidates will be signalled as they are discovered
    pub const TRICKLE: Features = Features(0x01);
    /// Every check carries USE-CANDIDATE; select by priority afterwards
    pub const AGGRESSIVE_NOMINATION: Features = Features(0x02);
    /// Data on valid but not yet nominated pairs is acceptable
    pub const NOT_NOMINATED_DATA: Features = Features(0x04);
    /// Pacing-aware STUN retransmission ladder
    pub const RTP_OPTIMIZATION: Features = Features(0x08);
    /// The peer signals an explicit end-of-candidates marker
    pub const GATHERING_COMPLETE: Features = Features(0x10);

    pub const fn empty() -> Self {
        Features(0)
    }

    pub const fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Features(bits & 0x1F)
    }
}

impl BitOr for Features {
    type Output = Features;
    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        self.0 |= rhs.0;
    }
}

/// A TURN relay service reachable over UDP.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub username: String,
    pub password: Password,
}

/// Immutable agent configuration.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub mode: IceMode,
    /// Number of media components (RTP=1, RTCP=2, ...), 1..=256
    pub component_count: usize,
    pub local_addresses: Vec<LocalAddress>,
    /// Static NAT mappings to publish as server-reflexive candidates
    pub external_addresses: Vec<ExternalAddress>,
    /// STUN Binding service for reflexive discovery
    pub stun_bind_server: Option<SocketAddr>,
    /// TURN relay service for relayed candidates
    pub turn_udp_server: Option<TurnServer>,
    pub local_features: Features,
    /// Publish host candidates (disabled when IPs must not be exposed)
    pub use_local_candidates: bool,
    /// Externally owned pool of pre-bound sockets; borrowed sockets are
    /// returned on teardown
    pub port_reserver: Option<Arc<UdpPortReserver>>,
    /// Pacing interval Ta between new connectivity checks
    pub pacing: Duration,
    /// How long to wait after the first valid pair before forcing nomination
    pub nomination_timeout: Duration,
    /// Patiently-Awaiting-Connectivity: give up this long after
    /// `start_checks` without a selected pair
    pub pac_timeout: Duration,
    /// Keepalive indication interval on selected pairs
    pub keepalive_interval: Duration,
    /// Consent freshness: inbound silence on a selected pair longer than
    /// this is a disconnect
    pub consent_timeout: Duration,
    /// Outbound datagrams queued per component before readiness; excess is
    /// dropped
    pub max_early_queue: usize,
    /// SOFTWARE attribute for outgoing requests
    pub software: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            mode: IceMode::Initiator,
            component_count: 1,
            local_addresses: Vec::new(),
            external_addresses: Vec::new(),
            stun_bind_server: None,
            turn_udp_server: None,
            local_features: Features::empty(),
            use_local_candidates: true,
            port_reserver: None,
            pacing: Duration::from_millis(50),
            nomination_timeout: Duration::from_secs(3),
            pac_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            consent_timeout: Duration::from_secs(30),
            max_early_queue: 64,
            software: None,
        }
    }
}

impl IceConfig {
    pub(crate) fn validate(&self) -> IceResult<()> {
        if self.component_count == 0 || self.component_count > 256 {
            return Err(IceError::Config(format!(
                "component count {} out of range 1..=256",
                self.component_count
            )));
        }
        if self.local_addresses.is_empty() {
            return Err(IceError::Config("no local addresses".into()));
        }
        for la in &self.local_addresses {
            if la.addr.is_unspecified() || la.addr.is_multicast() {
                return Err(IceError::Config(format!(
                    "unusable local address {}",
                    la.addr
                )));
            }
        }
        if !self.use_local_candidates
            && self.stun_bind_server.is_none()
            && self.turn_udp_server.is_none()
        {
            return Err(IceError::Config(
                "host candidates disabled and no discovery service configured".into(),
            ));
        }
        if let Some(turn) = &self.turn_udp_server {
            if turn.username.is_empty() || turn.password.is_empty() {
                return Err(IceError::Config("TURN service requires credentials".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_features_ops() {
        let f = Features::TRICKLE | Features::AGGRESSIVE_NOMINATION;
        assert!(f.contains(Features::TRICKLE));
        assert!(f.contains(Features::AGGRESSIVE_NOMINATION));
        assert!(!f.contains(Features::NOT_NOMINATED_DATA));
        assert_eq!(Features::from_bits(f.bits()), f);
        assert!(!Features::empty().contains(Features::TRICKLE));
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut cfg = IceConfig {
            local_addresses: vec![LocalAddress::new(ip("192.0.2.1"))],
            ..IceConfig::default()
        };
        assert!(cfg.validate().is_ok());

        cfg.component_count = 0;
        assert!(cfg.validate().is_err());
        cfg.component_count = 257;
        assert!(cfg.validate().is_err());
        cfg.component_count = 1;

        cfg.local_addresses.clear();
        assert!(cfg.validate().is_err());

        cfg.local_addresses = vec![LocalAddress::new(ip("0.0.0.0"))];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_requires_turn_credentials() {
        let cfg = IceConfig {
            local_addresses: vec![LocalAddress::new(ip("192.0.2.1"))],
            turn_udp_server: Some(TurnServer {
                addr: "203.0.113.9:3478".parse().unwrap(),
                username: String::new(),
                password: Password::new(""),
            }),
            ..IceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
