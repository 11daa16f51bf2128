//! Interactive Connectivity Establishment (ICE) engine.
//!
//! Negotiates peer-to-peer UDP paths through NATs and firewalls per
//! RFC 8445: candidates are gathered on every local interface (host,
//! server-reflexive via STUN, relayed via TURN), exchanged with the remote
//! agent over an out-of-band signalling channel, probed pairwise with
//! authenticated Binding checks, and a nominated pair per media component
//! carries application datagrams afterwards.
//!
//! ## Layers
//!
//! - [`IceAgent`] - the check-list state machine, nomination, and the
//!   datagram plane
//! - component - candidate bookkeeping per media component (internal)
//! - transport - one UDP socket with a direct and an optional TURN-relayed
//!   path (internal)
//! - `floe-stun` - the STUN/TURN codec and retransmitting transaction pool
//!
//! ## Example
//!
//! ```no_run
//! use floe_ice::{IceAgent, IceConfig, IceEvent, IceMode, LocalAddress};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IceConfig {
//!     mode: IceMode::Initiator,
//!     component_count: 1,
//!     local_addresses: vec![LocalAddress::new("192.0.2.1".parse()?)],
//!     stun_bind_server: Some("198.51.100.1:3478".parse()?),
//!     ..IceConfig::default()
//! };
//! let (agent, mut events) = IceAgent::new(config)?;
//! agent.start()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         IceEvent::LocalCandidatesReady(candidates) => {
//!             // hand candidates + agent.local_ufrag()/local_password()
//!             // to the signalling layer
//!         }
//!         IceEvent::IceFinished => break,
//!         _ => {}
//!     }
//! }
//! agent.write_datagram(0, b"hello")?;
//! # Ok(())
//! # }
//! ```

mod addr;
mod agent;
mod candidate;
mod component;
mod config;
mod credentials;
mod error;
mod events;
mod pair;
mod port_reserver;
mod transport;
mod turn;

pub use addr::{ExternalAddress, LocalAddress, TransportAddress};
pub use agent::IceAgent;
pub use candidate::{CandidateExchange, CandidateInfo, CandidateType};
pub use config::{Features, IceConfig, IceMode, TurnServer};
pub use credentials::Password;
pub use error::{IceError, IceErrorKind, IceResult};
pub use events::IceEvent;
pub use pair::{pair_priority, PairState};
pub use port_reserver::UdpPortReserver;
