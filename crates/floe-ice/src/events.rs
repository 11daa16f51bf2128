//! Events emitted to the embedding application.

use crate::candidate::CandidateExchange;
use crate::error::IceErrorKind;

/// Asynchronous notifications from an [`crate::IceAgent`].
///
/// Delivered in emission order on the receiver returned by
/// [`crate::IceAgent::new`].
#[derive(Debug, Clone, PartialEq)]
pub enum IceEvent {
    /// Local preparation finished; checks may be paired from here on
    Started,

    /// Initial batch of local candidates for the signalling layer
    LocalCandidatesReady(Vec<CandidateExchange>),

    /// A candidate discovered after the initial batch (Trickle)
    LocalCandidateAdded(CandidateExchange),

    /// A previously published candidate is gone (its transport was torn
    /// down)
    LocalCandidateRemoved(CandidateExchange),

    /// Every discovery path on every component has concluded
    LocalGatheringComplete,

    /// Component (0-based index) has a nominated pair
    ComponentReady(usize),

    /// Every component can carry data (valid or nominated pairs throughout)
    ReadyToSendMedia,

    /// All components have selected pairs; negotiation is over
    IceFinished,

    /// Datagrams are queued on the component (0-based index)
    ReadyRead(usize),

    /// Unrecoverable failure; the agent stops itself afterwards
    Error(IceErrorKind),

    /// Shutdown finished; emitted exactly once per `stop`
    Stopped,
}
