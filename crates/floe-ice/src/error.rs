//! Error types for the ICE engine.

use thiserror::Error;

/// Unrecoverable conditions reported through [`crate::IceEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceErrorKind {
    /// Negotiation cannot proceed (exhausted checklists, no usable pairs)
    Generic,
    /// Connectivity was established and then lost on every component
    Disconnected,
}

impl std::fmt::Display for IceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceErrorKind::Generic => write!(f, "generic"),
            IceErrorKind::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Errors returned by [`crate::IceAgent`] API calls.
#[derive(Debug, Error)]
pub enum IceError {
    /// Rejected at construction: bad addresses, zero components, ...
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start` called twice without an intervening `reset`
    #[error("agent already started")]
    AlreadyStarted,

    /// Operation requires a started agent
    #[error("agent not started")]
    NotStarted,

    /// Component index out of range
    #[error("unknown component index {0}")]
    UnknownComponent(usize),

    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ICE operations.
pub type IceResult<T> = Result<T, IceError>;
