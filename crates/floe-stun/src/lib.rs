//! STUN/TURN wire codec and transaction pool.
//!
//! This crate implements the subset of RFC 5389/8489 (STUN) and RFC 5766/8656
//! (TURN) needed by an ICE agent:
//!
//! - [`Message`] - STUN message encoder/decoder with MESSAGE-INTEGRITY
//!   (HMAC-SHA1) and FINGERPRINT (CRC-32) support
//! - [`TransactionPool`] - request/response matching with RFC-conformant
//!   retransmission and short-term credential authentication
//! - TURN ChannelData framing for channel-bound relayed traffic
//!
//! ## References
//!
//! - RFC 8489: Session Traversal Utilities for NAT (STUN)
//! - RFC 8656: Traversal Using Relays around NAT (TURN)
//! - RFC 8445: Interactive Connectivity Establishment (ICE), Section 14
//!   (pacing-aware retransmission)

pub mod message;
pub mod transaction;

pub use message::{
    attrs, error_codes, methods, ChannelData, Class, Message, MessageError, TransactionId,
    Validation, FINGERPRINT_XOR, MAGIC_COOKIE, TRANSPORT_UDP,
};
pub use transaction::{
    Disposition, OutgoingPacket, PoolConfig, RequestOptions, TransactionError, TransactionPool,
};

/// Result type for codec operations.
pub type StunResult<T> = Result<T, MessageError>;
