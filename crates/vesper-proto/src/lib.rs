//! # vesper-proto
//!
//! Wire protocol and request/response engine for a Vesper node.
//!
//! This crate implements:
//! - The fixed 49-byte frame header (opcode, sender id, transaction id)
//!   and opcode-specific bodies via [`wire`]
//! - The opcode registry via [`messages`]
//! - The per-datagram handler state machine via [`engine`]: parse,
//!   dispatch, produce at most one response, then feed the sender back
//!   into the routing table, occasionally emitting a liveness probe
//!
//! ## Wire format
//!
//! ```text
//! offset  len  field
//! 0       1    opcode
//! 1       32   sender_id
//! 33      16   transaction_id
//! 49      ...  body (opcode-specific)
//! ```
//!
//! All multi-byte integers are network byte order. IPv6 is unsupported.

pub mod engine;
pub mod messages;
pub mod wire;

/// Error types for frame and body parsing.
///
/// The display strings of the first three variants are exactly the
/// messages carried by outbound ERROR replies.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    /// The datagram is shorter than the fixed header.
    #[error("header is too short")]
    HeaderTooShort,

    /// The opcode byte is not in the registry.
    #[error("unknown message type")]
    UnknownOpcode(u8),

    /// A body that must carry a 32-byte key is the wrong length.
    #[error("key is wrong length")]
    WrongKeyLength(usize),

    /// A contact record is not exactly 38 bytes.
    #[error("contact record is wrong length: {0} bytes")]
    BadContactLength(usize),
}

/// Convenience result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
