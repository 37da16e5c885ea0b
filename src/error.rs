//! # Error Taxonomy
//!
//! Internal fallible paths return [`TransportError`]; construction and other
//! boundary operations hand callers an [`anyhow::Error`] built from it, matching
//! the split the rest of this crate's corpus uses between a small typed enum and
//! `anyhow` at the edges.

use std::fmt;

/// Errors surfaced by the transport's boundary operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A slot arena is at capacity (non-fatal; caller should back off).
    PoolExhausted,
    /// A datagram failed to parse as a valid `Packet` or `Ack`.
    MalformedPacket,
    /// `K`, `S`, or `W` (or another config field) is outside its legal range.
    InvalidConfig(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::PoolExhausted => write!(f, "slot arena exhausted"),
            TransportError::MalformedPacket => write!(f, "malformed packet"),
            TransportError::InvalidConfig(why) => write!(f, "invalid configuration: {why}"),
        }
    }
}

impl std::error::Error for TransportError {}
