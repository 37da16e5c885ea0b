//! # fountain-transport
//!
//! A low-latency reliable datagram transport built on an unreliable unicast
//! datagram service. Reliability comes from a fountain-style erasure code
//! rather than ARQ: the sender stripes a byte stream into fixed-size
//! generations, feeds each to a rateless systematic encoder, and keeps
//! emitting coded packets until the peer's decoder reaches full rank.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet/Ack framing
//! - [`codec`] — generation-based RLNC encoder/decoder over GF(256)
//! - [`pacer`] — token-bucket rate limiter
//! - [`slots`] — encoder/decoder slot arenas, ordered by `block_id`
//! - [`sender`] — sender state machine (ingest/segment/encode/feedback/fountain)
//! - [`receiver`] — receiver state machine (intake/dispatch/extract/reassemble)
//! - [`endpoint`] — single-threaded and worker-thread endpoint drivers
//! - [`stats`] — loss-rate EWMA and rate counters
//! - [`error`] — transport error taxonomy

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod pacer;
pub mod receiver;
pub mod sender;
pub mod slots;
pub mod stats;
pub mod wire;

pub use error::TransportError;
