//! # Wire Framing
//!
//! Two PDU shapes travel the wire, in one of two variants (selected once, for
//! the whole session, via configuration — not per-datagram):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         block_id (32, LE)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    esi (32, LE) — variant B only               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      payload (P bytes, opaque)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! An `Ack` mirrors the header and replaces the payload with a trailing 32-bit
//! `rank`. Both PDUs carry no type tag of their own — an embedder running both
//! over one socket wraps them in [`Datagram`], which does.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header size without `esi`: 4-byte `block_id`.
pub const HEADER_LEN_NO_ESI: usize = 4;
/// Fixed header size with `esi`: 4-byte `block_id` + 4-byte `esi`.
pub const HEADER_LEN_ESI: usize = 8;

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A data-plane PDU: generation id, optional per-packet sequence, and one
/// opaque coded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub block_id: u32,
    pub esi: Option<u32>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(block_id: u32, esi: Option<u32>, payload: Bytes) -> Self {
        Packet {
            block_id,
            esi,
            payload,
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        let header = if self.esi.is_some() {
            HEADER_LEN_ESI
        } else {
            HEADER_LEN_NO_ESI
        };
        header + self.payload.len()
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.block_id);
        if let Some(esi) = self.esi {
            buf.put_u32_le(esi);
        }
        buf.put_slice(&self.payload);
        buf
    }

    /// Decode a packet. `carry_esi` must match the session's configured wire
    /// variant — it is not self-describing on the wire.
    pub fn decode(buf: &mut impl Buf, carry_esi: bool) -> Option<Self> {
        let min_len = if carry_esi {
            HEADER_LEN_ESI
        } else {
            HEADER_LEN_NO_ESI
        };
        if buf.remaining() < min_len {
            return None;
        }
        let block_id = buf.get_u32_le();
        let esi = if carry_esi { Some(buf.get_u32_le()) } else { None };
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(Packet {
            block_id,
            esi,
            payload,
        })
    }
}

// ─── Ack ─────────────────────────────────────────────────────────────────────

/// A feedback PDU: generation id, optional per-packet sequence being
/// acknowledged, and the decoder's current rank for that generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub block_id: u32,
    pub esi: Option<u32>,
    pub rank: u32,
}

impl Ack {
    pub fn new(block_id: u32, esi: Option<u32>, rank: u32) -> Self {
        Ack { block_id, esi, rank }
    }

    /// A full-rank ack for `block_id`, used by the receiver's intake phase to
    /// fast-retire obsolete generations.
    pub fn full_rank(block_id: u32, esi: Option<u32>, k: u32) -> Self {
        Ack {
            block_id,
            esi,
            rank: k,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let header = if self.esi.is_some() {
            HEADER_LEN_ESI
        } else {
            HEADER_LEN_NO_ESI
        };
        header + 4
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.block_id);
        if let Some(esi) = self.esi {
            buf.put_u32_le(esi);
        }
        buf.put_u32_le(self.rank);
        buf
    }

    pub fn decode(buf: &mut impl Buf, carry_esi: bool) -> Option<Self> {
        let need = if carry_esi {
            HEADER_LEN_ESI + 4
        } else {
            HEADER_LEN_NO_ESI + 4
        };
        if buf.remaining() < need {
            return None;
        }
        let block_id = buf.get_u32_le();
        let esi = if carry_esi { Some(buf.get_u32_le()) } else { None };
        let rank = buf.get_u32_le();
        Some(Ack {
            block_id,
            esi,
            rank,
        })
    }
}

// ─── Combined-socket framing ─────────────────────────────────────────────────

/// Either PDU, tagged with a leading byte. Only needed when data and
/// acknowledgements share one socket (a separate ack socket is also fine,
/// in which case [`Packet`]/[`Ack`] are used directly and this wrapper is
/// unnecessary).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Packet(Packet),
    Ack(Ack),
}

const TAG_PACKET: u8 = 0;
const TAG_ACK: u8 = 1;

impl Datagram {
    pub fn encode(&self) -> BytesMut {
        match self {
            Datagram::Packet(p) => {
                let mut buf = BytesMut::with_capacity(1 + p.encoded_len());
                buf.put_u8(TAG_PACKET);
                buf.extend_from_slice(&p.encode());
                buf
            }
            Datagram::Ack(a) => {
                let mut buf = BytesMut::with_capacity(1 + a.encoded_len());
                buf.put_u8(TAG_ACK);
                buf.extend_from_slice(&a.encode());
                buf
            }
        }
    }

    pub fn decode(buf: &mut impl Buf, carry_esi: bool) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let tag = buf.get_u8();
        match tag {
            TAG_PACKET => Packet::decode(buf, carry_esi).map(Datagram::Packet),
            TAG_ACK => Ack::decode(buf, carry_esi).map(Datagram::Ack),
            _ => None,
        }
    }
}
