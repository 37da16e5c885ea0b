//! # Sender State Machine
//!
//! Pure logic — no I/O. Accepts application records, segments them into
//! fixed-size symbols, drives a pipeline of concurrent generation encoders,
//! paces systematic/repair emission under a token bucket, and folds ack
//! feedback into per-encoder rank and a global loss-rate estimate.
//!
//! ## Responsibilities
//!
//! 1. **Ingest & segment**: buffer submitted records, slice into `S`-byte
//!    symbols closing on the next record's 2-byte length prefix.
//! 2. **Encode & emit**: load symbols into the tail encoder, emit the
//!    systematic copy immediately.
//! 3. **Feedback**: fold inbound acks into per-encoder remote rank.
//! 4. **Fountain**: paced repair emission and retirement of fully-acked
//!    generations.
//!
//! The sender does not own a socket; it hands the caller `Bytes` to send and
//! expects acks to be pushed back in via [`Sender::feedback`].

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::CodecFactory;
use crate::error::TransportError;
use crate::slots::EncoderSlotArena;
use crate::stats::{Ewma, RateCounter, SenderStats};
use crate::wire::{Ack, Packet};

/// Window over which [`Sender::emission_rate_bytes_per_sec`] is averaged.
const EMIT_RATE_WINDOW: Duration = Duration::from_secs(1);

// ─── Configuration ──────────────────────────────────────────────────────────

/// Sender configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Source symbols per generation (`K`).
    pub k: usize,
    /// Symbol size in bytes (`S`), should be >= 512.
    pub s: usize,
    /// Max concurrently open encoders (`W`).
    pub w: usize,
    /// Per-encoder fountain pacer rate, bytes/ms.
    pub pacer_rate_bytes_per_ms: f64,
    /// Whether wire packets carry a per-packet `esi` (required for the loss
    /// estimator; see §4.3/§9).
    pub carry_esi: bool,
    /// Emit extra coded packets inline with each systematic load, scaled by
    /// the current loss-rate estimate (§4.2's "in-line repair debt" variant).
    /// When `false`, all repair emission happens in the asynchronous
    /// fountain phase only.
    pub inline_repair_debt: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            k: 256,
            s: 1024,
            w: 5,
            pacer_rate_bytes_per_ms: 1024.0,
            carry_esi: true,
            inline_repair_debt: false,
        }
    }
}

impl SenderConfig {
    fn validate(&self) -> Result<(), TransportError> {
        if self.k == 0 {
            return Err(TransportError::InvalidConfig("K must be > 0"));
        }
        if self.s == 0 {
            return Err(TransportError::InvalidConfig("S must be > 0"));
        }
        if self.w == 0 {
            return Err(TransportError::InvalidConfig("W must be > 0"));
        }
        Ok(())
    }
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// A record awaiting segmentation: `Len`-prefixed application bytes.
struct SourceRecord {
    /// Encoded as `[len_lo, len_hi, ..bytes]`, `len = bytes.len() + 2`.
    framed: Bytes,
}

/// Sender state machine driving the ingest/segment/encode/feedback/fountain pipeline.
pub struct Sender {
    config: SenderConfig,
    factory: CodecFactory,
    ingest: VecDeque<SourceRecord>,
    symbol_queue: VecDeque<Bytes>,
    /// Currently-filling symbol and its write cursor.
    filling: Vec<u8>,
    fill_cursor: usize,
    encoders: EncoderSlotArena,
    next_block_id: u32,
    next_seed: u64,
    loss_rate: Ewma,
    stats: SenderStats,
    out: VecDeque<Packet>,
    /// Windowed goodput counter over emitted wire bytes, for ambient
    /// throughput reporting (spec §4.9's "ambient stack").
    emit_rate: RateCounter,
}

impl Sender {
    /// Create a new sender, or fail if `config` is out of range.
    pub fn new(config: SenderConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let factory = CodecFactory::new(config.k, config.s);
        let s = config.s;
        Ok(Sender {
            encoders: EncoderSlotArena::new(config.w),
            config,
            factory,
            ingest: VecDeque::new(),
            symbol_queue: VecDeque::new(),
            filling: vec![0u8; s],
            fill_cursor: 0,
            next_block_id: 0,
            next_seed: 1,
            loss_rate: Ewma::new(0.5),
            stats: SenderStats::new(),
            out: VecDeque::new(),
            emit_rate: RateCounter::new(EMIT_RATE_WINDOW),
        })
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Wire bytes emitted per second, averaged over the trailing
    /// [`EMIT_RATE_WINDOW`].
    pub fn emission_rate_bytes_per_sec(&self) -> f64 {
        self.emit_rate.rate()
    }

    // ─── 4.1 Ingest & Segmentation ──────────────────────────────────────────

    /// Copy `buf[..n]` into a new SourceRecord (`Len = n + 2`) and enqueue it
    /// Never fails for well-formed inputs.
    pub fn submit(&mut self, buf: &[u8], n: usize) {
        let len = (n + 2) as u16;
        let mut framed = BytesMut::with_capacity(n + 2);
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(&buf[..n]);
        self.ingest.push_back(SourceRecord {
            framed: framed.freeze(),
        });
        tracing::trace!(n, "record submitted");
    }

    /// Drain the ingest queue into the symbol queue.
    pub fn segment(&mut self) {
        while let Some(record) = self.ingest.pop_front() {
            let mut src = &record.framed[..];
            while !src.is_empty() {
                let remaining = self.config.s - self.fill_cursor;
                let take = remaining.min(src.len());
                self.filling[self.fill_cursor..self.fill_cursor + take]
                    .copy_from_slice(&src[..take]);
                self.fill_cursor += take;
                src = &src[take..];

                let cap_left = self.config.s - self.fill_cursor;
                if cap_left == 0 || cap_left == 1 {
                    self.close_symbol();
                }
            }
        }
        // Drained the ingest queue for this call; close any remainder so it
        // reaches the encoder pipeline rather than sitting invisible until
        // the next submission arrives.
        self.flush_partial_symbol();
    }

    /// Close out any partially-filled symbol. Idempotent when nothing is
    /// open; exposed separately so callers can force a flush (e.g. at
    /// shutdown) without submitting more data first.
    pub fn flush_partial_symbol(&mut self) {
        if self.fill_cursor > 0 {
            self.close_symbol();
        }
    }

    fn close_symbol(&mut self) {
        let symbol = Bytes::copy_from_slice(&self.filling);
        self.symbol_queue.push_back(symbol);
        self.filling.iter_mut().for_each(|b| *b = 0);
        self.fill_cursor = 0;
    }

    // ─── 4.2 Encoder Pipeline ───────────────────────────────────────────────

    /// Load queued symbols into the encoder window, emitting a systematic
    /// packet immediately for each.
    pub fn flush_symbols_to_encoders(&mut self) {
        while !self.symbol_queue.is_empty() {
            let k = self.config.k;
            if self.encoders.tail_mut().map(|s| s.lrank == k).unwrap_or(true) {
                if self.encoders.is_full() {
                    break;
                }
                let block_id = self.next_block_id;
                self.next_block_id += 1;
                let seed = self.next_seed;
                self.next_seed = self.next_seed.wrapping_add(1);
                self.encoders
                    .allocate(block_id, self.factory, seed, self.config.pacer_rate_bytes_per_ms)
                    .expect("just checked capacity");
                tracing::debug!(block_id, "encoder slot opened");
            }

            let symbol = self.symbol_queue.pop_front().expect("checked non-empty");
            let slot = self.encoders.tail_mut().expect("just ensured an open slot");
            let index = slot.lrank;
            slot.encoder.load(index, &symbol);
            slot.lrank = slot.encoder.rank();
            self.stats.symbols_loaded += 1;

            let mut payload = BytesMut::new();
            slot.encoder.write_systematic(index, &mut payload);
            let esi = self.config.carry_esi.then(|| {
                let e = slot.next_esi;
                slot.next_esi += 1;
                e
            });
            let packet = Packet::new(slot.block_id, esi, payload.freeze());
            self.emit_rate.record(packet.encoded_len() as u64);
            self.out.push_back(packet);
            self.stats.systematic_sent += 1;

            if self.config.inline_repair_debt {
                self.emit_inline_repair_debt(slot.block_id);
            }
        }
    }

    fn emit_inline_repair_debt(&mut self, block_id: u32) {
        let p = self.loss_rate.value();
        let slot = match self.encoders.get_mut(block_id) {
            Some(s) => s,
            None => return,
        };
        slot.repair_debt += p;
        while slot.repair_debt >= 1.0 {
            slot.repair_debt -= 1.0;
            let mut payload = BytesMut::new();
            slot.encoder.write_repair(&mut payload);
            let esi = self.config.carry_esi.then(|| {
                let e = slot.next_esi;
                slot.next_esi += 1;
                e
            });
            let packet = Packet::new(slot.block_id, esi, payload.freeze());
            self.emit_rate.record(packet.encoded_len() as u64);
            self.out.push_back(packet);
            self.stats.repairs_sent += 1;
        }
    }

    // ─── 4.3 Feedback & Fountain ────────────────────────────────────────────

    /// Fold one inbound ack into per-encoder remote rank.
    /// Acks for unknown block ids are dropped silently.
    pub fn feedback(&mut self, ack: Ack) {
        if let Some(slot) = self.encoders.get_mut(ack.block_id) {
            slot.rrank = slot.rrank.max(ack.rank as usize);
            slot.ack_count += 1;
            if let Some(esi) = ack.esi {
                slot.max_ack_esi = Some(slot.max_ack_esi.map_or(esi, |m| m.max(esi)));
            }
        } else {
            tracing::trace!(block_id = ack.block_id, "ack for unknown block dropped");
        }
    }

    /// Walk the encoder list, retiring fully-acked slots and emitting paced
    /// repair packets for the rest.
    pub fn fountain(&mut self) {
        let k = self.config.k;
        let block_ids: Vec<u32> = self.encoders.block_ids().collect();
        for block_id in block_ids {
            let retirable = self
                .encoders
                .get_mut(block_id)
                .map(|s| s.is_retirable(k))
                .unwrap_or(false);
            if retirable {
                self.retire(block_id);
                continue;
            }

            let slot = match self.encoders.get_mut(block_id) {
                Some(s) => s,
                None => continue,
            };
            if slot.lrank <= slot.rrank {
                continue;
            }
            let max_payload = self.factory.max_payload() as u64;
            if !slot.pacer.acquire(max_payload) {
                continue;
            }
            let mut payload = BytesMut::new();
            slot.encoder.write_repair(&mut payload);
            let esi = self.config.carry_esi.then(|| {
                let e = slot.next_esi;
                slot.next_esi += 1;
                e
            });
            let packet = Packet::new(slot.block_id, esi, payload.freeze());
            self.emit_rate.record(packet.encoded_len() as u64);
            self.out.push_back(packet);
            self.stats.repairs_sent += 1;
        }
    }

    fn retire(&mut self, block_id: u32) {
        if let Some(slot) = self.encoders.remove(block_id) {
            if let Some(max_ack_esi) = slot.max_ack_esi {
                let denom = (max_ack_esi + 1) as f64;
                let local = ((denom - slot.ack_count as f64) / denom).clamp(0.0, 1.0);
                let p = self.loss_rate.update(local);
                self.stats.loss_rate = p;
                tracing::debug!(block_id, loss_rate = p, "encoder retired");
            } else {
                tracing::debug!(block_id, "encoder retired (no esi, loss rate unchanged)");
            }
            self.stats.generations_retired += 1;
        }
    }

    /// Drain packets staged for transmission. The caller owns actually
    /// sending them to the socket.
    pub fn drain_outbound(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.out.drain(..)
    }

    pub fn outbound_len(&self) -> usize {
        self.out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(k: usize, s: usize, w: usize) -> Sender {
        Sender::new(SenderConfig {
            k,
            s,
            w,
            pacer_rate_bytes_per_ms: 1_000_000.0,
            carry_esi: true,
            inline_repair_debt: false,
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let err = Sender::new(SenderConfig {
            k: 0,
            ..SenderConfig::default()
        })
        .unwrap_err();
        assert_eq!(err, TransportError::InvalidConfig("K must be > 0"));
    }

    #[test]
    fn submit_then_segment_produces_symbol() {
        let mut tx = sender(4, 16, 2);
        tx.submit(b"hello", 5);
        tx.segment();
        tx.flush_partial_symbol();
        assert_eq!(tx.symbol_queue.len(), 1);
        let sym = &tx.symbol_queue[0];
        assert_eq!(sym.len(), 16);
        assert_eq!(&sym[0..2], &7u16.to_le_bytes());
        assert_eq!(&sym[2..7], b"hello");
        assert!(sym[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn segment_closes_on_one_byte_remaining() {
        // S=8: a record needing exactly 7 bytes leaves 1 byte of capacity,
        // which must close the symbol rather than try to start the next
        // record's length prefix there.
        let mut tx = sender(4, 8, 2);
        tx.submit(b"12345", 5); // Len=7, fills 7 of 8 bytes
        tx.submit(b"x", 1);
        tx.segment();
        tx.flush_partial_symbol();
        assert_eq!(tx.symbol_queue.len(), 2);
    }

    #[test]
    fn flush_symbols_emits_systematic_packets() {
        let mut tx = sender(2, 8, 2);
        tx.submit(b"abcdef", 6);
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        assert_eq!(tx.outbound_len(), 1);
        let pkt = tx.drain_outbound().next().unwrap();
        assert_eq!(pkt.block_id, 0);
        assert!(pkt.esi.is_some());
    }

    #[test]
    fn window_caps_open_encoders() {
        let mut tx = sender(1, 8, 1);
        // Three generations worth of symbols, but W=1 — only the first
        // generation's encoder should open until it retires.
        for _ in 0..3 {
            tx.submit(b"xx", 2);
        }
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        assert_eq!(tx.encoders.len(), 1);
        assert!(!tx.symbol_queue.is_empty(), "remaining symbols blocked by W=1");
    }

    #[test]
    fn feedback_updates_rrank_monotonically() {
        let mut tx = sender(4, 8, 2);
        tx.submit(b"xx", 2);
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        tx.feedback(Ack::new(0, Some(0), 2));
        tx.feedback(Ack::new(0, Some(1), 1)); // lower rank must not regress
        assert_eq!(tx.encoders.get_mut(0).unwrap().rrank, 2);
    }

    #[test]
    fn feedback_for_unknown_block_is_dropped() {
        let mut tx = sender(4, 8, 2);
        tx.feedback(Ack::new(99, None, 4)); // must not panic
    }

    #[test]
    fn fountain_retires_fully_acked_generation() {
        let mut tx = sender(1, 8, 2);
        tx.submit(b"xx", 2);
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        tx.feedback(Ack::new(0, Some(0), 1));
        tx.fountain();
        assert_eq!(tx.encoders.len(), 0);
        assert_eq!(tx.stats().generations_retired, 1);
    }

    #[test]
    fn fountain_emits_repair_when_lrank_exceeds_rrank() {
        let mut tx = sender(2, 8, 2);
        tx.submit(b"xxxx", 4);
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        let systematic_count = tx.outbound_len();
        tx.fountain();
        assert!(tx.outbound_len() > systematic_count, "fountain should emit a repair packet");
    }

    #[test]
    fn emission_rate_tracks_emitted_bytes() {
        let mut tx = sender(2, 8, 2);
        assert_eq!(tx.emission_rate_bytes_per_sec(), 0.0);
        tx.submit(b"xxxx", 4);
        tx.segment();
        tx.flush_partial_symbol();
        tx.flush_symbols_to_encoders();
        assert!(
            tx.emission_rate_bytes_per_sec() > 0.0,
            "emitting a systematic packet should register against the rate counter"
        );
    }
}
