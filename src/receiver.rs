//! # Receiver State Machine
//!
//! Pure logic — no I/O. Accepts inbound datagrams, canonicalizes them into
//! generation order, dispatches payloads into per-generation decoders,
//! extracts decoded symbols strictly in index order, and reassembles the
//! original length-prefixed record stream.
//!
//! ## Responsibilities
//!
//! 1. **Intake**: sort arriving packets by `(block_id, esi)`, fast-retiring
//!    obsolete generations with a full-rank ack.
//! 2. **Dispatch**: feed grouped payloads into the head-ordered decoder list,
//!    acking every consumed packet.
//! 3. **Extract**: drain newly-uncoded symbols from the head generation only,
//!    in index order.
//! 4. **Reassemble**: strip `Len`-prefixes at record boundaries and emit
//!    complete records to the delivery queue.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::CodecFactory;
use crate::error::TransportError;
use crate::slots::DecoderSlotArena;
use crate::stats::ReceiverStats;
use crate::wire::{Ack, Packet};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Receiver configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Source symbols per generation (`K`), must match the peer sender's.
    pub k: usize,
    /// Symbol size in bytes (`S`), must match the peer sender's.
    pub s: usize,
    /// Whether wire packets carry a per-packet `esi` (must match the sender).
    pub carry_esi: bool,
    /// The fixed record length the reassembler expects.
    pub intended_len: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            k: 256,
            s: 1024,
            carry_esi: true,
            intended_len: 1500,
        }
    }
}

impl ReceiverConfig {
    fn validate(&self) -> Result<(), TransportError> {
        if self.k == 0 {
            return Err(TransportError::InvalidConfig("K must be > 0"));
        }
        if self.s == 0 {
            return Err(TransportError::InvalidConfig("S must be > 0"));
        }
        if self.intended_len < 2 {
            return Err(TransportError::InvalidConfig("intended_len must be >= 2"));
        }
        Ok(())
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Receiver state machine driving the intake/dispatch/extract/reassemble pipeline.
pub struct Receiver {
    config: ReceiverConfig,
    factory: CodecFactory,
    pending: VecDeque<Packet>,
    decoders: DecoderSlotArena,
    expected_block_id: u32,
    expected_symbol_id: usize,
    symbol_queue: VecDeque<Bytes>,
    /// Cross-call reassembly state: bytes of the record currently being
    /// filled, and how many more bytes it needs.
    open_record: Option<Vec<u8>>,
    open_remaining: usize,
    delivery: VecDeque<Bytes>,
    acks_out: VecDeque<Ack>,
    stats: ReceiverStats,
}

impl Receiver {
    /// Create a new receiver, or fail if `config` is out of range.
    pub fn new(config: ReceiverConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let factory = CodecFactory::new(config.k, config.s);
        Ok(Receiver {
            config,
            factory,
            pending: VecDeque::new(),
            decoders: DecoderSlotArena::new(),
            expected_block_id: 0,
            expected_symbol_id: 0,
            symbol_queue: VecDeque::new(),
            open_record: None,
            open_remaining: 0,
            delivery: VecDeque::new(),
            acks_out: VecDeque::new(),
            stats: ReceiverStats::new(),
        })
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Drain acks the receiver wants to send back (full-rank fast-retires
    /// and per-packet dispatch acks).
    pub fn drain_outbound_acks(&mut self) -> impl Iterator<Item = Ack> + '_ {
        self.acks_out.drain(..)
    }

    // ─── 4.4 Packet Intake ──────────────────────────────────────────────────

    /// Process one inbound datagram. The wall-clock soft bound on
    /// the intake phase is the caller's responsibility — this is the
    /// per-datagram step it repeats until time runs out or the socket is dry.
    pub fn intake(&mut self, packet: Packet) {
        self.stats.packets_received += 1;
        if packet.block_id < self.expected_block_id {
            self.stats.obsolete_dropped += 1;
            let k = self.config.k as u32;
            self.acks_out
                .push_back(Ack::full_rank(packet.block_id, packet.esi, k));
            tracing::trace!(block_id = packet.block_id, "obsolete packet dropped, full-rank ack sent");
            return;
        }

        self.pending
            .retain(|p| p.block_id >= self.expected_block_id);

        let pos = self
            .pending
            .iter()
            .position(|p| (p.block_id, p.esi.unwrap_or(0)) > (packet.block_id, packet.esi.unwrap_or(0)))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, packet);
    }

    // ─── 4.5 Dispatch to Decoders ───────────────────────────────────────────

    /// Feed pending packets into decoders, grouped by `block_id`, acking each
    /// one consumed.
    pub fn dispatch(&mut self) {
        while let Some(head) = self.pending.front() {
            let id = head.block_id;
            let mut group = Vec::new();
            while let Some(p) = self.pending.front() {
                if p.block_id != id {
                    break;
                }
                group.push(self.pending.pop_front().unwrap());
            }

            let slot = self.decoders.locate_or_allocate(id, self.factory);
            for packet in group {
                if !slot.decoder.is_complete() {
                    slot.decoder.read_payload(packet.payload.clone());
                }
                let rank = slot.decoder.rank() as u32;
                self.acks_out
                    .push_back(Ack::new(packet.block_id, packet.esi, rank));
            }
        }
    }

    // ─── 4.6 In-Order Symbol Extraction ─────────────────────────────────────

    /// Drain newly-uncoded symbols from the head decoder, in index order,
    /// only while it is the expected generation.
    pub fn extract(&mut self) {
        loop {
            let is_head_expected = self
                .decoders
                .head_block_id()
                .map(|id| id == self.expected_block_id)
                .unwrap_or(false);
            if !is_head_expected {
                return;
            }

            let k = self.config.k;
            loop {
                let slot = self.decoders.head().expect("checked above");
                if self.expected_symbol_id >= k || !slot.decoder.is_symbol_uncoded(self.expected_symbol_id) {
                    break;
                }
                let sym = Bytes::copy_from_slice(slot.decoder.symbol(self.expected_symbol_id));
                self.symbol_queue.push_back(sym);
                self.expected_symbol_id += 1;
            }

            if self.expected_symbol_id == k {
                self.expected_symbol_id = 0;
                self.expected_block_id += 1;
                let removed = self.decoders.remove_head();
                if let Some(slot) = &removed {
                    self.stats.symbols_recovered += slot.decoder.recovered_count() as u64;
                }
                self.stats.generations_extracted += 1;
                tracing::debug!(block_id = self.expected_block_id - 1, "generation extracted");
            } else {
                return;
            }
        }
    }

    // ─── 4.7 Record Reassembly ──────────────────────────────────────────────

    /// Strip `Len`-prefixes at record boundaries from newly-extracted
    /// symbols, emitting complete records to the delivery queue.
    pub fn reassemble(&mut self) {
        while let Some(symbol) = self.symbol_queue.pop_front() {
            let mut src = &symbol[..];
            while src.len() >= 2 || (self.open_remaining > 0 && !src.is_empty()) {
                if self.open_record.is_none() {
                    if src.len() < 2 {
                        break;
                    }
                    let len = u16::from_le_bytes([src[0], src[1]]);
                    if len == 0 {
                        break; // trailing padding
                    }
                    debug_assert_eq!(
                        len, self.config.intended_len,
                        "record length did not match the configured fixed length"
                    );
                    src = &src[2..];
                    self.open_record = Some(Vec::with_capacity(len as usize - 2));
                    self.open_remaining = len as usize - 2;
                }

                let take = self.open_remaining.min(src.len());
                if let Some(rec) = self.open_record.as_mut() {
                    rec.extend_from_slice(&src[..take]);
                }
                src = &src[take..];
                self.open_remaining -= take;

                if self.open_remaining == 0 {
                    let rec = self.open_record.take().expect("just filled");
                    self.delivery.push_back(Bytes::from(rec));
                    self.stats.records_delivered += 1;
                }
            }
        }
    }

    // ─── Delivery ────────────────────────────────────────────────────────────

    /// Pop the head of the delivery queue into `buf`. `n` must equal the
    /// record's payload length. Returns the number of bytes copied, or 0 if
    /// nothing is ready.
    pub fn deliver(&mut self, buf: &mut [u8], n: usize) -> usize {
        let Some(rec) = self.delivery.front() else {
            return 0;
        };
        assert_eq!(rec.len(), n, "deliver buffer size must match record length");
        buf[..n].copy_from_slice(rec);
        self.delivery.pop_front();
        n
    }

    pub fn has_pending_delivery(&self) -> bool {
        !self.delivery.is_empty()
    }

    /// Length of the record at the head of the delivery queue, if any. Lets
    /// a caller size its buffer before calling [`Receiver::deliver`] rather
    /// than assuming a fixed record length.
    pub fn next_delivery_len(&self) -> Option<usize> {
        self.delivery.front().map(|rec| rec.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecFactory;
    use bytes::BytesMut;

    fn receiver(k: usize, s: usize, intended_len: u16) -> Receiver {
        Receiver::new(ReceiverConfig {
            k,
            s,
            carry_esi: true,
            intended_len,
        })
        .unwrap()
    }

    /// Build a systematic payload the same way the encoder would, without
    /// pulling in the sender.
    fn systematic_payload(k: usize, s: usize, index: usize, data: &[u8]) -> Bytes {
        let factory = CodecFactory::new(k, s);
        let mut enc = factory.new_encoder(1);
        enc.load(index, data);
        let mut out = BytesMut::new();
        enc.write_systematic(index, &mut out);
        out.freeze()
    }

    #[test]
    fn rejects_invalid_config() {
        let err = Receiver::new(ReceiverConfig {
            k: 0,
            ..ReceiverConfig::default()
        })
        .unwrap_err();
        assert_eq!(err, TransportError::InvalidConfig("K must be > 0"));
    }

    #[test]
    fn obsolete_packet_gets_full_rank_ack_and_no_allocation() {
        let mut rx = receiver(4, 8, 8);
        rx.expected_block_id = 5;
        let payload = systematic_payload(4, 8, 0, &[1; 8]);
        rx.intake(Packet::new(2, Some(0), payload));
        assert_eq!(rx.decoders.len(), 0, "no allocation on obsolete intake");
        let acks: Vec<Ack> = rx.drain_outbound_acks().collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].rank, 4);
    }

    #[test]
    fn intake_sorts_pending_by_block_id_then_esi() {
        let mut rx = receiver(4, 8, 8);
        rx.intake(Packet::new(1, Some(0), Bytes::new()));
        rx.intake(Packet::new(0, Some(1), Bytes::new()));
        rx.intake(Packet::new(0, Some(0), Bytes::new()));
        let ids: Vec<(u32, u32)> = rx
            .pending
            .iter()
            .map(|p| (p.block_id, p.esi.unwrap()))
            .collect();
        assert_eq!(ids, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn dispatch_acks_every_packet() {
        let mut rx = receiver(2, 8, 8);
        let p0 = systematic_payload(2, 8, 0, &[9; 8]);
        rx.intake(Packet::new(0, Some(0), p0));
        rx.dispatch();
        let acks: Vec<Ack> = rx.drain_outbound_acks().collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].block_id, 0);
        assert_eq!(acks[0].rank, 1);
    }

    #[test]
    fn extract_pulls_symbols_only_from_expected_head() {
        let mut rx = receiver(2, 8, 8);
        let p0 = systematic_payload(2, 8, 0, &[1; 8]);
        let p1 = systematic_payload(2, 8, 1, &[2; 8]);
        rx.intake(Packet::new(0, Some(0), p0));
        rx.intake(Packet::new(0, Some(1), p1));
        rx.dispatch();
        rx.extract();
        assert_eq!(rx.symbol_queue.len(), 2);
        assert_eq!(rx.expected_block_id, 1);
        assert_eq!(rx.expected_symbol_id, 0);
        assert_eq!(rx.decoders.len(), 0, "fully extracted generation is freed");
    }

    #[test]
    fn full_pipeline_reassembles_a_record() {
        // K=1, S=16: one symbol carries a 10-byte record (Len=10) plus
        // zero-padding.
        let k = 1;
        let s = 16;
        let mut rx = receiver(k, s, 10);

        let mut symbol = vec![0u8; s];
        symbol[0..2].copy_from_slice(&10u16.to_le_bytes());
        symbol[2..10].copy_from_slice(b"abcdefgh");

        let factory = CodecFactory::new(k, s);
        let mut enc = factory.new_encoder(42);
        enc.load(0, &symbol);
        let mut payload = BytesMut::new();
        enc.write_systematic(0, &mut payload);

        rx.intake(Packet::new(0, Some(0), payload.freeze()));
        rx.dispatch();
        rx.extract();
        rx.reassemble();

        assert!(rx.has_pending_delivery());
        let mut buf = [0u8; 8];
        let n = rx.deliver(&mut buf, 8);
        assert_eq!(n, 8);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn deliver_returns_zero_when_nothing_ready() {
        let mut rx = receiver(2, 8, 8);
        let mut buf = [0u8; 4];
        assert_eq!(rx.deliver(&mut buf, 4), 0);
    }

    #[test]
    fn duplicate_payload_to_complete_decoder_still_acks() {
        let mut rx = receiver(1, 8, 8);
        let p0 = systematic_payload(1, 8, 0, &[5; 8]);
        rx.intake(Packet::new(0, Some(0), p0.clone()));
        rx.dispatch();
        rx.drain_outbound_acks().for_each(drop);
        rx.intake(Packet::new(0, Some(1), p0));
        rx.dispatch();
        let acks: Vec<Ack> = rx.drain_outbound_acks().collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].rank, 1, "decoder already complete, rank unchanged");
    }
}
