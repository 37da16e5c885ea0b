//! # Slot Arenas
//!
//! The source transport this crate reimplements walks intrusive doubly-linked
//! lists of `Transmitter`/`Receiver` nodes via raw pointer arithmetic into
//! block buffers. Modeled here as a [`slab::Slab`] arena per slot kind
//! addressed by small integer ids, with an ascending `block_id → arena key`
//! index standing in for the intrusive list order.

use std::collections::BTreeMap;

use slab::Slab;

use crate::codec::{CodecFactory, Decoder, Encoder};
use crate::pacer::TokenBucket;

// ─── EncoderSlot ─────────────────────────────────────────────────────────────

/// Owns one generation's encoder, its `K·S`-byte block buffer, rank
/// tracking, and a per-encoder pacer and repair-debt counter.
pub struct EncoderSlot {
    pub block_id: u32,
    pub encoder: Encoder,
    /// Local rank: symbols loaded into the encoder so far.
    pub lrank: usize,
    /// Remote rank: highest rank acknowledged by the peer.
    pub rrank: usize,
    pub pacer: TokenBucket,
    /// Fractional in-line repair debt (`nmore` in the design notes).
    pub repair_debt: f64,
    /// Highest per-packet esi acknowledged so far, for loss-rate estimation
    /// meaningful only when the wire variant carries `esi`.
    pub max_ack_esi: Option<u32>,
    /// Count of distinct acks received for this generation.
    pub ack_count: u32,
    /// Next esi this slot will stamp on emitted packets, when carrying esi.
    pub next_esi: u32,
}

impl EncoderSlot {
    fn new(block_id: u32, factory: CodecFactory, seed: u64, pacer_rate_bytes_per_ms: f64) -> Self {
        EncoderSlot {
            block_id,
            encoder: factory.new_encoder(seed),
            lrank: 0,
            rrank: 0,
            pacer: TokenBucket::new(pacer_rate_bytes_per_ms),
            repair_debt: 0.0,
            max_ack_esi: None,
            ack_count: 0,
            next_esi: 0,
        }
    }

    /// `lrank == K ∧ rrank == K`.
    pub fn is_retirable(&self, k: usize) -> bool {
        self.lrank == k && self.rrank == k
    }

    pub fn is_full(&self, k: usize) -> bool {
        self.lrank == k
    }
}

/// Arena of open [`EncoderSlot`]s, ordered by ascending `block_id`.
pub struct EncoderSlotArena {
    arena: Slab<EncoderSlot>,
    order: BTreeMap<u32, usize>,
    capacity: usize,
}

impl EncoderSlotArena {
    /// `capacity` is the sender-side window `W`.
    pub fn new(capacity: usize) -> Self {
        EncoderSlotArena {
            arena: Slab::with_capacity(capacity),
            order: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.order.len() >= self.capacity
    }

    /// Allocate a new slot for `block_id`. Fails (returns `None`) if the
    /// window is already at capacity `W`.
    pub fn allocate(
        &mut self,
        block_id: u32,
        factory: CodecFactory,
        seed: u64,
        pacer_rate_bytes_per_ms: f64,
    ) -> Option<&mut EncoderSlot> {
        if self.is_full() {
            return None;
        }
        let slot = EncoderSlot::new(block_id, factory, seed, pacer_rate_bytes_per_ms);
        let key = self.arena.insert(slot);
        self.order.insert(block_id, key);
        Some(&mut self.arena[key])
    }

    /// The tail (highest `block_id`) slot, if any.
    pub fn tail_mut(&mut self) -> Option<&mut EncoderSlot> {
        let key = *self.order.values().next_back()?;
        Some(&mut self.arena[key])
    }

    pub fn tail_block_id(&self) -> Option<u32> {
        self.order.keys().next_back().copied()
    }

    /// Remove and return the slot for `block_id`, if present.
    pub fn remove(&mut self, block_id: u32) -> Option<EncoderSlot> {
        let key = self.order.remove(&block_id)?;
        Some(self.arena.remove(key))
    }

    pub fn get_mut(&mut self, block_id: u32) -> Option<&mut EncoderSlot> {
        let key = *self.order.get(&block_id)?;
        Some(&mut self.arena[key])
    }

    /// Ascending `block_id`s of every open slot. Callers that need to visit
    /// (and possibly mutate or remove) each slot walk this list and look
    /// slots up one at a time via [`get_mut`]/[`remove`] — keeping the
    /// borrow scoped to a single slot at a time avoids an unsafe reborrow.
    pub fn block_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.keys().copied()
    }
}

// ─── DecoderSlot ─────────────────────────────────────────────────────────────

/// Owns one generation's decoder and its `block_id`.
pub struct DecoderSlot {
    pub block_id: u32,
    pub decoder: Decoder,
}

impl DecoderSlot {
    fn new(block_id: u32, factory: CodecFactory) -> Self {
        let mut decoder = factory.new_decoder();
        decoder.set_mutable_block();
        DecoderSlot { block_id, decoder }
    }
}

/// Arena of open [`DecoderSlot`]s, ordered by ascending `block_id`. Unlike
/// the encoder arena this has no capacity bound — decoders are created
/// lazily on first in-window packet and may have temporary holes.
pub struct DecoderSlotArena {
    arena: Slab<DecoderSlot>,
    order: BTreeMap<u32, usize>,
}

impl DecoderSlotArena {
    pub fn new() -> Self {
        DecoderSlotArena {
            arena: Slab::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Locate the slot for `block_id`, allocating one in sorted position if
    /// absent.
    pub fn locate_or_allocate(&mut self, block_id: u32, factory: CodecFactory) -> &mut DecoderSlot {
        if !self.order.contains_key(&block_id) {
            let key = self.arena.insert(DecoderSlot::new(block_id, factory));
            self.order.insert(block_id, key);
        }
        let key = self.order[&block_id];
        &mut self.arena[key]
    }

    pub fn get_mut(&mut self, block_id: u32) -> Option<&mut DecoderSlot> {
        let key = *self.order.get(&block_id)?;
        Some(&mut self.arena[key])
    }

    /// The head (lowest `block_id`) slot, if any.
    pub fn head(&self) -> Option<&DecoderSlot> {
        let key = *self.order.values().next()?;
        Some(&self.arena[key])
    }

    pub fn head_block_id(&self) -> Option<u32> {
        self.order.keys().next().copied()
    }

    /// Remove and free the head slot (called on full extraction).
    pub fn remove_head(&mut self) -> Option<DecoderSlot> {
        let (block_id, key) = {
            let (&b, &k) = self.order.iter().next()?;
            (b, k)
        };
        self.order.remove(&block_id);
        Some(self.arena.remove(key))
    }
}

impl Default for DecoderSlotArena {
    fn default() -> Self {
        Self::new()
    }
}
