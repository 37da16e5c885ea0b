//! # Generation Codec
//!
//! A systematic rateless encoder/decoder pair over GF(256), generalized from a
//! sliding-window random linear network coding engine into the fixed-generation
//! shape this transport's data model requires: exactly `K` symbols of size `S`
//! per generation, addressed by index rather than a global sequence number.
//!
//! The first `K` payloads an encoder writes are systematic (unmodified source
//! symbols, one per `load`); every payload after that is a non-trivial GF(256)
//! linear combination of all `K` symbols ("repair"). The decoder accepts
//! payloads in any order — systematic or repair, any mix — and recovers the
//! full generation by Gaussian elimination as soon as its rank reaches `K`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── GF(256) Arithmetic ─────────────────────────────────────────────────────

/// GF(2^8) with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D).
/// 2 is a primitive element (generator) with order 255.
mod gf256 {
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let log_a = LOG_TABLE[a as usize] as u16;
        let log_b = LOG_TABLE[b as usize] as u16;
        let log_sum = (log_a + log_b) % 255;
        EXP_TABLE[log_sum as usize]
    }

    pub fn inv(a: u8) -> u8 {
        assert_ne!(a, 0, "inverse of zero in GF(256)");
        let log_a = LOG_TABLE[a as usize] as u16;
        EXP_TABLE[(255 - log_a) as usize]
    }

    const fn gen_tables() -> ([u8; 256], [u8; 512]) {
        let mut log = [0u8; 256];
        let mut exp = [0u8; 512];
        let mut x: u16 = 1;
        let mut i = 0usize;
        while i < 255 {
            exp[i] = x as u8;
            exp[i + 255] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11D;
            }
            i += 1;
        }
        log[0] = 0;
        (log, exp)
    }

    const TABLES: ([u8; 256], [u8; 512]) = gen_tables();
    const LOG_TABLE: [u8; 256] = TABLES.0;
    const EXP_TABLE: [u8; 512] = TABLES.1;
}

/// xoshiro256** PRNG, splitmix64-seeded — deterministic coefficient
/// generation so repair payloads are reproducible given a seed.
struct Xoshiro256 {
    s: [u64; 4],
}

impl Xoshiro256 {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut z = seed;
        for slot in &mut s {
            z = z.wrapping_add(0x9e3779b97f4a7c15);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            *slot = z ^ (z >> 31);
        }
        Xoshiro256 { s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = self.s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// A uniformly random nonzero byte (GF(256) coefficients must be nonzero
    /// to guarantee a row contributes information).
    fn next_nonzero_byte(&mut self) -> u8 {
        loop {
            let b = (self.next_u64() & 0xFF) as u8;
            if b != 0 {
                return b;
            }
        }
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Produces encoders and decoders pre-configured with `k`, `s`, and
/// `max_payload`.
#[derive(Debug, Clone, Copy)]
pub struct CodecFactory {
    k: usize,
    s: usize,
}

impl CodecFactory {
    /// `k` source symbols per generation, `s` bytes per symbol.
    pub fn new(k: usize, s: usize) -> Self {
        assert!(k > 0, "K must be > 0");
        assert!(s > 0, "S must be > 0");
        CodecFactory { k, s }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn s(&self) -> usize {
        self.s
    }

    /// Coded payload size: `k` one-byte coefficients + `s` data bytes.
    /// Systematic payloads (the first `k` writes) also fit this budget —
    /// `write_payload` zero-pads the coefficient vector to a one-hot vector
    /// so the wire format is uniform regardless of whether a given payload
    /// happens to be systematic.
    pub fn max_payload(&self) -> usize {
        self.k + self.s
    }

    pub fn new_encoder(&self, seed: u64) -> Encoder {
        Encoder::new(self.k, self.s, seed)
    }

    pub fn new_decoder(&self) -> Decoder {
        Decoder::new(self.k, self.s)
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// A generation's encoder: `k` symbol slots, filled by index, emitting
/// systematic packets while below rank `k` and repair packets thereafter.
pub struct Encoder {
    k: usize,
    s: usize,
    symbols: Vec<Option<Bytes>>,
    rank: usize,
    rng: Xoshiro256,
}

impl Encoder {
    fn new(k: usize, s: usize, seed: u64) -> Self {
        Encoder {
            k,
            s,
            symbols: vec![None; k],
            rank: 0,
            rng: Xoshiro256::new(seed),
        }
    }

    /// Stage a source symbol at `index`. `buf` must be exactly `s` bytes
    /// (the sender zero-pads short trailing symbols before calling this).
    pub fn load(&mut self, index: usize, buf: &[u8]) {
        assert_eq!(buf.len(), self.s, "symbol must be exactly S bytes");
        assert!(index < self.k, "symbol index out of range");
        if self.symbols[index].is_none() {
            self.rank += 1;
        }
        self.symbols[index] = Some(Bytes::copy_from_slice(buf));
    }

    /// Current rank: number of symbols loaded so far, monotone.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_full(&self) -> bool {
        self.rank == self.k
    }

    /// Produce one coded payload. While `next_systematic < k` and that slot
    /// is loaded, emits the systematic copy (one-hot coefficient vector);
    /// otherwise emits a repair combination over all loaded symbols.
    /// `next_systematic` is caller-tracked (the sender's per-slot `lrank`
    /// walk) so each systematic symbol is emitted exactly once
    /// at load time.
    pub fn write_systematic(&self, index: usize, out: &mut BytesMut) -> usize {
        let sym = self.symbols[index]
            .as_ref()
            .expect("write_systematic called on unloaded index");
        out.reserve(self.k + self.s);
        for i in 0..self.k {
            out.put_u8(if i == index { 1 } else { 0 });
        }
        out.put_slice(sym);
        self.k + self.s
    }

    /// Produce one repair payload: a random linear combination of all
    /// currently loaded symbols over GF(256).
    pub fn write_repair(&mut self, out: &mut BytesMut) -> usize {
        let mut coeffs = vec![0u8; self.k];
        let mut combined = vec![0u8; self.s];
        for (i, sym) in self.symbols.iter().enumerate() {
            if let Some(sym) = sym {
                let c = self.rng.next_nonzero_byte();
                coeffs[i] = c;
                for (j, &byte) in sym.iter().enumerate() {
                    combined[j] ^= gf256::mul(c, byte);
                }
            }
        }
        out.reserve(self.k + self.s);
        out.put_slice(&coeffs);
        out.put_slice(&combined);
        self.k + self.s
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// A row of the decoder's augmented coefficient matrix.
#[derive(Clone)]
struct Row {
    coeffs: Vec<u8>,
    data: Vec<u8>,
    /// Number of nonzero coefficients in the payload as received, before any
    /// reduction against already-known symbols. A row that arrived with
    /// weight 1 is a systematic copy; resolving a column from a
    /// higher-weight row is genuine erasure recovery (tracked by
    /// [`Decoder::recovered_count`]).
    arrival_weight: usize,
}

/// A generation's decoder: accumulates coded payloads (systematic or
/// repair, any order) and reduces them by Gaussian elimination as rank
/// allows. Recovered and directly-received symbols are written in place
/// into the caller-supplied mutable block (`set_mutable_block`).
pub struct Decoder {
    k: usize,
    s: usize,
    rows: Vec<Row>,
    /// `uncoded[i]` is `Some` once symbol `i` is fully known (received
    /// systematic or recovered by elimination) and written into `block`.
    uncoded: Vec<bool>,
    block: Vec<u8>,
    rank: usize,
    /// Symbols resolved by Gaussian elimination from a row that did not
    /// arrive as a lone systematic copy (arrival weight > 1).
    recovered_count: usize,
}

impl Decoder {
    fn new(k: usize, s: usize) -> Self {
        Decoder {
            k,
            s,
            rows: Vec::new(),
            uncoded: vec![false; k],
            block: vec![0u8; k * s],
            rank: 0,
            recovered_count: 0,
        }
    }

    /// Designate the region recovered symbols are written into. The decoder
    /// owns a `k*s`-byte buffer internally and this call simply resets it;
    /// kept as an explicit step to mirror the encoder/decoder contract.
    pub fn set_mutable_block(&mut self) {
        self.block.iter_mut().for_each(|b| *b = 0);
    }

    /// Ingest one coded payload: `k` coefficient bytes followed by `s` data
    /// bytes (the uniform wire shape `write_systematic`/`write_repair`
    /// produce).
    pub fn read_payload(&mut self, mut payload: impl Buf) {
        if payload.remaining() < self.k + self.s {
            return; // malformed/truncated — dropped
        }
        let mut coeffs = vec![0u8; self.k];
        payload.copy_to_slice(&mut coeffs);
        let mut data = vec![0u8; self.s];
        payload.copy_to_slice(&mut data);

        let arrival_weight = coeffs.iter().filter(|&&c| c != 0).count();
        self.reduce_by_known(&mut coeffs, &mut data);
        if coeffs.iter().all(|&c| c == 0) {
            return; // entirely explained by what we already know
        }
        self.rows.push(Row {
            coeffs,
            data,
            arrival_weight,
        });
        self.eliminate();
    }

    fn reduce_by_known(&self, coeffs: &mut [u8], data: &mut [u8]) {
        for i in 0..self.k {
            if coeffs[i] == 0 || !self.uncoded[i] {
                continue;
            }
            let known = &self.block[i * self.s..(i + 1) * self.s];
            let c = coeffs[i];
            for (j, &byte) in known.iter().enumerate() {
                data[j] ^= gf256::mul(c, byte);
            }
            coeffs[i] = 0;
        }
    }

    /// Row-reduce the pending rows against each other and extract any
    /// newly-determined symbols into `block`/`uncoded`.
    fn eliminate(&mut self) {
        loop {
            // Reduce every pending row against already-known symbols — a row
            // may have become a pivot after a previous iteration revealed a
            // new symbol.
            for row in &mut self.rows {
                for i in 0..self.k {
                    if row.coeffs[i] == 0 || !self.uncoded[i] {
                        continue;
                    }
                    let known = &self.block[i * self.s..(i + 1) * self.s];
                    let c = row.coeffs[i];
                    for (j, &byte) in known.iter().enumerate() {
                        row.data[j] ^= gf256::mul(c, byte);
                    }
                    row.coeffs[i] = 0;
                }
            }
            self.rows.retain(|r| r.coeffs.iter().any(|&c| c != 0));

            // Find a row that is now a unit vector (exactly one nonzero
            // coefficient) — that symbol is fully determined.
            let mut found = None;
            for (ri, row) in self.rows.iter().enumerate() {
                let nonzero: Vec<usize> = row
                    .coeffs
                    .iter()
                    .enumerate()
                    .filter(|&(_, &c)| c != 0)
                    .map(|(i, _)| i)
                    .collect();
                if nonzero.len() == 1 {
                    found = Some((ri, nonzero[0]));
                    break;
                }
            }

            let (ri, col) = match found {
                Some(x) => x,
                None => {
                    self.full_gaussian_pass();
                    return;
                }
            };
            let row = self.rows.remove(ri);
            let inv = gf256::inv(row.coeffs[col]);
            let dest = &mut self.block[col * self.s..(col + 1) * self.s];
            for (j, slot) in dest.iter_mut().enumerate() {
                *slot = gf256::mul(row.data[j], inv);
            }
            self.uncoded[col] = true;
            self.rank += 1;
            if row.arrival_weight > 1 {
                self.recovered_count += 1;
            }
        }
    }

    /// Full elimination pass over the whole pending set — covers the case
    /// where no single row is yet a unit vector but the *set* of rows has
    /// enough rank to solve several unknowns at once.
    fn full_gaussian_pass(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let unknown_cols: Vec<usize> = (0..self.k).filter(|&i| !self.uncoded[i]).collect();
        if unknown_cols.is_empty() {
            return;
        }

        let mut matrix = self.rows.clone();
        let mut pivot_row = 0usize;
        let mut pivots: Vec<(usize, usize)> = Vec::new(); // (col, row)

        for &col in &unknown_cols {
            let found = (pivot_row..matrix.len()).find(|&r| matrix[r].coeffs[col] != 0);
            let row_idx = match found {
                Some(r) => r,
                None => continue,
            };
            matrix.swap(pivot_row, row_idx);

            let inv = gf256::inv(matrix[pivot_row].coeffs[col]);
            for c in &mut matrix[pivot_row].coeffs {
                *c = gf256::mul(*c, inv);
            }
            for d in &mut matrix[pivot_row].data {
                *d = gf256::mul(*d, inv);
            }

            for other in 0..matrix.len() {
                if other == pivot_row {
                    continue;
                }
                let factor = matrix[other].coeffs[col];
                if factor == 0 {
                    continue;
                }
                let (pivot_coeffs, pivot_data) =
                    (matrix[pivot_row].coeffs.clone(), matrix[pivot_row].data.clone());
                for (j, pc) in pivot_coeffs.iter().enumerate() {
                    matrix[other].coeffs[j] ^= gf256::mul(factor, *pc);
                }
                for (j, pd) in pivot_data.iter().enumerate() {
                    matrix[other].data[j] ^= gf256::mul(factor, *pd);
                }
            }

            pivots.push((col, pivot_row));
            pivot_row += 1;
        }

        for (col, prow) in pivots {
            let row = &matrix[prow];
            let is_unit = row
                .coeffs
                .iter()
                .enumerate()
                .all(|(j, &c)| (j == col) == (c != 0) && (j != col || c == 1));
            if !is_unit {
                continue;
            }
            let dest = &mut self.block[col * self.s..(col + 1) * self.s];
            dest.copy_from_slice(&row.data);
            self.uncoded[col] = true;
            self.rank += 1;
            // Reaching a symbol through the full multi-row pass (rather than
            // a lone unit-vector row) always means a genuine combination of
            // more than one arrival was needed.
            self.recovered_count += 1;
        }
        self.rows.retain(|r| r.coeffs.iter().any(|&c| c != 0));
    }

    /// True iff symbol `index` is fully decoded in place.
    pub fn is_symbol_uncoded(&self, index: usize) -> bool {
        self.uncoded[index]
    }

    /// Bytes of symbol `index` (valid only when [`is_symbol_uncoded`] is true).
    pub fn symbol(&self, index: usize) -> &[u8] {
        &self.block[index * self.s..(index + 1) * self.s]
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_complete(&self) -> bool {
        self.rank == self.k
    }

    /// Symbols resolved by genuine erasure recovery (a row combining more
    /// than one arrival) rather than a lone systematic copy.
    pub fn recovered_count(&self) -> usize {
        self.recovered_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(byte: u8, s: usize) -> Vec<u8> {
        vec![byte; s]
    }

    #[test]
    fn systematic_round_trip_no_loss() {
        let factory = CodecFactory::new(4, 8);
        let mut enc = factory.new_encoder(1);
        let mut dec = factory.new_decoder();

        for i in 0..4 {
            let data = sym(i as u8 + 1, 8);
            enc.load(i, &data);
            let mut out = BytesMut::new();
            enc.write_systematic(i, &mut out);
            dec.read_payload(out.freeze());
        }

        assert!(dec.is_complete());
        for i in 0..4 {
            assert!(dec.is_symbol_uncoded(i));
            assert_eq!(dec.symbol(i), &sym(i as u8 + 1, 8)[..]);
        }
        assert_eq!(dec.recovered_count(), 0, "all-systematic delivery recovers nothing");
    }

    #[test]
    fn repair_recovers_single_loss() {
        let factory = CodecFactory::new(4, 8);
        let mut enc = factory.new_encoder(7);
        let mut dec = factory.new_decoder();

        for i in 0..4 {
            enc.load(i, &sym(i as u8 + 10, 8));
        }

        // Deliver systematic for 0,1,3 — drop 2 — plus one repair.
        for i in [0usize, 1, 3] {
            let mut out = BytesMut::new();
            enc.write_systematic(i, &mut out);
            dec.read_payload(out.freeze());
        }
        let mut repair = BytesMut::new();
        enc.write_repair(&mut repair);
        dec.read_payload(repair.freeze());

        assert!(dec.is_complete());
        assert_eq!(dec.symbol(2), &sym(12, 8)[..]);
        assert_eq!(dec.recovered_count(), 1, "symbol 2 was resolved from the repair row, not delivered directly");
    }

    #[test]
    fn insufficient_rank_stays_incomplete() {
        let factory = CodecFactory::new(4, 8);
        let mut enc = factory.new_encoder(99);
        let mut dec = factory.new_decoder();
        for i in 0..4 {
            enc.load(i, &sym(i as u8, 8));
        }
        let mut repair = BytesMut::new();
        enc.write_repair(&mut repair);
        dec.read_payload(repair.freeze());

        assert!(!dec.is_complete());
        assert_eq!(dec.rank(), 0);
    }

    #[test]
    fn multiple_repairs_recover_multiple_losses() {
        let factory = CodecFactory::new(6, 16);
        let mut enc = factory.new_encoder(555);
        let mut dec = factory.new_decoder();
        for i in 0..6 {
            enc.load(i, &sym(i as u8 + 1, 16));
        }
        // Receive only symbols 0, 5 systematic; need 4 repairs for 1,2,3,4.
        for i in [0usize, 5] {
            let mut out = BytesMut::new();
            enc.write_systematic(i, &mut out);
            dec.read_payload(out.freeze());
        }
        for _ in 0..4 {
            let mut out = BytesMut::new();
            enc.write_repair(&mut out);
            dec.read_payload(out.freeze());
        }
        assert!(dec.is_complete());
        for i in 0..6 {
            assert_eq!(dec.symbol(i), &sym(i as u8 + 1, 16)[..]);
        }
    }

    #[test]
    fn duplicate_payload_is_idempotent() {
        let factory = CodecFactory::new(2, 4);
        let mut enc = factory.new_encoder(3);
        let mut dec = factory.new_decoder();
        enc.load(0, &sym(1, 4));
        enc.load(1, &sym(2, 4));

        let mut out = BytesMut::new();
        enc.write_systematic(0, &mut out);
        dec.read_payload(out.clone().freeze());
        let rank_after_first = dec.rank();
        dec.read_payload(out.freeze());
        assert_eq!(dec.rank(), rank_after_first, "duplicate must not change rank");
    }

    #[test]
    fn encoder_rank_tracks_loads() {
        let factory = CodecFactory::new(3, 4);
        let mut enc = factory.new_encoder(1);
        assert_eq!(enc.rank(), 0);
        enc.load(0, &sym(1, 4));
        assert_eq!(enc.rank(), 1);
        enc.load(0, &sym(2, 4)); // reload same index, rank unchanged
        assert_eq!(enc.rank(), 1);
        enc.load(1, &sym(3, 4));
        enc.load(2, &sym(4, 4));
        assert!(enc.is_full());
    }

    proptest::proptest! {
        /// Enough repair payloads recover the generation, within a bounded
        /// surplus over `k`. Each repair's coefficients are drawn
        /// independently and uniformly from GF(256)\{0}, so `k` draws alone
        /// form a random k×k matrix that is singular with non-negligible
        /// probability — the guarantee is recovery from `k` *linearly
        /// independent* rows, not from exactly `k` draws.
        #[test]
        fn enough_independent_coded_symbols_recover_the_generation(
            k in 2usize..8,
            s in 1usize..32,
            seed: u64,
        ) {
            let factory = CodecFactory::new(k, s);
            let mut enc = factory.new_encoder(seed);
            let mut dec = factory.new_decoder();
            let originals: Vec<Vec<u8>> = (0..k).map(|i| vec![(i * 7 + 3) as u8; s]).collect();
            for (i, data) in originals.iter().enumerate() {
                enc.load(i, data);
            }
            for _ in 0..(k + 8) {
                if dec.is_complete() {
                    break;
                }
                let mut out = BytesMut::new();
                enc.write_repair(&mut out);
                dec.read_payload(out.freeze());
            }
            proptest::prop_assert!(dec.is_complete());
            for (i, data) in originals.iter().enumerate() {
                proptest::prop_assert_eq!(dec.symbol(i), &data[..]);
            }
        }
    }
}
