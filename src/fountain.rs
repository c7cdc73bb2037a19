//! # Fountain Coding
//!
//! Erasure-coded block transport over GF(256). A block is cut into
//! fixed-size chunks; the sender emits [`Combination`]s, linear
//! combinations of chunks with random nonzero coefficients, and the
//! receiver's [`Sink`] performs online Gaussian elimination until the block
//! is byte-exact.
//!
//! This module is pure: no I/O, no clocks. The store drives it from the
//! `Call`/`Data` message path.
//!
//! ## Chunk framing
//!
//! Every chunk payload is prefixed with its true length as a big-endian
//! `u16`, so padding introduced by the linear algebra is reversible. The
//! sender always produces a final chunk shorter than [`CHUNK_SIZE`]
//! (possibly empty), which is how the receiver recognises the end of the
//! block without knowing its size in advance.
//!
//! ## Decoder state
//!
//! - `next_decoded` is the smallest chunk offset not yet written out.
//! - `next_seen >= next_decoded` is the smallest offset not yet observed in
//!   any combination.
//! - Rows are kept in reduced form keyed by pivot offset; a row reduced to
//!   a single component is written out and eliminated everywhere.
//!
//! Receiving a combination twice is a no-op after elimination, and the
//! decoded output does not depend on arrival order.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Size of a source chunk in bytes.
pub const CHUNK_SIZE: usize = 1024;

/// Stored payload size: chunk plus its 2-byte length prefix.
const PADDED_SIZE: usize = CHUNK_SIZE + 2;

/// Maximum number of chunks a coded combination spans, bounding the size of
/// its serialized coefficient vector.
pub const MAX_COMBINATION_SPAN: u64 = 256;

// ============================================================================
// GF(256) arithmetic
// ============================================================================
//
// The field is GF(2^8) modulo x^8 + x^4 + x^3 + x + 1 (0x11b). Inversion is
// table-driven: log/exp tables over the generator 0x03 are built once at
// startup.

struct GfTables {
    log: [u8; 256],
    exp: [u8; 512],
}

static GF: std::sync::LazyLock<GfTables> = std::sync::LazyLock::new(|| {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 512];
    let mut x: u8 = 1;
    for i in 0..255 {
        exp[i] = x;
        log[x as usize] = i as u8;
        x = gf_mul_slow(x, 3);
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    GfTables { log, exp }
});

/// Carry-less multiply used only to build the tables.
fn gf_mul_slow(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    for _ in 0..8 {
        if b & 1 != 0 {
            p ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    p
}

/// Addition in GF(256) is XOR.
#[inline]
pub fn gf_add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// Table-driven multiplication.
#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*GF;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Multiplicative inverse of a nonzero element.
#[inline]
pub fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0, "zero has no inverse in GF(256)");
    let t = &*GF;
    t.exp[255 - t.log[a as usize] as usize]
}

// ============================================================================
// Combination
// ============================================================================

/// A sparse GF(256) linear combination of source chunks.
///
/// `components` maps chunk offsets to nonzero coefficients; `data` is the
/// corresponding combination of the length-prefixed chunk payloads, with
/// trailing zeroes trimmed on the wire by construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    components: BTreeMap<u64, u8>,
    data: Vec<u8>,
}

impl Combination {
    /// The trivial combination holding exactly the chunk at `offset`.
    ///
    /// `chunk` is the raw chunk bytes (at most [`CHUNK_SIZE`]); the length
    /// prefix is added here.
    pub fn from_chunk(offset: u64, chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= CHUNK_SIZE);
        let mut data = Vec::with_capacity(2 + chunk.len());
        data.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        data.extend_from_slice(chunk);
        let mut components = BTreeMap::new();
        components.insert(offset, 1u8);
        Self { components, data }
    }

    pub fn components(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.components.iter().map(|(&k, &v)| (k, v))
    }

    pub fn first_component(&self) -> Option<u64> {
        self.components.keys().next().copied()
    }

    pub fn last_component(&self) -> Option<u64> {
        self.components.keys().next_back().copied()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Coefficient of the chunk at `offset`, zero if absent.
    pub fn coeff(&self, offset: u64) -> u8 {
        self.components.get(&offset).copied().unwrap_or(0)
    }

    pub fn is_null(&self) -> bool {
        self.components.is_empty()
    }

    /// A combination is decoded when it is exactly one chunk with unit
    /// coefficient.
    pub fn is_decoded(&self) -> bool {
        self.components.len() == 1 && self.components.values().all(|&c| c == 1)
    }

    /// The decoded chunk bytes (length prefix stripped), if decoded.
    pub fn decoded_data(&self) -> Option<&[u8]> {
        if !self.is_decoded() || self.data.len() < 2 {
            return None;
        }
        let size = u16::from_be_bytes([self.data[0], self.data[1]]) as usize;
        let available = self.data.len() - 2;
        Some(&self.data[2..2 + size.min(available)])
    }

    /// Length in bytes of the decoded chunk, if decoded.
    pub fn decoded_len(&self) -> Option<usize> {
        self.decoded_data().map(|d| d.len())
    }

    /// Structural sanity for combinations received from the network.
    pub fn validate(&self) -> bool {
        self.data.len() <= PADDED_SIZE
            && self.components.len() as u64 <= MAX_COMBINATION_SPAN
            && self.components.values().all(|&c| c != 0)
    }

    fn add_scaled(&mut self, other: &Combination, coeff: u8) {
        if coeff == 0 {
            return;
        }
        if self.data.len() < other.data.len() {
            self.data.resize(other.data.len(), 0);
        }
        for (i, &byte) in other.data.iter().enumerate() {
            self.data[i] = gf_add(self.data[i], gf_mul(byte, coeff));
        }
        for (&offset, &c) in &other.components {
            let entry = self.components.entry(offset).or_insert(0);
            *entry = gf_add(*entry, gf_mul(c, coeff));
            if *entry == 0 {
                self.components.remove(&offset);
            }
        }
    }

    fn scale(&mut self, coeff: u8) {
        debug_assert_ne!(coeff, 0);
        for byte in &mut self.data {
            *byte = gf_mul(*byte, coeff);
        }
        for c in self.components.values_mut() {
            *c = gf_mul(*c, coeff);
        }
    }
}

impl std::ops::AddAssign<&Combination> for Combination {
    /// Sum in GF(256); addition and subtraction coincide.
    fn add_assign(&mut self, other: &Combination) {
        self.add_scaled(other, 1);
    }
}

impl std::ops::MulAssign<u8> for Combination {
    fn mul_assign(&mut self, coeff: u8) {
        self.scale(coeff);
    }
}

impl std::ops::DivAssign<u8> for Combination {
    fn div_assign(&mut self, coeff: u8) {
        self.scale(gf_inv(coeff));
    }
}

// ============================================================================
// Generator (sender)
// ============================================================================

/// Produces combinations over a block.
///
/// The first pass is systematic (each chunk once, in order); every further
/// combination is a random dense combination over a bounded window, so any
/// single combination stays within the wire content limit regardless of
/// block size.
#[derive(Debug)]
pub struct Generator {
    data: Vec<u8>,
    chunk_count: u64,
    next_systematic: u64,
}

impl Generator {
    pub fn new(data: Vec<u8>) -> Self {
        // The final chunk is always strictly shorter than CHUNK_SIZE so the
        // receiver can recognise the end of the block; an exact multiple
        // gets an empty trailing chunk.
        let chunk_count = (data.len() / CHUNK_SIZE) as u64 + 1;
        Self {
            data,
            chunk_count,
            next_systematic: 0,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    fn chunk(&self, offset: u64) -> &[u8] {
        let start = (offset as usize) * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.data.len());
        &self.data[start.min(self.data.len())..end]
    }

    /// Produce the next combination.
    pub fn generate<R: Rng>(&mut self, rng: &mut R) -> Combination {
        if self.next_systematic < self.chunk_count {
            let offset = self.next_systematic;
            self.next_systematic += 1;
            return Combination::from_chunk(offset, self.chunk(offset));
        }

        // Coded pass: random window of chunks, random nonzero coefficients.
        let span = self.chunk_count.min(MAX_COMBINATION_SPAN);
        let first = if self.chunk_count > span {
            rng.gen_range(0..=self.chunk_count - span)
        } else {
            0
        };

        let mut combination = Combination::default();
        for offset in first..first + span {
            let coeff = rng.gen_range(1..=u8::MAX);
            let chunk = Combination::from_chunk(offset, self.chunk(offset));
            combination.add_scaled(&chunk, coeff);
        }
        combination
    }
}

// ============================================================================
// Sink (receiver)
// ============================================================================

/// Online Gauss-Jordan decoder.
///
/// Rows are kept keyed by their pivot (smallest) offset with the pivot
/// coefficient normalised to one. Chunks are written out strictly in order.
#[derive(Debug, Default)]
pub struct Sink {
    /// Reduced rows by pivot offset.
    rows: BTreeMap<u64, Combination>,
    /// Chunks decoded so far, in offset order.
    decoded: Vec<Vec<u8>>,
    /// Smallest offset not yet observed in any combination.
    next_seen: u64,
    /// Set once a chunk shorter than `CHUNK_SIZE` has been decoded.
    complete: bool,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest chunk offset not yet written out.
    pub fn next_decoded(&self) -> u64 {
        self.decoded.len() as u64
    }

    pub fn next_seen(&self) -> u64 {
        self.next_seen.max(self.next_decoded())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Add a combination and run elimination. Returns true when the block
    /// became complete with this call.
    pub fn solve(&mut self, mut c: Combination) -> bool {
        if self.complete || !c.validate() {
            return false;
        }

        if let Some(last) = c.last_component() {
            self.next_seen = self.next_seen.max(last + 1);
        }

        // Subtract every chunk already decoded.
        while let Some(first) = c.first_component() {
            if first >= self.next_decoded() {
                break;
            }
            let coeff = c.coeff(first);
            let known = Combination::from_chunk(first, &self.decoded[first as usize]);
            c.add_scaled(&known, coeff); // adding == subtracting
        }

        // Reduce against existing rows until a fresh pivot appears.
        loop {
            let Some(first) = c.first_component() else {
                // Linearly dependent on what we already have.
                return false;
            };
            match self.rows.get(&first) {
                Some(row) => {
                    let coeff = c.coeff(first);
                    let row = row.clone();
                    c.add_scaled(&row, coeff);
                }
                None => {
                    let pivot_coeff = c.coeff(first);
                    if pivot_coeff != 1 {
                        c /= pivot_coeff;
                    }
                    // Back-substitute existing pivots out of the new row so
                    // no row ever contains another row's pivot. Offending
                    // components only move forward, so this terminates.
                    loop {
                        let offending = c
                            .components()
                            .map(|(offset, _)| offset)
                            .find(|&offset| offset != first && self.rows.contains_key(&offset));
                        let Some(offset) = offending else { break };
                        let row = self.rows[&offset].clone();
                        let coeff = c.coeff(offset);
                        c.add_scaled(&row, coeff);
                    }
                    // Eliminate the new pivot from every other row.
                    for row in self.rows.values_mut() {
                        let coeff = row.coeff(first);
                        if coeff != 0 {
                            row.add_scaled(&c, coeff);
                        }
                    }
                    self.rows.insert(first, c);
                    break;
                }
            }
        }

        self.drain();
        self.complete
    }

    /// Write out every row that became a single decoded chunk at the
    /// decoding frontier.
    fn drain(&mut self) {
        loop {
            let offset = self.next_decoded();
            let Some(row) = self.rows.get(&offset) else { break };
            if !row.is_decoded() {
                break;
            }
            let row = self.rows.remove(&offset).expect("row checked present");
            let chunk = row.decoded_data().expect("decoded row has data").to_vec();
            let chunk_len = chunk.len();
            // Remove the now-known chunk from remaining rows.
            let known = Combination::from_chunk(offset, &chunk);
            for other in self.rows.values_mut() {
                let coeff = other.coeff(offset);
                if coeff != 0 {
                    other.add_scaled(&known, coeff);
                }
            }
            self.rows.retain(|_, r| !r.is_null());
            self.decoded.push(chunk);

            if chunk_len < CHUNK_SIZE {
                self.complete = true;
                break;
            }
        }
    }

    /// The decoded block, valid once [`is_complete`](Self::is_complete).
    pub fn into_data(self) -> Vec<u8> {
        self.decoded.concat()
    }

    pub fn data(&self) -> Vec<u8> {
        self.decoded.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn gf_inverse_over_full_field() {
        for a in 1..=255u8 {
            let inv = gf_inv(a);
            assert_eq!(gf_mul(a, inv), 1, "a * a^-1 must be 1 for a={}", a);
        }
    }

    #[test]
    fn gf_mul_matches_reference() {
        for a in 0..=255u8 {
            for b in [0u8, 1, 2, 3, 0x53, 0xCA, 0xFF] {
                assert_eq!(gf_mul(a, b), gf_mul_slow(a, b));
                assert_eq!(gf_mul(a, b), gf_mul(b, a));
            }
        }
    }

    #[test]
    fn combination_algebra_is_closed() {
        let a = Combination::from_chunk(0, b"first chunk");
        let b = Combination::from_chunk(1, b"second chunk");

        let mut sum = a.clone();
        sum += &b;
        assert_eq!(sum.component_count(), 2);

        let mut scaled = sum.clone();
        scaled *= 7;
        assert_eq!(scaled.coeff(0), gf_mul(1, 7));

        // Scaling back down restores the sum.
        let mut restored = scaled.clone();
        restored /= 7;
        assert_eq!(restored, sum);

        // Adding a combination to itself cancels out (characteristic 2).
        let mut cancelled = sum.clone();
        cancelled += &sum;
        assert!(cancelled.is_null());
    }

    #[test]
    fn decoded_data_strips_length_prefix() {
        let c = Combination::from_chunk(3, b"short");
        assert!(c.is_decoded());
        assert_eq!(c.decoded_data(), Some(b"short".as_slice()));
        assert_eq!(c.decoded_len(), Some(5));
    }

    #[test]
    fn coded_combination_is_not_decoded() {
        let mut c = Combination::from_chunk(0, b"a");
        c += &Combination::from_chunk(1, b"b");
        assert!(!c.is_decoded());
        assert_eq!(c.decoded_data(), None);
    }

    #[test]
    fn systematic_pass_decodes_in_order() {
        let data = block(3 * CHUNK_SIZE + 100);
        let mut generator = Generator::new(data.clone());
        let mut sink = Sink::new();
        let mut rng = StdRng::seed_from_u64(1);

        let mut done = false;
        for _ in 0..generator.chunk_count() {
            done = sink.solve(generator.generate(&mut rng));
        }
        assert!(done, "systematic pass must complete the block");
        assert_eq!(sink.into_data(), data);
    }

    #[test]
    fn coded_combinations_recover_losses() {
        let data = block(5 * CHUNK_SIZE + 17);
        let mut generator = Generator::new(data.clone());
        let mut sink = Sink::new();
        let mut rng = StdRng::seed_from_u64(2);

        // Drop every second systematic combination.
        let systematic: Vec<_> = (0..generator.chunk_count())
            .map(|_| generator.generate(&mut rng))
            .collect();
        for (i, c) in systematic.into_iter().enumerate() {
            if i % 2 == 0 {
                sink.solve(c);
            }
        }
        assert!(!sink.is_complete());

        // Coded combinations fill the gaps.
        let mut rounds = 0;
        while !sink.is_complete() {
            sink.solve(generator.generate(&mut rng));
            rounds += 1;
            assert!(rounds < 100, "decoder must converge");
        }
        assert_eq!(sink.into_data(), data);
    }

    #[test]
    fn duplicate_combinations_are_idempotent() {
        let data = block(2 * CHUNK_SIZE + 5);
        let mut generator = Generator::new(data.clone());
        let mut rng = StdRng::seed_from_u64(3);
        let combinations: Vec<_> = (0..generator.chunk_count())
            .map(|_| generator.generate(&mut rng))
            .collect();

        let mut sink = Sink::new();
        for c in &combinations {
            sink.solve(c.clone());
            sink.solve(c.clone()); // duplicate
        }
        assert!(sink.is_complete());
        assert_eq!(sink.into_data(), data);
    }

    #[test]
    fn decoding_is_order_independent() {
        let data = block(4 * CHUNK_SIZE);
        let mut generator = Generator::new(data.clone());
        let mut rng = StdRng::seed_from_u64(4);
        let mut combinations: Vec<_> = (0..generator.chunk_count() + 3)
            .map(|_| generator.generate(&mut rng))
            .collect();
        combinations.reverse();

        let mut sink = Sink::new();
        for c in combinations {
            sink.solve(c);
        }
        assert!(sink.is_complete());
        assert_eq!(sink.into_data(), data);
    }

    #[test]
    fn exact_multiple_block_has_empty_final_chunk() {
        let data = block(2 * CHUNK_SIZE);
        let mut generator = Generator::new(data.clone());
        assert_eq!(generator.chunk_count(), 3);

        let mut sink = Sink::new();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..generator.chunk_count() {
            sink.solve(generator.generate(&mut rng));
        }
        assert!(sink.is_complete());
        assert_eq!(sink.into_data(), data);
    }

    #[test]
    fn empty_block_roundtrip() {
        let mut generator = Generator::new(Vec::new());
        assert_eq!(generator.chunk_count(), 1);

        let mut sink = Sink::new();
        let mut rng = StdRng::seed_from_u64(6);
        assert!(sink.solve(generator.generate(&mut rng)));
        assert!(sink.into_data().is_empty());
    }

    #[test]
    fn frontier_counters_advance() {
        let data = block(3 * CHUNK_SIZE + 1);
        let mut generator = Generator::new(data);
        let mut sink = Sink::new();
        let mut rng = StdRng::seed_from_u64(7);

        let first = generator.generate(&mut rng);
        let second = generator.generate(&mut rng);

        // Deliver out of order: chunk 1 is seen but not decodable yet.
        sink.solve(second);
        assert_eq!(sink.next_decoded(), 0);
        assert_eq!(sink.next_seen(), 2);

        sink.solve(first);
        assert_eq!(sink.next_decoded(), 2);
    }

    #[test]
    fn combination_serialization_roundtrip() {
        let mut c = Combination::from_chunk(0, &block(CHUNK_SIZE));
        c += &Combination::from_chunk(1, b"tail");
        let bytes = crate::messages::serialize_payload(&c).unwrap();
        let back: Combination = crate::messages::deserialize_payload(&bytes).unwrap();
        assert_eq!(c, back);
        assert!(back.validate());
    }

    #[test]
    fn oversized_component_vector_rejected() {
        let mut c = Combination::default();
        for offset in 0..MAX_COMBINATION_SPAN + 1 {
            c.add_scaled(&Combination::from_chunk(offset, b"x"), 1);
        }
        assert!(!c.validate());
        let mut sink = Sink::new();
        assert!(!sink.solve(c));
        assert_eq!(sink.next_decoded(), 0);
    }
}
