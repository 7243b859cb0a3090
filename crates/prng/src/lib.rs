//! Counter-based, splittable PRNG keys built on Threefry-2x32.
//!
//! Keys are plain values: deriving a child key never mutates the parent, so
//! the same key always yields the same stream. Training loops derive one key
//! per step with [`PrngKey::for_step`] and must not reuse a step index.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rand::{CryptoRng, RngCore};

/// Key-schedule parity constant of Threefry.
const KEY_PARITY: u32 = 0x1BD1_1BDA;

/// Domain word separating `split` children from `fold_in` children.
const SPLIT_DOMAIN: u32 = 0x9E37_79B9;

/// Rotation constants, alternating per block of four rounds.
const ROTATIONS: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];

/// Number of four-round blocks (twenty rounds total).
const BLOCKS: usize = 5;

/// A splittable PRNG key made of two 32-bit words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrngKey {
    k0: u32,
    k1: u32,
}

impl PrngKey {
    /// Create a key from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let (hi, lo) = split_u64(seed);
        Self { k0: hi, k1: lo }
    }

    /// Create a key directly from raw words.
    pub fn from_words(k0: u32, k1: u32) -> Self {
        Self { k0, k1 }
    }

    /// Raw key words.
    pub fn words(&self) -> (u32, u32) {
        (self.k0, self.k1)
    }

    /// Derive `n` independent child keys.
    pub fn split(self, n: usize) -> Vec<Self> {
        let (d0, d1) = threefry2x32(self, SPLIT_DOMAIN, SPLIT_DOMAIN);
        let domain = Self::from_words(d0, d1);
        (0..n as u64)
            .map(|i| {
                let (hi, lo) = split_u64(i);
                let (k0, k1) = threefry2x32(domain, lo, hi);
                Self { k0, k1 }
            })
            .collect()
    }

    /// Derive two independent child keys.
    pub fn split2(self) -> (Self, Self) {
        let keys = self.split(2);
        (keys[0], keys[1])
    }

    /// Deterministically derive a child key from an integer.
    pub fn fold_in(self, data: u64) -> Self {
        let (hi, lo) = split_u64(data);
        let (k0, k1) = threefry2x32(self, lo, hi);
        Self { k0, k1 }
    }

    /// Key for training step `step`, derived from this base key.
    pub fn for_step(self, step: u64) -> Self {
        self.fold_in(step)
    }

    /// Expand the key into a random stream.
    pub fn to_rng(self) -> KeyRng {
        KeyRng::new(self)
    }
}

/// Random stream produced by hashing an increasing counter under a key.
#[derive(Clone, Debug)]
pub struct KeyRng {
    key: PrngKey,
    counter: u64,
    buffer: [u32; 2],
    index: usize,
}

impl KeyRng {
    /// Create a stream positioned at counter zero.
    pub fn new(key: PrngKey) -> Self {
        Self {
            key,
            counter: 0,
            buffer: [0; 2],
            index: 2,
        }
    }

    fn refill(&mut self) {
        let (hi, lo) = split_u64(self.counter);
        let (y0, y1) = threefry2x32(self.key, lo, hi);
        self.buffer = [y0, y1];
        self.index = 0;
        self.counter = self.counter.wrapping_add(1);
    }
}

impl RngCore for KeyRng {
    fn next_u32(&mut self) -> u32 {
        if self.index >= 2 {
            self.refill();
        }
        let out = self.buffer[self.index];
        self.index += 1;
        out
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for KeyRng {}

fn split_u64(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// Threefry-2x32 with twenty rounds.
fn threefry2x32(key: PrngKey, x0: u32, x1: u32) -> (u32, u32) {
    let ks = [key.k0, key.k1, key.k0 ^ key.k1 ^ KEY_PARITY];
    let mut x0 = x0.wrapping_add(ks[0]);
    let mut x1 = x1.wrapping_add(ks[1]);

    for block in 0..BLOCKS {
        for &rot in &ROTATIONS[block % 2] {
            x0 = x0.wrapping_add(x1);
            x1 = x1.rotate_left(rot) ^ x0;
        }
        let inject = block + 1;
        x0 = x0.wrapping_add(ks[inject % 3]);
        x1 = x1
            .wrapping_add(ks[(inject + 1) % 3])
            .wrapping_add(inject as u32);
    }
    (x0, x1)
}

/// Common imports for key handling.
pub mod prelude {
    pub use crate::{KeyRng, PrngKey};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn split_is_deterministic() {
        let k = PrngKey::new(0);
        assert_eq!(k.split(4), k.split(4));
    }

    #[test]
    fn split_children_are_distinct() {
        let keys = PrngKey::new(9).split(64);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn split_and_fold_in_do_not_collide() {
        let k = PrngKey::new(5);
        let folded: HashSet<_> = (0..32).map(|i| k.fold_in(i)).collect();
        for child in k.split(32) {
            assert!(!folded.contains(&child));
        }
    }

    #[test]
    fn fold_in_changes_key() {
        let k = PrngKey::new(123);
        assert_ne!(k.fold_in(1), k.fold_in(2));
        assert_ne!(k.fold_in(1), k);
    }

    #[test]
    fn for_step_matches_fold_in() {
        let k = PrngKey::new(77);
        assert_eq!(k.for_step(10), k.fold_in(10));
    }

    #[test]
    fn split2_yields_different_keys() {
        let (a, b) = PrngKey::new(1).split2();
        assert_ne!(a, b);
    }

    #[test]
    fn rng_is_deterministic() {
        let mut r1 = PrngKey::new(7).to_rng();
        let mut r2 = PrngKey::new(7).to_rng();
        for _ in 0..10 {
            assert_eq!(r1.next_u32(), r2.next_u32());
        }
    }

    #[test]
    fn rng_bits_are_balanced() {
        let mut rng = PrngKey::new(2024).to_rng();
        let ones: u32 = (0..4096).map(|_| rng.next_u32().count_ones()).sum();
        let frac = ones as f64 / (4096.0 * 32.0);
        assert!((frac - 0.5).abs() < 0.01, "bit fraction {frac}");
    }

    #[test]
    fn fill_bytes_handles_ragged_tail() {
        let mut buf = [0u8; 13];
        PrngKey::new(3).to_rng().fill_bytes(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
