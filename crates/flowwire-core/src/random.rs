// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Seed-resumable xoshiro256** generator.
//!
//! The generator position is four `u64` words. [`DeterministicRng::export_state`]
//! and [`DeterministicRng::import_state`] move that position in and out of the
//! persisted flow state, so a retried tick draws exactly the numbers the first
//! attempt drew.

use serde::{Deserialize, Serialize};

/// Seed used when an all-zero state is imported.
const FALLBACK_SEED: u64 = 2300;

const SPLITMIX_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;
const SPLITMIX_MUL_1: u64 = 0xbf58_476d_1ce4_e5b9;
const SPLITMIX_MUL_2: u64 = 0x94d0_49bb_1331_11eb;

/// Exported generator position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RngState {
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
}

impl RngState {
    fn is_zero(&self) -> bool {
        (self.s0 | self.s1 | self.s2 | self.s3) == 0
    }
}

#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(SPLITMIX_GAMMA);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(SPLITMIX_MUL_1);
    z = (z ^ (z >> 27)).wrapping_mul(SPLITMIX_MUL_2);
    z ^ (z >> 31)
}

/// xoshiro256** with SplitMix64 seeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicRng {
    s: [u64; 4],
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        let mut rng = Self { s: [0; 4] };
        rng.reset(seed);
        rng
    }

    /// Build a generator positioned exactly at `state`.
    pub fn from_state(state: RngState) -> Self {
        let mut rng = Self { s: [0; 4] };
        rng.import_state(state);
        rng
    }

    /// Re-derive all four words from `seed`.
    pub fn reset(&mut self, seed: u64) {
        let mut sm = seed;
        for word in &mut self.s {
            *word = splitmix64(&mut sm);
        }
    }

    pub fn export_state(&self) -> RngState {
        RngState {
            s0: self.s[0],
            s1: self.s[1],
            s2: self.s[2],
            s3: self.s[3],
        }
    }

    /// Restore a position. An all-zero state would lock the generator at zero,
    /// so it is replaced by the fallback seed.
    pub fn import_state(&mut self, state: RngState) {
        if state.is_zero() {
            self.reset(FALLBACK_SEED);
            return;
        }
        self.s = [state.s0, state.s1, state.s2, state.s3];
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = &mut self.s;
        let result = s1.wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = *s1 << 17;

        *s2 ^= *s0;
        *s3 ^= *s1;
        *s1 ^= *s2;
        *s0 ^= *s3;
        *s2 ^= t;
        *s3 = s3.rotate_left(45);

        result
    }

    /// Uniform integer in `[min, max)`. Returns `min` when the range is empty.
    ///
    /// Uses Lemire's multiply-and-reject method, so non power-of-two ranges
    /// carry no modulo bias.
    pub fn next_int(&mut self, min: i64, max: i64) -> i64 {
        if max <= min {
            return min;
        }
        let range = max.wrapping_sub(min) as u64;
        min.wrapping_add(self.next_below(range) as i64)
    }

    /// Uniform integer in `[0, bound)`. `bound` must be non-zero.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        let mut m = u128::from(self.next_u64()) * u128::from(bound);
        let mut low = m as u64;
        if low < bound {
            let threshold = bound.wrapping_neg() % bound;
            while low < threshold {
                m = u128::from(self.next_u64()) * u128::from(bound);
                low = m as u64;
            }
        }
        (m >> 64) as u64
    }

    /// Uniform in `[0, 1)` with 53 bits of precision.
    pub fn next_double(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Uniform in `[0, 1)` with 24 bits of precision.
    pub fn next_float(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    /// Fill `dest` with little-endian words, one step per eight bytes.
    pub fn next_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(8);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        let tail = chunks.into_remainder();
        if !tail.is_empty() {
            let bytes = self.next_u64().to_le_bytes();
            tail.copy_from_slice(&bytes[..tail.len()]);
        }
    }
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Lets flow code hand the generator to anything built on `rand`.
impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        (DeterministicRng::next_u64(self) >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        DeterministicRng::next_u64(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.next_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.next_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;

    fn raw(s: [u64; 4]) -> DeterministicRng {
        DeterministicRng::from_state(RngState {
            s0: s[0],
            s1: s[1],
            s2: s[2],
            s3: s[3],
        })
    }

    #[test]
    fn test_reference_sequence() {
        let mut rng = raw([1, 2, 3, 4]);
        let expected = [
            11520u64,
            0,
            1509978240,
            1215971899390074240,
            1216172134540287360,
            607988272756665600,
        ];
        for value in expected {
            assert_eq!(rng.next_u64(), value);
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = DeterministicRng::new(42);
        let mut b = DeterministicRng::new(42);

        for _ in 0..64 {
            assert_eq!(a.next_u64(), b.next_u64());
            assert_eq!(a.next_int(-10, 10), b.next_int(-10, 10));
            assert_eq!(a.next_double().to_bits(), b.next_double().to_bits());
        }

        let mut c = DeterministicRng::new(43);
        assert_ne!(DeterministicRng::new(42).next_u64(), c.next_u64());
    }

    #[test]
    fn test_export_import_resumes_exactly() {
        let mut original = DeterministicRng::new(7);
        for _ in 0..10 {
            original.next_u64();
        }

        let mut resumed = DeterministicRng::from_state(original.export_state());
        let mut buf_a = [0u8; 13];
        let mut buf_b = [0u8; 13];
        for _ in 0..32 {
            assert_eq!(original.next_u64(), resumed.next_u64());
            original.next_bytes(&mut buf_a);
            resumed.next_bytes(&mut buf_b);
            assert_eq!(buf_a, buf_b);
        }
    }

    #[test]
    fn test_zero_state_falls_back() {
        let mut rng = DeterministicRng::from_state(RngState::default());
        assert_eq!(rng, DeterministicRng::new(FALLBACK_SEED));
        assert_ne!(rng.export_state(), RngState::default());
        assert!((0..8).any(|_| rng.next_u64() != 0));
    }

    #[test]
    fn test_reset_is_repeatable() {
        let mut rng = DeterministicRng::new(99);
        let first: Vec<u64> = (0..5).map(|_| rng.next_u64()).collect();
        rng.reset(99);
        let second: Vec<u64> = (0..5).map(|_| rng.next_u64()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_next_int_bounds() {
        let mut rng = DeterministicRng::new(1);
        for _ in 0..10_000 {
            let v = rng.next_int(-3, 4);
            assert!((-3..4).contains(&v));
        }
        assert_eq!(rng.next_int(5, 5), 5);
        assert_eq!(rng.next_int(5, 2), 5);

        let wide = rng.next_int(i64::MIN, i64::MAX);
        assert!(wide < i64::MAX);
    }

    #[test]
    fn test_next_int_covers_small_range() {
        let mut rng = DeterministicRng::new(2);
        let mut seen = [0u32; 3];
        for _ in 0..3_000 {
            seen[rng.next_int(0, 3) as usize] += 1;
        }
        assert!(seen.iter().all(|&n| n > 800), "skewed: {:?}", seen);
    }

    #[test]
    fn test_unit_interval_values() {
        let mut rng = DeterministicRng::new(3);
        for _ in 0..1_000 {
            let d = rng.next_double();
            assert!((0.0..1.0).contains(&d));
            let f = rng.next_float();
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn test_next_bytes_is_little_endian_words() {
        let mut a = DeterministicRng::new(5);
        let mut b = DeterministicRng::new(5);

        let mut buf = [0u8; 10];
        a.next_bytes(&mut buf);

        let w0 = b.next_u64().to_le_bytes();
        let w1 = b.next_u64().to_le_bytes();
        assert_eq!(&buf[..8], &w0);
        assert_eq!(&buf[8..], &w1[..2]);
    }

    #[test]
    fn test_works_with_rand_adapters() {
        let mut a = DeterministicRng::new(11);
        let mut b = DeterministicRng::new(11);

        let mut xs: Vec<u32> = (0..20).collect();
        let mut ys = xs.clone();
        xs.shuffle(&mut a);
        ys.shuffle(&mut b);
        assert_eq!(xs, ys);

        let n: u8 = a.gen_range(0..10);
        assert!(n < 10);
    }
}
