//! Counter-based random streams.
//!
//! Each instance owns a six-word seed row: words 0..4 are the base counter and
//! words 4..6 the Philox key. Every drawn value consumes one 128-bit block, so
//! the `k`-th value of an instance is a pure function of its row and `k`.

use anyhow::{bail, Result};
use ndarray::Array2;

/// Words per instance in a seed table.
pub const SEED_WORDS: usize = 6;

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;

/// Builds the `n x 6` seed table in one pass over a generator seeded once.
///
/// Without a seed the generator is seeded from system entropy.
pub fn seed_table(instances: usize, seed: Option<u64>) -> Array2<u32> {
    let mut rng = match seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    Array2::from_shape_fn((instances, SEED_WORDS), |_| rng.u32(..))
}

#[inline]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = u64::from(a) * u64::from(b);
    ((product >> 32) as u32, product as u32)
}

#[inline]
fn philox_round(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let (hi0, lo0) = mulhilo(PHILOX_M0, ctr[0]);
    let (hi1, lo1) = mulhilo(PHILOX_M1, ctr[2]);
    [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0]
}

/// Philox4x32 with ten rounds.
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for round in 0..PHILOX_ROUNDS {
        if round > 0 {
            key[0] = key[0].wrapping_add(PHILOX_W0);
            key[1] = key[1].wrapping_add(PHILOX_W1);
        }
        ctr = philox_round(ctr, key);
    }
    ctr
}

fn add_block(counter: [u32; 4], block: u64) -> [u32; 4] {
    let mut out = counter;
    let (low, carry) = out[0].overflowing_add(block as u32);
    out[0] = low;
    let mut carry = u64::from(carry) + (block >> 32);
    for word in out.iter_mut().skip(1) {
        let sum = u64::from(*word) + carry;
        *word = sum as u32;
        carry = sum >> 32;
    }
    out
}

/// Uniform in `[0, 1)` from the top 53 bits of two words.
fn unit_f64(hi: u32, lo: u32) -> f64 {
    let bits = (u64::from(hi) << 21) | (u64::from(lo) >> 11);
    bits as f64 * (1.0 / (1u64 << 53) as f64)
}

/// Uniform in `[0, 1)` from the top 24 bits of one word.
fn unit_f32(word: u32) -> f32 {
    (word >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

/// Restartable random stream of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomStream {
    counter: [u32; 4],
    key: [u32; 2],
    block: u64,
}

impl RandomStream {
    pub fn from_seed_row(row: &[u32]) -> Result<Self> {
        if row.len() != SEED_WORDS {
            bail!("seed row holds {} words, expected {SEED_WORDS}", row.len());
        }
        Ok(Self {
            counter: [row[0], row[1], row[2], row[3]],
            key: [row[4], row[5]],
            block: 0,
        })
    }

    /// Number of blocks drawn so far.
    pub fn position(&self) -> u64 {
        self.block
    }

    /// Rewinds or advances the stream to block `block`.
    pub fn seek(&mut self, block: u64) {
        self.block = block;
    }

    pub fn next_block(&mut self) -> [u32; 4] {
        let ctr = add_block(self.counter, self.block);
        self.block += 1;
        philox4x32_10(ctr, self.key)
    }

    pub fn uniform(&mut self) -> f64 {
        let words = self.next_block();
        unit_f64(words[0], words[1])
    }

    pub fn uniform_f32(&mut self) -> f32 {
        unit_f32(self.next_block()[0])
    }

    /// Standard normal draw by Box-Muller over one block.
    pub fn normal(&mut self) -> f64 {
        let words = self.next_block();
        let u1 = 1.0 - unit_f64(words[0], words[1]);
        let u2 = unit_f64(words[2], words[3]);
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    pub fn normal_f32(&mut self) -> f32 {
        let words = self.next_block();
        let u1 = 1.0 - unit_f32(words[0]);
        let u2 = unit_f32(words[1]);
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }
}
