//! Fixed-size Bloom filter over byte strings
//!
//! Bits are packed into 32-bit words. Index positions come from double
//! hashing two cheap base hashes (FNV-1a and a DJB2-style hash), so only two
//! passes over the input are needed regardless of the number of rounds.

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Result};

const WORD_BITS: usize = 32;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const DJB2_SEED: u32 = 5381;

/// Probabilistic set: no false negatives, tunable false positives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u32>,
    size: usize,
    hash_count: u32,
    item_count: u64,
}

/// Raw filter state for warm starts and transfer between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomSnapshot {
    pub size: u64,
    pub hash_count: u32,
    pub item_count: u64,
    pub bits: Vec<u32>,
}

impl BloomSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the target false-positive rate
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(DedupError::InvalidConfig(
                "expected item count must be positive".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(DedupError::InvalidConfig(format!(
                "false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let size = Self::optimal_size(expected_items, false_positive_rate);
        let hash_count = Self::optimal_hash_count(size, expected_items);
        Self::with_params(size, hash_count)
    }

    /// Create an empty filter with explicit geometry
    pub fn with_params(size: usize, hash_count: u32) -> Result<Self> {
        if size == 0 || hash_count == 0 {
            return Err(DedupError::InvalidConfig(format!(
                "size and hash count must be positive (size={}, k={})",
                size, hash_count
            )));
        }

        Ok(Self {
            bits: vec![0; size.div_ceil(WORD_BITS)],
            size,
            hash_count,
            item_count: 0,
        })
    }

    /// m = ceil(-n * ln(p) / ln(2)^2)
    pub fn optimal_size(expected_items: usize, false_positive_rate: f64) -> usize {
        let ln2 = std::f64::consts::LN_2;
        (-(expected_items as f64) * false_positive_rate.ln() / (ln2 * ln2)).ceil() as usize
    }

    /// k = round((m / n) * ln(2)), at least 1
    pub fn optimal_hash_count(size: usize, expected_items: usize) -> u32 {
        let k = (size as f64 / expected_items as f64 * std::f64::consts::LN_2).round();
        (k as u32).max(1)
    }

    pub fn add(&mut self, item: impl AsRef<[u8]>) {
        let (h1, h2) = base_hashes(item.as_ref());
        for i in 0..self.hash_count {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
        self.item_count += 1;
    }

    /// False means definitely never added
    pub fn might_contain(&self, item: impl AsRef<[u8]>) -> bool {
        let (h1, h2) = base_hashes(item.as_ref());
        (0..self.hash_count).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
        })
    }

    /// (1 - e^(-k*n/m))^k for the current item count
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_count as f64;
        let exponent = -k * self.item_count as f64 / self.size as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// Fraction of bits set
    pub fn fill_ratio(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|w| w.count_ones()).sum();
        set as f64 / self.size as f64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Approximate; counts repeated adds and is an upper bound after a merge
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    pub fn export(&self) -> BloomSnapshot {
        BloomSnapshot {
            size: self.size as u64,
            hash_count: self.hash_count,
            item_count: self.item_count,
            bits: self.bits.clone(),
        }
    }

    pub fn import(snapshot: BloomSnapshot) -> Result<Self> {
        let size = usize::try_from(snapshot.size)
            .map_err(|_| DedupError::InvalidSnapshot(format!("size {} too large", snapshot.size)))?;

        let mut filter = Self::with_params(size, snapshot.hash_count)
            .map_err(|e| DedupError::InvalidSnapshot(e.to_string()))?;

        if snapshot.bits.len() != filter.bits.len() {
            return Err(DedupError::InvalidSnapshot(format!(
                "expected {} words for {} bits, got {}",
                filter.bits.len(),
                size,
                snapshot.bits.len()
            )));
        }

        filter.bits = snapshot.bits;
        filter.item_count = snapshot.item_count;
        Ok(filter)
    }

    /// Bitwise OR of another filter with identical geometry
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if self.size != other.size || self.hash_count != other.hash_count {
            return Err(DedupError::IncompatibleFilter {
                size: self.size,
                other_size: other.size,
                hash_count: self.hash_count,
                other_hash_count: other.hash_count,
            });
        }

        for (word, other_word) in self.bits.iter_mut().zip(&other.bits) {
            *word |= *other_word;
        }
        self.item_count += other.item_count;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.item_count = 0;
    }

    fn bit_index(&self, h1: u32, h2: u32, round: u32) -> usize {
        let combined = h1 as u64 + round as u64 * h2 as u64;
        (combined % self.size as u64) as usize
    }
}

fn base_hashes(data: &[u8]) -> (u32, u32) {
    let fnv = data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ *byte as u32).wrapping_mul(FNV_PRIME)
    });
    let djb = data.iter().fold(DJB2_SEED, |hash, byte| {
        hash.wrapping_mul(33) ^ *byte as u32
    });
    // An even step could cycle through a fraction of the positions
    (fnv, djb | 1)
}
