//! Membership filter
//!
//! Bit bloom filter over user keys. Probe positions use double hashing,
//! `(h1 + i·h2) mod bits`, with two seeded xxhash64 values.
//!
//! The filter only guards reads when it is *trusted*: freshly created, rebuilt,
//! or restored from metadata that matches the shard. An untrusted filter
//! answers "maybe" for every key, so a filter that lost inserts in a crash can
//! never hide a record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use xxhash_rust::xxh64::xxh64;

use crate::error::{Result, TierError};

const SEED_PRIMARY: u64 = 0;
const SEED_SECONDARY: u64 = 0x9e37_79b9_7f4a_7c15;

pub struct MembershipFilter {
    bits: Box<[AtomicU64]>,
    hash_count: u32,
    trusted: AtomicBool,
}

impl MembershipFilter {
    /// Empty, trusted filter of `num_bits` bits (rounded up to whole words)
    pub fn new(num_bits: usize, hash_count: u32) -> Self {
        let words = num_bits.div_ceil(64).max(1);
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            hash_count: hash_count.max(1),
            trusted: AtomicBool::new(true),
        }
    }

    /// Empty filter that passes every key through until restored or rebuilt
    pub fn untrusted(num_bits: usize, hash_count: u32) -> Self {
        let filter = Self::new(num_bits, hash_count);
        filter.trusted.store(false, Ordering::Release);
        filter
    }

    pub fn insert(&self, user_key: &[u8]) {
        let bits = self.num_bits() as u64;
        for bit in probes(user_key, self.hash_count, bits) {
            self.bits[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// False only if `user_key` was definitely never inserted
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        if !self.is_trusted() {
            return true;
        }
        let bits = self.num_bits() as u64;
        probes(user_key, self.hash_count, bits)
            .all(|bit| self.bits[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0)
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Acquire)
    }

    pub(crate) fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len() * 64
    }

    pub fn byte_len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Bit array as little-endian words
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for word in self.bits.iter() {
            out.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    /// Merge a saved bit array and mark the filter trusted
    ///
    /// Bits are OR-ed in, so keys inserted since the save are kept.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.byte_len() {
            return Err(TierError::corruption(format!(
                "filter image of {} bytes, expected {}",
                bytes.len(),
                self.byte_len()
            )));
        }
        for (word, chunk) in self.bits.iter().zip(bytes.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            word.fetch_or(u64::from_le_bytes(le), Ordering::Relaxed);
        }
        self.set_trusted(true);
        Ok(())
    }
}

fn probes(key: &[u8], hash_count: u32, bits: u64) -> impl Iterator<Item = u64> {
    let h1 = xxh64(key, SEED_PRIMARY);
    let h2 = xxh64(key, SEED_SECONDARY);
    (0..hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
}
