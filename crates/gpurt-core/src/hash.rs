//! Structural hashing.
//!
//! Cache keys are 64-bit and never verified against the full descriptor
//! unless `cache.verify_hits` is enabled. Both hashers are deterministic across
//! runs, so content hashes are stable for identical write sequences.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::xxh3_64;

/// Compute a `u64` hash of any `Hash`-able value using `FxHasher`.
#[inline]
pub fn fx_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Hash SPIR-V words with xxh3, without copying them into a byte buffer.
pub fn hash_words(words: &[u32]) -> u64 {
    xxh3_64(bytemuck::cast_slice(words))
}

/// Order-dependent combine.
#[inline]
pub fn combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Order-independent combine of a set of hashes.
pub fn combine_unordered<I: IntoIterator<Item = u64>>(values: I) -> u64 {
    values
        .into_iter()
        .fold(0u64, |acc, v| acc.wrapping_add(mix(v)))
}

// splitmix64 finalizer; spreads low-entropy inputs before the commutative sum.
#[inline]
fn mix(mut v: u64) -> u64 {
    v = (v ^ (v >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    v = (v ^ (v >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    v ^ (v >> 31)
}
