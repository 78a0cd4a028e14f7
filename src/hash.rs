//! Seeded key hashing
//!
//! Index placement depends on `hash(key, seed)`, so the seed is generated once
//! per store and persisted with the engine metadata.

/// A seeded 32-bit hash function over key bytes
pub type HashFn = fn(&[u8], u32) -> u32;

/// Default hasher: xxHash32
pub fn xxh32_with_seed(data: &[u8], seed: u32) -> u32 {
    xxhash_rust::xxh32::xxh32(data, seed)
}

/// Generate a fresh random seed
pub fn rand_seed() -> u32 {
    rand::random::<u32>()
}
