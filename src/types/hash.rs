//! 32-byte SHA-256 hash type with zero-allocation operations.

use crate::types::encoding::EncodeSink;
use sha2::{Digest, Sha256};
use shardchain_derive::BinaryCodec;
use std::fmt;

/// Hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte hash used throughout the state engine.
///
/// This type is `Copy` for performance - hashes are passed frequently during
/// state commits and should live on the stack to avoid heap allocations.
/// At 32 bytes, copying is cheaper than reference indirection on modern CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Creates a zero-valued hash (all bytes are 0x00).
    ///
    /// Used as a sentinel for an unset state root or empty storage root.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Returns the hash as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns the hash as a byte Vec.
    pub fn to_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`HASH_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Hash> {
        if slice.len() != HASH_LEN {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(slice);
        Some(Hash(bytes))
    }

    /// Creates a new SHA-256 hash builder for incremental hashing.
    ///
    /// Use this for streaming data or when computing hashes over multiple inputs
    /// without intermediate allocations.
    pub fn sha256() -> HashBuilder {
        HashBuilder::new()
    }

    /// Returns the lowercase hex rendering of this hash.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Incremental SHA-256 hash builder.
///
/// Allows feeding data in chunks and finalizing to produce a [`Hash`].
/// Implements [`EncodeSink`] so encodable types can be hashed directly
/// without intermediate byte buffers.
pub struct HashBuilder {
    hasher: Sha256,
}

impl HashBuilder {
    /// Creates a new hash builder with empty state.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Feeds data into the hash computation.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn chain(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Consumes the builder and returns the final hash.
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_vec_returns_correct_bytes() {
        let mut h = Hash::sha256();
        h.update(b"test");
        let hash = h.finalize();
        let vec = hash.to_vec();
        assert_eq!(vec.len(), HASH_LEN);
        assert_eq!(vec.as_slice(), hash.as_slice());
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(Hash::zero().is_zero());
        assert!(!Hash([1u8; HASH_LEN]).is_zero());
    }

    #[test]
    fn sha256_matches_incremental_and_chained() {
        let incremental = {
            let mut h = Hash::sha256();
            h.update(b"hello ");
            h.update(b"world");
            h.finalize()
        };
        let chained = Hash::sha256().chain(b"hello world").finalize();
        assert_eq!(incremental, chained);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_none());
        assert!(Hash::from_slice(&[0u8; 33]).is_none());
        assert!(Hash::from_slice(&[0u8; 32]).is_some());
    }

    #[test]
    fn display_is_lowercase_hex() {
        let hash = Hash([0xA5; HASH_LEN]);
        assert_eq!(format!("{hash}"), "a5".repeat(32));
        assert_eq!(hash.hex(), "a5".repeat(32));
    }
}
