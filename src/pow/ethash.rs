//! Memory-hard hashing for proof-of-work.
//!
//! Implements the epoch-cache construction and the hashimoto mixing loop:
//! a pseudorandom cache is derived from the epoch seed, dataset items are
//! generated on demand from the cache (light path) or precomputed wholesale
//! (full path), and each nonce candidate folds 64 dataset pages into a
//! 32-byte mix digest plus final hash.

use crate::types::hash::Hash;
use sha3::{Digest, Keccak256, Keccak512};

/// Blocks per epoch; the cache and dataset grow once per epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

const HASH_BYTES: usize = 64;
const MIX_BYTES: usize = 128;
const WORD_BYTES: usize = 4;
const DATASET_PARENTS: u32 = 256;
const CACHE_ROUNDS: usize = 3;
const ACCESSES: usize = 64;

const HASH_WORDS: usize = HASH_BYTES / WORD_BYTES;
const MIX_WORDS: usize = MIX_BYTES / WORD_BYTES;
const MIX_HASHES: usize = MIX_BYTES / HASH_BYTES;

// Production sizes make the cache tens of megabytes and the dataset gigabytes;
// tests shrink them so context construction stays in the microsecond range.
#[cfg(not(test))]
const CACHE_BYTES_INIT: u64 = 1 << 24;
#[cfg(not(test))]
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
#[cfg(not(test))]
const DATASET_BYTES_INIT: u64 = 1 << 30;
#[cfg(not(test))]
const DATASET_BYTES_GROWTH: u64 = 1 << 23;

#[cfg(test)]
const CACHE_BYTES_INIT: u64 = 1 << 12;
#[cfg(test)]
const CACHE_BYTES_GROWTH: u64 = 1 << 10;
#[cfg(test)]
const DATASET_BYTES_INIT: u64 = 1 << 15;
#[cfg(test)]
const DATASET_BYTES_GROWTH: u64 = 1 << 13;

/// Output of hashing one (header, nonce) candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowResult {
    /// Digest of the dataset mix, carried in block headers.
    pub mix_hash: Hash,
    /// The value compared against the difficulty boundary.
    pub final_hash: Hash,
}

/// Epoch number a block belongs to.
pub fn epoch(block_num: u64) -> u64 {
    block_num / EPOCH_LENGTH
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

fn keccak512(data: &[u8]) -> [u8; HASH_BYTES] {
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(&Keccak512::digest(data));
    out
}

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(0x0100_0193) ^ b
}

fn word(item: &[u8; HASH_BYTES], index: usize) -> u32 {
    let offset = index * WORD_BYTES;
    u32::from_le_bytes(item[offset..offset + WORD_BYTES].try_into().unwrap())
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Cache size for an epoch: near-linear growth snapped down to a prime
/// number of 64-byte items.
pub fn cache_size(epoch: u64) -> u64 {
    let mut size = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES as u64;
    while !is_prime(size / HASH_BYTES as u64) {
        size -= 2 * HASH_BYTES as u64;
    }
    size
}

/// Dataset size for an epoch, snapped to a prime number of 128-byte pages.
pub fn dataset_size(epoch: u64) -> u64 {
    let mut size = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES as u64;
    while !is_prime(size / MIX_BYTES as u64) {
        size -= 2 * MIX_BYTES as u64;
    }
    size
}

/// Seed hash for an epoch: the zero hash keccak-folded once per epoch.
pub fn seed_hash(epoch: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = keccak256(&seed);
    }
    seed
}

fn make_cache(size: u64, seed: &[u8; 32]) -> Vec<[u8; HASH_BYTES]> {
    let n = (size / HASH_BYTES as u64) as usize;
    let mut items = Vec::with_capacity(n);

    items.push(keccak512(seed));
    for i in 1..n {
        let prev = items[i - 1];
        items.push(keccak512(&prev));
    }

    // RandMemoHash passes over the cache.
    for _ in 0..CACHE_ROUNDS {
        for i in 0..n {
            let v = (word(&items[i], 0) as usize) % n;
            let left = items[(i + n - 1) % n];
            let right = items[v];
            let mut mixed = [0u8; HASH_BYTES];
            for (j, byte) in mixed.iter_mut().enumerate() {
                *byte = left[j] ^ right[j];
            }
            items[i] = keccak512(&mixed);
        }
    }

    items
}

fn calc_dataset_item(cache: &[[u8; HASH_BYTES]], index: u32) -> [u8; HASH_BYTES] {
    let n = cache.len();
    let mut mix = cache[index as usize % n];

    let word0 = word(&mix, 0) ^ index;
    mix[0..WORD_BYTES].copy_from_slice(&word0.to_le_bytes());
    mix = keccak512(&mix);

    for j in 0..DATASET_PARENTS {
        let parent = fnv(index ^ j, word(&mix, j as usize % HASH_WORDS)) as usize % n;
        let parent_item = cache[parent];
        for w in 0..HASH_WORDS {
            let mixed = fnv(word(&mix, w), word(&parent_item, w));
            mix[w * WORD_BYTES..(w + 1) * WORD_BYTES].copy_from_slice(&mixed.to_le_bytes());
        }
    }

    keccak512(&mix)
}

fn hashimoto<L>(header: &Hash, nonce: u64, full_size: u64, lookup: L) -> PowResult
where
    L: Fn(u32) -> [u8; HASH_BYTES],
{
    let mut input = [0u8; 40];
    input[..32].copy_from_slice(header.as_slice());
    input[32..].copy_from_slice(&nonce.to_le_bytes());
    let s = keccak512(&input);

    let mut mix = [0u8; MIX_BYTES];
    mix[..HASH_BYTES].copy_from_slice(&s);
    mix[HASH_BYTES..].copy_from_slice(&s);

    let pages = (full_size / MIX_BYTES as u64) as u32;
    let s0 = word(&s, 0);

    for i in 0..ACCESSES as u32 {
        let mix_word = {
            let offset = (i as usize % MIX_WORDS) * WORD_BYTES;
            u32::from_le_bytes(mix[offset..offset + WORD_BYTES].try_into().unwrap())
        };
        let p = fnv(i ^ s0, mix_word) % pages * MIX_HASHES as u32;

        let mut page = [0u8; MIX_BYTES];
        page[..HASH_BYTES].copy_from_slice(&lookup(p));
        page[HASH_BYTES..].copy_from_slice(&lookup(p + 1));

        for w in 0..MIX_WORDS {
            let offset = w * WORD_BYTES;
            let a = u32::from_le_bytes(mix[offset..offset + WORD_BYTES].try_into().unwrap());
            let b = u32::from_le_bytes(page[offset..offset + WORD_BYTES].try_into().unwrap());
            mix[offset..offset + WORD_BYTES].copy_from_slice(&fnv(a, b).to_le_bytes());
        }
    }

    // Compress the 128-byte mix down to 32 bytes.
    let mut cmix = [0u8; 32];
    for i in 0..(MIX_WORDS / 4) {
        let offset = i * 4 * WORD_BYTES;
        let w0 = u32::from_le_bytes(mix[offset..offset + 4].try_into().unwrap());
        let w1 = u32::from_le_bytes(mix[offset + 4..offset + 8].try_into().unwrap());
        let w2 = u32::from_le_bytes(mix[offset + 8..offset + 12].try_into().unwrap());
        let w3 = u32::from_le_bytes(mix[offset + 12..offset + 16].try_into().unwrap());
        let compressed = fnv(fnv(fnv(w0, w1), w2), w3);
        cmix[i * WORD_BYTES..(i + 1) * WORD_BYTES].copy_from_slice(&compressed.to_le_bytes());
    }

    let mut final_input = [0u8; HASH_BYTES + 32];
    final_input[..HASH_BYTES].copy_from_slice(&s);
    final_input[HASH_BYTES..].copy_from_slice(&cmix);

    PowResult {
        mix_hash: Hash(cmix),
        final_hash: Hash(keccak256(&final_input)),
    }
}

/// Light acceleration structure: the epoch cache, with dataset items
/// generated on demand.
pub struct EpochContext {
    epoch: u64,
    cache: Vec<[u8; HASH_BYTES]>,
    full_size: u64,
}

impl EpochContext {
    /// Builds the light context for the epoch containing `block_num`.
    pub fn new(block_num: u64) -> Self {
        let epoch = epoch(block_num);
        let seed = seed_hash(epoch);
        Self {
            epoch,
            cache: make_cache(cache_size(epoch), &seed),
            full_size: dataset_size(epoch),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Hashes one (header, nonce) candidate through the light path.
    pub fn hash(&self, header: &Hash, nonce: u64) -> PowResult {
        hashimoto(header, nonce, self.full_size, |i| {
            calc_dataset_item(&self.cache, i)
        })
    }

    /// Verifies a claimed solution: the mix digest must reproduce and the
    /// final hash must not exceed the boundary.
    pub fn verify(&self, header: &Hash, mix_hash: &Hash, nonce: u64, boundary: &Hash) -> bool {
        let result = self.hash(header, nonce);
        result.mix_hash == *mix_hash && result.final_hash.0 <= boundary.0
    }
}

/// Full acceleration structure: the dataset precomputed in memory.
///
/// Construction walks every dataset item, which takes minutes at production
/// sizes; only the dedicated full-CPU mining mode pays that cost.
pub struct FullContext {
    epoch: u64,
    dataset: Vec<[u8; HASH_BYTES]>,
    full_size: u64,
}

impl FullContext {
    /// Precomputes the full dataset for the epoch containing `block_num`.
    pub fn new(block_num: u64) -> Self {
        let epoch = epoch(block_num);
        let seed = seed_hash(epoch);
        let cache = make_cache(cache_size(epoch), &seed);
        let full_size = dataset_size(epoch);

        let items = (full_size / HASH_BYTES as u64) as u32;
        let mut dataset = Vec::with_capacity(items as usize);
        for i in 0..items {
            dataset.push(calc_dataset_item(&cache, i));
        }

        Self {
            epoch,
            dataset,
            full_size,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Hashes one (header, nonce) candidate through the precomputed dataset.
    pub fn hash(&self, header: &Hash, nonce: u64) -> PowResult {
        hashimoto(header, nonce, self.full_size, |i| self.dataset[i as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        assert_eq!(epoch(0), 0);
        assert_eq!(epoch(EPOCH_LENGTH - 1), 0);
        assert_eq!(epoch(EPOCH_LENGTH), 1);
        assert_eq!(epoch(10 * EPOCH_LENGTH + 1), 10);
    }

    #[test]
    fn sizes_are_prime_item_counts() {
        for e in 0..4 {
            assert!(is_prime(cache_size(e) / HASH_BYTES as u64));
            assert!(is_prime(dataset_size(e) / MIX_BYTES as u64));
        }
    }

    #[test]
    fn seed_hash_chains_per_epoch() {
        assert_eq!(seed_hash(0), [0u8; 32]);
        assert_eq!(seed_hash(1), keccak256(&[0u8; 32]));
        assert_eq!(seed_hash(2), keccak256(&keccak256(&[0u8; 32])));
    }

    #[test]
    fn hash_is_deterministic() {
        let ctx = EpochContext::new(0);
        let header = Hash([0x11; 32]);
        let a = ctx.hash(&header, 42);
        let b = ctx.hash(&header, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_varies_with_nonce_and_header() {
        let ctx = EpochContext::new(0);
        let header = Hash([0x11; 32]);
        assert_ne!(ctx.hash(&header, 1), ctx.hash(&header, 2));
        assert_ne!(
            ctx.hash(&header, 1),
            ctx.hash(&Hash([0x12; 32]), 1)
        );
    }

    #[test]
    fn different_epochs_have_different_caches() {
        let e0 = EpochContext::new(0);
        let e1 = EpochContext::new(EPOCH_LENGTH);
        assert_ne!(e0.epoch(), e1.epoch());
        let header = Hash([0x22; 32]);
        assert_ne!(e0.hash(&header, 7), e1.hash(&header, 7));
    }

    #[test]
    fn full_context_matches_light_context() {
        let light = EpochContext::new(0);
        let full = FullContext::new(0);
        let header = Hash([0x33; 32]);
        for nonce in [0u64, 1, 99, 12345] {
            assert_eq!(light.hash(&header, nonce), full.hash(&header, nonce));
        }
    }

    #[test]
    fn verify_accepts_own_result() {
        let ctx = EpochContext::new(0);
        let header = Hash([0x44; 32]);
        let result = ctx.hash(&header, 7);
        let permissive = Hash([0xFF; 32]);

        assert!(ctx.verify(&header, &result.mix_hash, 7, &permissive));
    }

    #[test]
    fn verify_rejects_wrong_mix_hash() {
        let ctx = EpochContext::new(0);
        let header = Hash([0x44; 32]);
        let result = ctx.hash(&header, 7);
        let permissive = Hash([0xFF; 32]);

        let mut wrong = result.mix_hash;
        wrong.0[0] ^= 1;
        assert!(!ctx.verify(&header, &wrong, 7, &permissive));
    }

    #[test]
    fn verify_rejects_boundary_violation() {
        let ctx = EpochContext::new(0);
        let header = Hash([0x44; 32]);
        let result = ctx.hash(&header, 7);

        // A boundary strictly below the result hash must fail.
        let mut tight = result.final_hash;
        let mut borrowed = false;
        for byte in tight.0.iter_mut().rev() {
            if *byte > 0 {
                *byte -= 1;
                borrowed = true;
                break;
            }
        }
        if borrowed {
            assert!(!ctx.verify(&header, &result.mix_hash, 7, &tight));
        }
    }
}
