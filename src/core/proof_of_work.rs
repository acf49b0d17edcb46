//! Snow-field proof of work
//!
//! A header hashes to an initial context. Each of `POW_LOOK_PASSES` rounds
//! derives a word index from the context, reads that word from the snow field
//! and folds it into the context. The block carries a merkle proof for every
//! word it read, so validators only need the field's merkle root. The final
//! context is the block hash and must fall below the target.

use crate::core::block::{BlockHeader, SnowPowProof, NONCE_LENGTH, TARGET_LENGTH};
use crate::core::hash::ChainHash;
use crate::utils::{sha256_digest, sha256_digest_parts};
use log::debug;

pub const POW_LOOK_PASSES: usize = 6;
pub const SNOW_MERKLE_HASH_LEN: usize = 16;

pub type SnowWord = [u8; SNOW_MERKLE_HASH_LEN];

fn snow_merkle_hash(left: &[u8], right: &[u8]) -> SnowWord {
    let full = sha256_digest_parts(&[left, right]);
    let mut out = [0u8; SNOW_MERKLE_HASH_LEN];
    out.copy_from_slice(&full[..SNOW_MERKLE_HASH_LEN]);
    out
}

/// Initial context: digest of the nonce and every header field the proof of
/// work commits to.
pub fn hash_header_bits(header: &BlockHeader, nonce: &[u8]) -> ChainHash {
    ChainHash::new(sha256_digest_parts(&[
        nonce,
        &header.version.to_be_bytes(),
        &header.block_height.to_be_bytes(),
        &header.timestamp.to_be_bytes(),
        &header.snow_field.to_be_bytes(),
        header.prev_block_hash.as_bytes(),
        header.merkle_root_hash.as_bytes(),
        header.utxo_root_hash.as_bytes(),
        &header.target,
    ]))
}

pub fn next_snow_field_index(context: &ChainHash, word_count: u64) -> u64 {
    let digest = sha256_digest(context.as_bytes());
    let mut buf = [0u8; 8];
    buf[1..].copy_from_slice(&digest[1..8]);
    u64::from_be_bytes(buf) % word_count
}

pub fn next_context(context: &ChainHash, word: &[u8]) -> ChainHash {
    ChainHash::new(sha256_digest_parts(&[context.as_bytes(), word]))
}

/// Big-endian comparison over the first `TARGET_LENGTH` bytes
pub fn less_than_target(hash: &ChainHash, target: &[u8]) -> bool {
    if target.len() != TARGET_LENGTH {
        return false;
    }
    &hash.as_bytes()[..TARGET_LENGTH] < target
}

/// Verifies that `proof` is a merkle path from its word to `expected_root`
/// in a field of `word_count` words.
pub fn check_proof(proof: &SnowPowProof, expected_root: &[u8], word_count: u64) -> bool {
    if proof.word_idx >= word_count {
        return false;
    }
    if proof
        .merkle_components
        .iter()
        .any(|c| c.len() != SNOW_MERKLE_HASH_LEN)
    {
        return false;
    }

    let mut stack = proof.merkle_components.iter();
    let mut current: SnowWord = match stack.next() {
        Some(first) => {
            let mut w = [0u8; SNOW_MERKLE_HASH_LEN];
            w.copy_from_slice(first);
            w
        }
        None => return false,
    };

    let target = proof.word_idx;
    let mut start = target;
    let mut end = target;
    let mut dist: u64 = 1;
    let mut remaining = stack.len();

    while remaining > 0 && end <= word_count {
        dist = match dist.checked_mul(2) {
            Some(d) => d,
            None => return false,
        };
        start -= start % dist;
        end = start + dist;
        let mid = (start + end) / 2;

        let sibling = match stack.next() {
            Some(s) => s,
            None => return false,
        };
        remaining -= 1;
        current = if target < mid {
            snow_merkle_hash(&current, sibling)
        } else {
            snow_merkle_hash(sibling, &current)
        };
    }

    start == 0 && end == word_count && current.as_slice() == expected_root
}

/// A snow field held entirely in memory, with every merkle level kept so
/// proofs are cheap. Only suitable for small fields such as regtest ones.
pub struct SnowField {
    levels: Vec<Vec<SnowWord>>,
}

impl SnowField {
    /// Builds a field from its words. The word count must be a power of two.
    pub fn from_words(words: Vec<SnowWord>) -> Option<SnowField> {
        if words.len() < 2 || !words.len().is_power_of_two() {
            return None;
        }
        let mut levels = vec![words];
        while levels[levels.len() - 1].len() > 1 {
            let prev = &levels[levels.len() - 1];
            let next: Vec<SnowWord> = prev
                .chunks(2)
                .map(|pair| snow_merkle_hash(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }
        Some(SnowField { levels })
    }

    /// Deterministic pseudo-random field. Word `i` is the truncated digest
    /// of `seed ‖ i`.
    pub fn synthetic(seed: &[u8], word_count: usize) -> SnowField {
        let count = word_count.max(2).next_power_of_two();
        let words = (0..count as u64)
            .map(|i| snow_merkle_hash(seed, &i.to_be_bytes()))
            .collect();
        // count is a power of two and at least 2
        match Self::from_words(words) {
            Some(field) => field,
            None => SnowField { levels: vec![] },
        }
    }

    pub fn word_count(&self) -> u64 {
        self.levels.first().map(|l| l.len() as u64).unwrap_or(0)
    }

    pub fn merkle_root(&self) -> &[u8] {
        self.levels
            .last()
            .and_then(|l| l.first())
            .map(|w| w.as_slice())
            .unwrap_or(&[])
    }

    pub fn word(&self, idx: u64) -> Option<&SnowWord> {
        self.levels.first().and_then(|l| l.get(idx as usize))
    }

    pub fn proof(&self, idx: u64) -> Option<SnowPowProof> {
        let word = self.word(idx)?;
        let mut merkle_components = vec![word.to_vec()];
        let mut pos = idx as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            merkle_components.push(level[pos ^ 1].to_vec());
            pos /= 2;
        }
        Some(SnowPowProof {
            word_idx: idx,
            merkle_components,
        })
    }

    /// Nonce search. On success fills in nonce, snow hash and proofs and
    /// returns true. Every other header field must already be final.
    pub fn mine(&self, header: &mut BlockHeader, max_attempts: u64) -> bool {
        let word_count = self.word_count();
        if word_count == 0 {
            return false;
        }
        let prefix: [u8; 4] = rand::random();

        for attempt in 0..max_attempts {
            let mut nonce = Vec::with_capacity(NONCE_LENGTH);
            nonce.extend_from_slice(&prefix);
            nonce.extend_from_slice(&attempt.to_be_bytes());

            let mut context = hash_header_bits(header, &nonce);
            let mut proofs = Vec::with_capacity(POW_LOOK_PASSES);
            for _ in 0..POW_LOOK_PASSES {
                let idx = next_snow_field_index(&context, word_count);
                let (Some(proof), Some(word)) = (self.proof(idx), self.word(idx)) else {
                    return false;
                };
                context = next_context(&context, word);
                proofs.push(proof);
            }

            if less_than_target(&context, &header.target) {
                debug!("Found proof of work after {} attempts", attempt + 1);
                header.nonce = nonce;
                header.snow_hash = context;
                header.pow_proofs = proofs;
                return true;
            }
        }
        false
    }
}
