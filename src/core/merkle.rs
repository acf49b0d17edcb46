use crate::core::hash::ChainHash;
use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest_parts;

/// Merkle root over transaction hashes.
///
/// Pairs are hashed left‖right. An odd element at the end of a level is
/// carried up unchanged rather than duplicated.
pub fn merkle_root(hashes: &[ChainHash]) -> Result<ChainHash> {
    if hashes.is_empty() {
        return Err(BlockchainError::validation(
            "Cannot compute merkle root of an empty list",
        ));
    }

    let mut level: Vec<ChainHash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if let [left, right] = pair {
                next.push(ChainHash::new(sha256_digest_parts(&[
                    left.as_bytes(),
                    right.as_bytes(),
                ])));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    Ok(level[0])
}

pub fn merkle_root_for_transactions(transactions: &[Transaction]) -> Result<ChainHash> {
    let hashes: Vec<ChainHash> = transactions.iter().map(|tx| tx.get_tx_hash()).collect();
    merkle_root(&hashes)
}
