//! Merkle root calculation for block transactions
//!
//! Bitcoin-style binary tree over double-SHA-256 transaction ids, where an odd
//! level duplicates its last entry.

use super::hash::{double_sha256, BlockHash};

/// Calculate the merkle root from a list of transaction ids
pub fn calculate_merkle_root(tx_ids: &[BlockHash]) -> BlockHash {
    if tx_ids.is_empty() {
        return BlockHash::zero();
    }

    let mut current_level: Vec<BlockHash> = tx_ids.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            next_level.push(BlockHash(double_sha256(&data)));
        }

        current_level = next_level;
    }

    current_level[0]
}
