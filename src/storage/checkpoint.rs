//! Checkpoint System
//!
//! Hard-coded (height, hash) pins. A header at a pinned height must carry the
//! pinned hash; anything else is rejected together with every block built on
//! it.

use crate::consensus::params::ConsensusParams;
use crate::crypto::BlockHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Checkpoint Entry
// =============================================================================

/// A known-good block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

impl Checkpoint {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

// =============================================================================
// Checkpoint Manager
// =============================================================================

/// Checkpoints of one network
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    checkpoints: BTreeMap<u32, BlockHash>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoints configured for a network
    pub fn from_params(params: &ConsensusParams) -> Self {
        let mut manager = Self::new();
        for (height, hash) in &params.checkpoints {
            manager.add_checkpoint(Checkpoint::new(*height, *hash));
        }
        manager
    }

    /// Pin `checkpoint.height`, replacing any earlier pin there
    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint.height, checkpoint.hash);
    }

    /// Check a block against the pin at its height
    pub fn verify_checkpoint(&self, height: u32, hash: &BlockHash) -> CheckpointResult {
        match self.checkpoints.get(&height) {
            Some(expected) if expected == hash => CheckpointResult::Match,
            Some(expected) => CheckpointResult::Mismatch {
                expected: *expected,
                got: *hash,
            },
            None => CheckpointResult::NoCheckpoint,
        }
    }

    /// All checkpoints by height
    pub fn all(&self) -> Vec<Checkpoint> {
        self.checkpoints
            .iter()
            .map(|(height, hash)| Checkpoint::new(*height, *hash))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

// =============================================================================
// Checkpoint Result
// =============================================================================

/// Result of checkpoint verification
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointResult {
    /// Block matches the checkpoint
    Match,
    /// Block doesn't match the checkpoint
    Mismatch { expected: BlockHash, got: BlockHash },
    /// No checkpoint at this height
    NoCheckpoint,
}
