//! Prime-Consensus: the consensus core of a prime-chain proof-of-work coin
//!
//! This crate provides:
//! - Block headers carrying a prime-chain certificate, with their wire encoding
//! - Prime-chain proof-of-work validation against a pluggable primality verifier
//! - Fractional chain-length targets, chain work and continuous retargeting
//! - A block index with skip-list ancestry and median time past
//! - Most-work chain selection with reorganization, checkpoints, invalidation
//!   and precious blocks
//! - Version-bits soft-fork deployment tracking
//! - Mainnet, testnet and regtest parameters with verified genesis blocks
//!
//! # Example
//!
//! ```rust
//! use prime_consensus::consensus::{ConsensusParams, NetworkKind};
//! use prime_consensus::core::ChainState;
//! use std::sync::Arc;
//!
//! let params = Arc::new(ConsensusParams::for_network(NetworkKind::Main).unwrap());
//! let state = ChainState::new(params.clone());
//!
//! assert_eq!(state.tip().hash, params.genesis_hash);
//! assert_eq!(state.height(), 0);
//! ```

pub mod cli;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod node;
pub mod storage;

// Re-export commonly used types
pub use consensus::{
    CompactTarget, ConsensusParams, NetworkKind, PowValidator, PrimeChain, PrimeChainVerifier,
};
pub use core::{AcceptOutcome, BlockHeader, ChainState, ConsensusError};
pub use crypto::BlockHash;
pub use node::ConsensusNode;
pub use storage::{BlockIndex, CheckpointManager};
