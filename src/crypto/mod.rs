//! Cryptographic utilities for the consensus core
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing
//! - The 256-bit [`BlockHash`] identifier
//! - Merkle root calculation

pub mod hash;
pub mod merkle;

pub use hash::{double_sha256, sha256, BlockHash, HashParseError};
pub use merkle::calculate_merkle_root;
