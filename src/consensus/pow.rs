//! Prime-chain proof-of-work validation
//!
//! A certificate is valid when `pow_hash * multiplier` is the origin of a
//! prime chain at least as long as the header's target. Finding the chain
//! length at an origin is left to a [`PrimeChainVerifier`]; this module owns
//! the surrounding rules: target range, hash and origin bounds, and
//! normalization of the certificate.

use crate::consensus::target::{CompactTarget, MAX_CHAIN_LENGTH};
use crate::crypto::BlockHash;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Header hashes must have this many bits (top bit set)
pub const HASH_BITS_MIN: u64 = 256;

/// Largest origin size in bits
pub const ORIGIN_BITS_MAX: u64 = 2000;

// =============================================================================
// Chain types
// =============================================================================

/// Kind of prime chain a certificate proves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainType {
    /// Cunningham chain of the first kind: p, 2p+1, 4p+3, ...
    Cunningham1 = 1,
    /// Cunningham chain of the second kind: p, 2p-1, 4p-3, ...
    Cunningham2 = 2,
    /// Bi-twin chain: interleaved first and second kind chains
    BiTwin = 3,
}

impl ChainType {
    /// Short name used in chain names
    pub fn code(&self) -> &'static str {
        match self {
            ChainType::Cunningham1 => "1CC",
            ChainType::Cunningham2 => "2CC",
            ChainType::BiTwin => "TWN",
        }
    }

    /// Inverse of [`ChainType::code`], case-insensitive
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "1CC" => Some(ChainType::Cunningham1),
            "2CC" => Some(ChainType::Cunningham2),
            "TWN" => Some(ChainType::BiTwin),
            _ => None,
        }
    }
}

/// Result of probing an origin: the best chain found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimeChain {
    pub chain_type: ChainType,
    /// Length with fractional part, in compact target form
    pub length: CompactTarget,
}

impl PrimeChain {
    pub fn new(chain_type: ChainType, length: CompactTarget) -> Self {
        Self { chain_type, length }
    }

    /// e.g. `1CC07.8a3f21`
    pub fn name(&self) -> String {
        format!("{}{}", self.chain_type.code(), self.length)
    }
}

impl fmt::Display for PrimeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Primality collaborator: reports the longest chain starting at an origin
pub trait PrimeChainVerifier: Send + Sync {
    /// Probe `origin` against `target`. `length` in the result is the length
    /// actually reached, which may be shorter than `target`.
    fn probe(&self, origin: &BigUint, target: CompactTarget) -> PrimeChain;
}

// =============================================================================
// Errors
// =============================================================================

/// Proof-of-work failures. All of them are permanent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Target {0} outside the accepted range")]
    TargetOutOfRange(CompactTarget),
    #[error("Header hash {0} below the 2^255 limit")]
    HeaderHashBelowLimit(BlockHash),
    #[error("Prime chain origin below 2^255")]
    OriginTooSmall,
    #[error("Prime chain origin exceeds {ORIGIN_BITS_MAX} bits")]
    CertificateOverflow,
    #[error("Prime chain {found} shorter than target {required}")]
    InsufficientProof { found: PrimeChain, required: CompactTarget },
    #[error("Certificate not normalized: half origin yields {0}")]
    NotNormalized(PrimeChain),
}

// =============================================================================
// Validator
// =============================================================================

/// Checks prime-chain certificates for one network
#[derive(Clone)]
pub struct PowValidator {
    verifier: Arc<dyn PrimeChainVerifier>,
    min_length: u32,
}

impl PowValidator {
    pub fn new(verifier: Arc<dyn PrimeChainVerifier>, min_length: u32) -> Self {
        Self { verifier, min_length }
    }

    /// Check a certificate, returning the chain it proves
    pub fn verify(
        &self,
        header_hash: &BlockHash,
        bits: CompactTarget,
        multiplier: &BigUint,
    ) -> Result<PrimeChain, PowError> {
        if bits.length() < self.min_length || bits.length() > MAX_CHAIN_LENGTH {
            return Err(PowError::TargetOutOfRange(bits));
        }

        let hash = header_hash.to_biguint();
        if hash.bits() < HASH_BITS_MIN {
            return Err(PowError::HeaderHashBelowLimit(*header_hash));
        }

        let origin = hash * multiplier;
        if origin.bits() < HASH_BITS_MIN {
            return Err(PowError::OriginTooSmall);
        }
        if origin.bits() > ORIGIN_BITS_MAX {
            return Err(PowError::CertificateOverflow);
        }

        let found = self.verifier.probe(&origin, bits);
        if found.length < bits {
            return Err(PowError::InsufficientProof { found, required: bits });
        }

        let two = BigUint::from(2u32);
        let even_multiplier = (multiplier % &two).is_zero();
        if even_multiplier && (&origin % BigUint::from(4u32)).is_zero() {
            let half = &origin >> 1usize;
            if half > BigUint::one() {
                let halved = self.verifier.probe(&half, bits);
                if halved.length >= bits {
                    return Err(PowError::NotNormalized(halved));
                }
            }
        }

        Ok(found)
    }

    /// Boolean form of [`verify`](Self::verify) for mining and speculative checks
    pub fn verify_silent(&self, header_hash: &BlockHash, bits: CompactTarget, multiplier: &BigUint) -> bool {
        match self.verify(header_hash, bits, multiplier) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Proof of work check failed for {}: {}", header_hash, e);
                false
            }
        }
    }

    pub fn min_length(&self) -> u32 {
        self.min_length
    }
}

impl fmt::Debug for PowValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowValidator")
            .field("min_length", &self.min_length)
            .finish()
    }
}
