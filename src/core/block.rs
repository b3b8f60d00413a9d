//! Block header and its wire encoding
//!
//! A prime-chain header is the familiar 80-byte header followed by the
//! proof-of-work certificate: an arbitrary-precision multiplier such that
//! `pow_hash * multiplier` is the origin of a prime chain.
//!
//! Two hashes are derived from a header:
//! - [`BlockHeader::pow_hash`] covers only the 80-byte prefix. The certificate
//!   is found after this hash is fixed, so it cannot be part of it.
//! - [`BlockHeader::hash`] covers the full encoding, certificate included, and
//!   is the identity used by the block index.

use crate::consensus::target::CompactTarget;
use crate::crypto::BlockHash;
use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use num_traits::Zero;
use thiserror::Error;

// =============================================================================
// Header Constants
// =============================================================================

/// Size of the fixed header prefix in bytes
pub const BLOCK_HEADER_PREFIX_SIZE: usize = 80;

/// Largest certificate encoding accepted on the wire
pub const MAX_MULTIPLIER_BYTES: usize = 256;

// =============================================================================
// Block Errors
// =============================================================================

/// Header decoding and sanity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Truncated header: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Certificate too large: {0} bytes (max: {MAX_MULTIPLIER_BYTES})")]
    OversizedCertificate(usize),
    #[error("Certificate is negative")]
    NegativeCertificate,
    #[error("Non-canonical encoding: {0}")]
    NonCanonical(&'static str),
    #[error("Trailing data after header: {0} bytes")]
    TrailingBytes(usize),
}

// =============================================================================
// CompactSize integers
// =============================================================================

/// Write a Bitcoin CompactSize length prefix
pub fn write_compact_size(buf: &mut impl BufMut, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Read a CompactSize length prefix, rejecting non-minimal forms
pub fn read_compact_size(buf: &mut impl Buf) -> Result<u64, BlockError> {
    ensure_remaining(buf, 1)?;
    let value = match buf.get_u8() {
        0xfd => {
            ensure_remaining(buf, 2)?;
            let v = buf.get_u16_le() as u64;
            if v < 0xfd {
                return Err(BlockError::NonCanonical("compact size"));
            }
            v
        }
        0xfe => {
            ensure_remaining(buf, 4)?;
            let v = buf.get_u32_le() as u64;
            if v <= 0xffff {
                return Err(BlockError::NonCanonical("compact size"));
            }
            v
        }
        0xff => {
            ensure_remaining(buf, 8)?;
            let v = buf.get_u64_le();
            if v <= 0xffff_ffff {
                return Err(BlockError::NonCanonical("compact size"));
            }
            v
        }
        small => small as u64,
    };
    Ok(value)
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), BlockError> {
    if buf.remaining() < needed {
        return Err(BlockError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Minimal little-endian magnitude with a clear sign bit (zero is empty)
fn multiplier_bytes(value: &BigUint) -> Vec<u8> {
    if value.is_zero() {
        return Vec::new();
    }
    let mut bytes = value.to_bytes_le();
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(0);
    }
    bytes
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header with its prime-chain certificate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    /// Block version (also carries version bits signals)
    pub version: i32,
    /// Identity hash of the previous block
    pub prev_block: BlockHash,
    /// Merkle root of all transactions
    pub merkle_root: BlockHash,
    /// Block creation time (seconds)
    pub time: u32,
    /// Required prime chain length
    pub bits: CompactTarget,
    /// Nonce used to search for a usable header hash
    pub nonce: u32,
    /// Proof-of-work certificate
    pub prime_chain_multiplier: BigUint,
}

impl BlockHeader {
    fn write_prefix(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.version);
        buf.put_slice(self.prev_block.as_bytes());
        buf.put_slice(self.merkle_root.as_bytes());
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits.to_u32());
        buf.put_u32_le(self.nonce);
    }

    /// Append the wire encoding to `buf`
    pub fn encode_to(&self, buf: &mut impl BufMut) {
        self.write_prefix(buf);
        let multiplier = multiplier_bytes(&self.prime_chain_multiplier);
        write_compact_size(buf, multiplier.len() as u64);
        buf.put_slice(&multiplier);
    }

    /// Wire encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_PREFIX_SIZE + 40);
        self.encode_to(&mut buf);
        buf.to_vec()
    }

    /// Decode one header from the front of `buf`
    pub fn decode(buf: &mut impl Buf) -> Result<Self, BlockError> {
        ensure_remaining(buf, BLOCK_HEADER_PREFIX_SIZE)?;
        let version = buf.get_i32_le();
        let mut prev_block = [0u8; 32];
        buf.copy_to_slice(&mut prev_block);
        let mut merkle_root = [0u8; 32];
        buf.copy_to_slice(&mut merkle_root);
        let time = buf.get_u32_le();
        let bits = CompactTarget(buf.get_u32_le());
        let nonce = buf.get_u32_le();

        let len = read_compact_size(buf)? as usize;
        if len > MAX_MULTIPLIER_BYTES {
            return Err(BlockError::OversizedCertificate(len));
        }
        ensure_remaining(buf, len)?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);

        if let Some(&last) = raw.last() {
            if last & 0x80 != 0 {
                return Err(BlockError::NegativeCertificate);
            }
            let padded = last == 0 && raw.len() >= 2 && raw[raw.len() - 2] & 0x80 != 0;
            if last == 0 && !padded {
                return Err(BlockError::NonCanonical("certificate"));
            }
        }

        Ok(Self {
            version,
            prev_block: BlockHash(prev_block),
            merkle_root: BlockHash(merkle_root),
            time,
            bits,
            nonce,
            prime_chain_multiplier: BigUint::from_bytes_le(&raw),
        })
    }

    /// Decode a header that must span `data` exactly
    pub fn from_bytes(data: &[u8]) -> Result<Self, BlockError> {
        let mut buf = data;
        let header = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(BlockError::TrailingBytes(buf.remaining()));
        }
        Ok(header)
    }

    /// Hash of the 80-byte prefix, the value the certificate multiplies
    pub fn pow_hash(&self) -> BlockHash {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_PREFIX_SIZE);
        self.write_prefix(&mut buf);
        BlockHash::of(&buf)
    }

    /// Identity hash over the full encoding
    pub fn hash(&self) -> BlockHash {
        BlockHash::of(&self.to_bytes())
    }

    /// `pow_hash * multiplier`: the first number of the certified prime chain
    pub fn prime_origin(&self) -> BigUint {
        self.pow_hash().to_biguint() * &self.prime_chain_multiplier
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }
}
