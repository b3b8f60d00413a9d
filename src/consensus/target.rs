//! Compact prime-chain target
//!
//! A target is a 32-bit word whose high 8 bits hold the required prime chain
//! length and whose low 24 bits hold a fractional part. The fractional part
//! makes difficulty continuous instead of stepping a whole prime at a time.
//!
//! The same encoding is used for observed chain lengths, so comparing a
//! certificate's length with a target is a plain integer comparison.

use crate::consensus::params::ConsensusParams;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of fractional bits in a compact target
pub const FRACTIONAL_BITS: u32 = 24;

/// Mask selecting the fractional part
pub const FRACTIONAL_MASK: u32 = (1 << FRACTIONAL_BITS) - 1;

/// Mask selecting the integer chain length
pub const LENGTH_MASK: u32 = !FRACTIONAL_MASK;

/// Longest chain length any network accepts as a target
pub const MAX_CHAIN_LENGTH: u32 = 99;

/// Upper bound of the fractional difficulty scale
pub const FRACTIONAL_DIFFICULTY_MAX: u64 = 1 << (FRACTIONAL_BITS + 32);

/// Lower bound of the fractional difficulty scale
pub const FRACTIONAL_DIFFICULTY_MIN: u64 = 1 << 32;

/// Fractional difficulty above which the integer length steps up
pub const FRACTIONAL_DIFFICULTY_THRESHOLD: u64 = 1 << (8 + 32);

/// Work multiplier between consecutive integer chain lengths
pub const WORK_TRANSITION_RATIO: u64 = 32;

/// Smoothing window used by the work transition estimate
const WORK_TRANSITION_INTERVAL: u128 = 500;

/// Target codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("Chain length target {0} is below the network minimum {1}")]
    BelowMinimum(CompactTarget, u32),
    #[error("Chain length target {0} is above the maximum {1}")]
    AboveMaximum(CompactTarget, u32),
    #[error("Fractional difficulty {0} cannot be encoded")]
    FractionalOutOfRange(u64),
}

/// A compact prime-chain target (or an observed chain length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompactTarget(pub u32);

impl CompactTarget {
    /// Target requiring exactly `length` primes with no fractional part
    pub const fn from_length(length: u32) -> Self {
        Self(length << FRACTIONAL_BITS)
    }

    /// Raw 32-bit encoding
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Integer chain length
    pub const fn length(self) -> u32 {
        (self.0 & LENGTH_MASK) >> FRACTIONAL_BITS
    }

    /// Fractional part (low 24 bits)
    pub const fn fractional(self) -> u32 {
        self.0 & FRACTIONAL_MASK
    }

    /// Easiest target the network accepts: the minimum chain length
    pub fn floor(params: &ConsensusParams) -> Self {
        Self::from_length(params.target_min_length)
    }

    /// Compact ceiling of the target range
    pub fn limit(_params: &ConsensusParams) -> Self {
        Self::from_length(MAX_CHAIN_LENGTH)
    }

    /// Target used for the first two blocks of every chain
    pub fn initial(params: &ConsensusParams) -> Self {
        Self::from_length(params.target_initial_length)
    }

    /// Reject targets outside `[min_length, MAX_CHAIN_LENGTH]`
    pub fn validate(self, min_length: u32) -> Result<(), TargetError> {
        if self.length() < min_length {
            return Err(TargetError::BelowMinimum(self, min_length));
        }
        if self.length() > MAX_CHAIN_LENGTH {
            return Err(TargetError::AboveMaximum(self, MAX_CHAIN_LENGTH));
        }
        Ok(())
    }

    /// Fractional difficulty: `2^56 / (2^24 - fractional)`
    pub fn fractional_difficulty(self) -> u64 {
        FRACTIONAL_DIFFICULTY_MAX / ((1u64 << FRACTIONAL_BITS) - self.fractional() as u64)
    }

    /// Same integer length with the fractional part derived from `difficulty`
    pub fn with_fractional_difficulty(self, difficulty: u64) -> Result<Self, TargetError> {
        if difficulty < FRACTIONAL_DIFFICULTY_MIN {
            return Err(TargetError::FractionalOutOfRange(difficulty));
        }
        let fractional = FRACTIONAL_DIFFICULTY_MAX / difficulty;
        if fractional > (1u64 << FRACTIONAL_BITS) {
            return Err(TargetError::FractionalOutOfRange(difficulty));
        }
        let fractional = (1u64 << FRACTIONAL_BITS) - fractional;
        Ok(Self((self.0 & LENGTH_MASK) | fractional as u32))
    }

    /// Continuous per-block adjustment.
    ///
    /// Moves the fractional difficulty toward the desired spacing with an
    /// exponential moving average over `interval` blocks, stepping the integer
    /// length up or down when the fractional scale overflows.
    pub fn next_continuous(
        self,
        min_length: u32,
        interval: i64,
        spacing: i64,
        actual_spacing: i64,
    ) -> Result<Self, TargetError> {
        let numerator = (interval as i128 + 1) * spacing as i128;
        let denominator = (interval as i128 - 1) * spacing as i128 + 2 * actual_spacing as i128;

        let mut difficulty = if denominator <= 0 || numerator <= 0 {
            FRACTIONAL_DIFFICULTY_MIN
        } else {
            let scaled = BigUint::from(self.fractional_difficulty())
                * BigUint::from(numerator as u128)
                / BigUint::from(denominator as u128);
            scaled
                .to_u64()
                .unwrap_or(FRACTIONAL_DIFFICULTY_MAX)
                .clamp(FRACTIONAL_DIFFICULTY_MIN, FRACTIONAL_DIFFICULTY_MAX)
        };

        let mut next = self;
        if difficulty > FRACTIONAL_DIFFICULTY_THRESHOLD {
            difficulty = FRACTIONAL_DIFFICULTY_MIN;
            next = Self(next.0.saturating_add(1 << FRACTIONAL_BITS));
        } else if difficulty == FRACTIONAL_DIFFICULTY_MIN && next.length() > min_length {
            difficulty = FRACTIONAL_DIFFICULTY_THRESHOLD;
            next = Self(next.0 - (1 << FRACTIONAL_BITS));
        }

        next.with_fractional_difficulty(difficulty)
    }

    /// Scale the fixed-point value of this target by `numerator / denominator`.
    ///
    /// Saturates at `u32::MAX`; callers clamp the result to the network range.
    pub fn scale(self, numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Self(u32::MAX);
        }
        let value = BigUint::from(self.0) * BigUint::from(numerator) / BigUint::from(denominator);
        Self(value.to_u32().unwrap_or(u32::MAX))
    }

    /// Clamp into `[low, high]`
    pub fn clamp_to(self, low: Self, high: Self) -> Self {
        Self(self.0.clamp(low.0, high.0))
    }

    /// Work contributed by one block at this target.
    ///
    /// Grows by [`WORK_TRANSITION_RATIO`] per integer length and smoothly with
    /// the fractional part in between.
    pub fn block_work(self, min_length: u32) -> BigUint {
        let difficulty = self.fractional_difficulty();
        let mut work = BigUint::from(256u32);
        for _ in min_length..self.length() {
            work *= WORK_TRANSITION_RATIO;
        }
        work *= BigUint::from(WORK_TRANSITION_RATIO) * BigUint::from(difficulty);
        work / (BigUint::from((WORK_TRANSITION_RATIO - 1) * FRACTIONAL_DIFFICULTY_MIN)
            + BigUint::from(difficulty))
    }

    /// Human readable difficulty (length with fractional part as a decimal)
    pub fn difficulty(self) -> f64 {
        self.0 as f64 / (1u64 << FRACTIONAL_BITS) as f64
    }
}

impl fmt::Display for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:06x}", self.length(), self.fractional())
    }
}

impl From<u32> for CompactTarget {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

/// Estimate the target at which miners find longer chains than required.
///
/// An exponential moving estimate, updated per block from the previous
/// estimate, the block's target and the chain length it actually found.
pub fn estimate_work_transition(previous: u64, bits: CompactTarget, chain_length: CompactTarget) -> u64 {
    let ceiling = CompactTarget::from_length(bits.length() + 1).to_u32() as u128;
    let floor = CompactTarget::from_length(bits.length()).to_u32() as u128;
    let previous = previous as u128;

    let estimate = if chain_length.length() > bits.length() {
        let weight = ((WORK_TRANSITION_INTERVAL - 1) * bits.fractional_difficulty() as u128) >> 32;
        (previous * weight + 2 * ceiling) / (weight + 2)
    } else {
        ((WORK_TRANSITION_INTERVAL - 1) * previous + 2 * floor) / (WORK_TRANSITION_INTERVAL + 1)
    };
    estimate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_fractional() {
        let target = CompactTarget(0x0780_0000);
        assert_eq!(target.length(), 7);
        assert_eq!(target.fractional(), 0x80_0000);
        assert_eq!(CompactTarget::from_length(6).to_u32(), 0x0600_0000);
        assert_eq!(target.to_string(), "07.800000");
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(CompactTarget::from_length(6).validate(6).is_ok());
        assert!(matches!(
            CompactTarget::from_length(5).validate(6),
            Err(TargetError::BelowMinimum(_, 6))
        ));
        assert!(matches!(
            CompactTarget::from_length(100).validate(6),
            Err(TargetError::AboveMaximum(_, MAX_CHAIN_LENGTH))
        ));
    }

    #[test]
    fn test_fractional_difficulty_bounds() {
        assert_eq!(
            CompactTarget::from_length(7).fractional_difficulty(),
            FRACTIONAL_DIFFICULTY_MIN
        );
        let hardest = CompactTarget(0x07ff_ffff);
        assert_eq!(hardest.fractional_difficulty(), FRACTIONAL_DIFFICULTY_MAX);
    }

    #[test]
    fn test_fractional_difficulty_round_trip() {
        let target = CompactTarget(0x0712_3456);
        let back = CompactTarget::from_length(7)
            .with_fractional_difficulty(target.fractional_difficulty())
            .unwrap();
        // The division loses at most one unit of the fractional part
        assert!(back.fractional().abs_diff(target.fractional()) <= 1);
        assert!(CompactTarget::from_length(7)
            .with_fractional_difficulty(FRACTIONAL_DIFFICULTY_MIN - 1)
            .is_err());
    }

    #[test]
    fn test_next_continuous_on_schedule_is_stable() {
        let target = CompactTarget(0x0740_0000);
        let next = target.next_continuous(6, 10080, 60, 60).unwrap();
        assert_eq!(next.length(), 7);
        assert!(next.fractional().abs_diff(target.fractional()) <= 1);
    }

    #[test]
    fn test_next_continuous_direction() {
        let target = CompactTarget(0x0740_0000);
        let faster = target.next_continuous(6, 10080, 60, 10).unwrap();
        let slower = target.next_continuous(6, 10080, 60, 600).unwrap();
        assert!(faster > target);
        assert!(slower < target);
    }

    #[test]
    fn test_next_continuous_steps_length_down() {
        // At the bottom of the fractional scale a slow block drops a whole length
        let target = CompactTarget::from_length(8);
        let next = target.next_continuous(6, 10080, 60, 6000).unwrap();
        assert_eq!(next.length(), 7);
    }

    #[test]
    fn test_next_continuous_never_below_minimum_length() {
        let target = CompactTarget::from_length(6);
        let next = target.next_continuous(6, 10080, 60, 100_000).unwrap();
        assert_eq!(next, CompactTarget::from_length(6));
    }

    #[test]
    fn test_next_continuous_negative_spacing() {
        let target = CompactTarget(0x0740_0000);
        assert!(target.next_continuous(6, 10080, 60, -10_000_000).is_ok());
    }

    #[test]
    fn test_scale_and_clamp() {
        let target = CompactTarget::from_length(8);
        assert_eq!(target.scale(1, 2), CompactTarget::from_length(4));
        assert_eq!(target.scale(3, 2), CompactTarget::from_length(12));
        assert_eq!(target.scale(1, 0), CompactTarget(u32::MAX));
        assert_eq!(
            CompactTarget::from_length(2).clamp_to(
                CompactTarget::from_length(6),
                CompactTarget::from_length(MAX_CHAIN_LENGTH)
            ),
            CompactTarget::from_length(6)
        );
    }

    #[test]
    fn test_block_work_is_monotonic() {
        let samples = [
            CompactTarget::from_length(6),
            CompactTarget(0x0680_0000),
            CompactTarget(0x06ff_0000),
            CompactTarget::from_length(7),
            CompactTarget(0x0740_0000),
            CompactTarget::from_length(10),
        ];
        for pair in samples.windows(2) {
            assert!(
                pair[0].block_work(6) < pair[1].block_work(6),
                "{} should need less work than {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(CompactTarget::from_length(6).block_work(6), BigUint::from(256u32));
    }

    #[test]
    fn test_difficulty_value() {
        assert_eq!(CompactTarget::from_length(7).difficulty(), 7.0);
        assert_eq!(CompactTarget(0x0780_0000).difficulty(), 7.5);
    }

    #[test]
    fn test_work_transition_moves_toward_found_length() {
        let bits = CompactTarget::from_length(7);
        let start = CompactTarget::from_length(7).to_u32() as u64;
        let longer = estimate_work_transition(start, bits, CompactTarget::from_length(8));
        let same = estimate_work_transition(start, bits, CompactTarget(0x0780_0000));
        assert!(longer > start);
        assert!(same <= start);
    }
}
