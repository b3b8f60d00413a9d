//! Difficulty Engine
//!
//! Computes the target every block must carry, and the block subsidy that
//! follows from it.
//!
//! Two retarget modes exist:
//! - `Continuous`: every block nudges the target from the spacing of the last
//!   two blocks (an exponential moving average over one interval).
//! - `Windowed`: the target is held for `interval` blocks, then rescaled by
//!   how long the window actually took.

use crate::consensus::params::{ConsensusParams, RetargetMode};
use crate::consensus::target::{CompactTarget, FRACTIONAL_BITS};
use crate::core::genesis::{CENT, COIN};
use crate::storage::{BlockIndex, NodeId};
use std::sync::Arc;

/// Subsidy numerator: coins paid at difficulty 1
pub const SUBSIDY_BASE_COINS: i64 = 999;

/// Computes required targets for one network
#[derive(Debug, Clone)]
pub struct DifficultyEngine {
    params: Arc<ConsensusParams>,
}

impl DifficultyEngine {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Target required of the block built on `prev` (`None` for genesis)
    pub fn next_required(&self, index: &BlockIndex, prev: Option<NodeId>) -> CompactTarget {
        let params = &self.params;
        let initial = CompactTarget::initial(params);

        let prev_id = match prev {
            Some(id) => id,
            None => return initial,
        };
        let last = index.get(prev_id);
        // Heights 0 and 1
        let parent_id = match last.parent {
            Some(id) => id,
            None => return initial,
        };

        if params.no_retargeting {
            return last.bits();
        }

        let limit = CompactTarget::limit(params);
        match params.retarget_mode {
            RetargetMode::Continuous => {
                let actual_spacing = last.time() - index.get(parent_id).time();
                let next = last
                    .bits()
                    .next_continuous(
                        params.target_min_length,
                        params.interval(),
                        params.target_spacing,
                        actual_spacing,
                    )
                    .unwrap_or_else(|e| {
                        log::warn!("Continuous retarget after height {} failed: {}", last.height, e);
                        last.bits()
                    });
                next.min(limit)
            }
            RetargetMode::Windowed => {
                let interval = params.interval().max(1) as u32;
                let height = last.height + 1;
                if height % interval != 0 {
                    return last.bits();
                }

                let first_height = last.height.saturating_sub(interval - 1);
                let first = index
                    .ancestor(prev_id, first_height)
                    .map(|id| index.get(id).time())
                    .unwrap_or_else(|| last.time());
                let timespan = params.target_timespan;
                let actual = (last.time() - first).clamp(timespan / 4, timespan * 4);

                // Held since the window's first block, so this is the
                // window's starting target
                let window_target = last.bits();
                // A longer chain is a harder target, so fast windows scale it
                // up by timespan/actual (inverse of a hash-bound target)
                let next = window_target
                    .scale(timespan as u64, actual as u64)
                    .clamp_to(CompactTarget::floor(params), limit);
                log::debug!(
                    "Retarget at height {}: {} -> {} (actual timespan {}s)",
                    height,
                    window_target,
                    next,
                    actual
                );
                next
            }
        }
    }
}

/// Coinbase subsidy for a block at `bits`: `999 COIN / difficulty^2`,
/// rounded down to a whole cent
pub fn block_subsidy(bits: CompactTarget) -> i64 {
    let bits = bits.to_u32() as u128;
    if bits == 0 {
        return 0;
    }
    let numerator = (SUBSIDY_BASE_COINS as u128 * COIN as u128) << (2 * FRACTIONAL_BITS);
    let subsidy = (numerator / (bits * bits)) as i64;
    (subsidy / CENT) * CENT
}
