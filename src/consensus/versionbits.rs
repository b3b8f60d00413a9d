//! VersionBits (BIP9) deployment state machine
//!
//! Deployment states change only at window boundaries. The state that applies
//! to the block after `prev` is the state computed at the terminal block of
//! the previous window; states per terminal block are memoized per
//! deployment, keyed by that block's hash.

use crate::consensus::params::{ConsensusParams, Deployment, DeploymentPos, ALWAYS_ACTIVE};
use crate::crypto::BlockHash;
use crate::storage::{BlockIndex, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Version prefix of blocks taking part in version bits signalling
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;

/// Mask of the prefix bits
pub const VERSIONBITS_TOP_MASK: u32 = 0xE000_0000;

/// Bits available for deployments
pub const VERSIONBITS_NUM_BITS: u8 = 29;

/// BIP9 deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn name(&self) -> &'static str {
        match self {
            ThresholdState::Defined => "defined",
            ThresholdState::Started => "started",
            ThresholdState::LockedIn => "locked_in",
            ThresholdState::Active => "active",
            ThresholdState::Failed => "failed",
        }
    }
}

impl fmt::Display for ThresholdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signalling progress within the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStats {
    pub period: u32,
    pub threshold: u32,
    /// Blocks of the window seen so far
    pub elapsed: u32,
    /// Signalling blocks among them
    pub count: u32,
    /// Whether the threshold can still be reached in this window
    pub possible: bool,
}

/// Whether a block version signals for `deployment`
pub fn signals(version: i32, deployment: &Deployment) -> bool {
    let version = version as u32;
    (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS && version & deployment.mask() != 0
}

/// Height of the last block of the window before the one containing the
/// block after `height`, or `None` if no window has completed yet
fn window_terminal_height(height: u32, period: u32) -> Option<u32> {
    height.checked_sub((height + 1) % period)
}

/// Memoized deployment states, one cache per deployment
#[derive(Debug, Clone, Default)]
pub struct VersionBitsCache {
    caches: HashMap<DeploymentPos, HashMap<BlockHash, ThresholdState>>,
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.caches.clear();
    }

    /// Number of memoized window states for a deployment
    pub fn cached_windows(&self, pos: DeploymentPos) -> usize {
        self.caches.get(&pos).map(|c| c.len()).unwrap_or(0)
    }

    /// State that applies to the block built on `prev`
    pub fn state(
        &mut self,
        index: &BlockIndex,
        params: &ConsensusParams,
        prev: Option<NodeId>,
        pos: DeploymentPos,
    ) -> ThresholdState {
        let deployment = *params.deployment(pos);
        if deployment.start_time == ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }
        let period = params.miner_confirmation_window.max(1);
        let threshold = params.rule_change_activation_threshold;
        let cache = self.caches.entry(pos).or_default();

        let mut walk = prev.and_then(|id| {
            let height = index.get(id).height;
            window_terminal_height(height, period).and_then(|h| index.ancestor(id, h))
        });

        // Walk back one window at a time to a known state
        let mut to_compute = Vec::new();
        let mut state = ThresholdState::Defined;
        while let Some(current) = walk {
            let node = index.get(current);
            if let Some(cached) = cache.get(&node.hash) {
                state = *cached;
                break;
            }
            if index.median_time_past(current) < deployment.start_time {
                cache.insert(node.hash, ThresholdState::Defined);
                break;
            }
            to_compute.push(current);
            walk = node
                .height
                .checked_sub(period)
                .and_then(|h| index.ancestor(current, h));
        }

        // Evaluate forward, oldest window first
        while let Some(current) = to_compute.pop() {
            let mtp = index.median_time_past(current);
            let next = match state {
                ThresholdState::Defined => {
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else if mtp >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    let count = count_signals(index, current, period, &deployment);
                    if count >= threshold {
                        ThresholdState::LockedIn
                    } else if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                terminal => terminal,
            };
            if next != state {
                log::debug!(
                    "Deployment {} moves {} -> {} after height {}",
                    pos,
                    state,
                    next,
                    index.get(current).height
                );
            }
            cache.insert(index.get(current).hash, next);
            state = next;
        }

        state
    }

    /// First height at which the current state applied
    pub fn since_height(
        &mut self,
        index: &BlockIndex,
        params: &ConsensusParams,
        prev: Option<NodeId>,
        pos: DeploymentPos,
    ) -> u32 {
        if params.deployment(pos).start_time == ALWAYS_ACTIVE {
            return 0;
        }
        let initial = self.state(index, params, prev, pos);
        if initial == ThresholdState::Defined {
            return 0;
        }
        let period = params.miner_confirmation_window.max(1);

        // A non-defined state implies at least one completed window
        let mut current = match prev.and_then(|id| {
            let height = index.get(id).height;
            window_terminal_height(height, period).and_then(|h| index.ancestor(id, h))
        }) {
            Some(id) => id,
            None => return 0,
        };

        loop {
            let parent_window = index
                .get(current)
                .height
                .checked_sub(period)
                .and_then(|h| index.ancestor(current, h));
            match parent_window {
                Some(parent) if self.state(index, params, Some(parent), pos) == initial => {
                    current = parent;
                }
                _ => break,
            }
        }
        index.get(current).height + 1
    }

    /// Signalling statistics for the window containing the block after `prev`
    pub fn statistics(
        &self,
        index: &BlockIndex,
        params: &ConsensusParams,
        prev: Option<NodeId>,
        pos: DeploymentPos,
    ) -> DeploymentStats {
        let period = params.miner_confirmation_window.max(1);
        let threshold = params.rule_change_activation_threshold;
        let mut stats = DeploymentStats {
            period,
            threshold,
            elapsed: 0,
            count: 0,
            possible: false,
        };
        let prev = match prev {
            Some(id) => id,
            None => return stats,
        };

        let height = index.get(prev).height;
        stats.elapsed = match window_terminal_height(height, period) {
            Some(end) => height - end,
            None => height + 1,
        };
        stats.count = count_signals(index, prev, stats.elapsed, params.deployment(pos));
        stats.possible = period.saturating_sub(threshold) >= stats.elapsed - stats.count;
        stats
    }

    /// Version for a new block on `prev`: the top bits plus the bit of every
    /// deployment that is started or locked in
    pub fn compute_block_version(&mut self, index: &BlockIndex, params: &ConsensusParams, prev: Option<NodeId>) -> i32 {
        let mut version = VERSIONBITS_TOP_BITS;
        for (pos, deployment) in params.active_deployments() {
            match self.state(index, params, prev, pos) {
                ThresholdState::Started | ThresholdState::LockedIn => version |= deployment.mask(),
                _ => {}
            }
        }
        version as i32
    }
}

/// Signalling blocks among `count` blocks ending at `from`
fn count_signals(index: &BlockIndex, from: NodeId, count: u32, deployment: &Deployment) -> u32 {
    let mut walk = Some(from);
    let mut signalled = 0;
    for _ in 0..count {
        let current = match walk {
            Some(id) => id,
            None => break,
        };
        let node = index.get(current);
        if signals(node.header.version, deployment) {
            signalled += 1;
        }
        walk = node.parent;
    }
    signalled
}
