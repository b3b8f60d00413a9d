//! Chain State Management
//!
//! Owns the block index and decides which chain is active. Headers enter via
//! [`ChainState::accept_header`]; every accepted header that could become the
//! tip joins the candidate set, and [`ChainState::activate_best_chain`] walks
//! the active chain toward the most-work candidate, disconnecting and
//! connecting blocks through a [`ChainConnector`].
//!
//! Precedence between candidates:
//! 1. more cumulative work wins
//! 2. on equal work, the lower sequence id wins (first seen, or precious)
//! 3. on equal sequence id, the lower node id wins
//!
//! A block the connector rejects is marked failed together with its
//! descendants, and selection starts over. A block whose data is missing is
//! parked until [`ChainState::record_block_data`] supplies it.

use crate::consensus::difficulty::DifficultyEngine;
use crate::consensus::params::{ConsensusParams, DeploymentPos};
use crate::consensus::pow::{ChainType, PowError, PowValidator, PrimeChain};
use crate::consensus::target::{CompactTarget, MAX_CHAIN_LENGTH};
use crate::consensus::versionbits::{DeploymentStats, ThresholdState, VersionBitsCache};
use crate::core::block::{BlockError, BlockHeader};
use crate::core::records::{self, PrimeRecord};
use crate::crypto::BlockHash;
use crate::storage::{
    BlockIndex, BlockIndexNode, BlockStatus, CheckpointManager, CheckpointResult, FailureReason,
    IndexError, NodeId,
};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Default `chain_tx_stats` window in seconds (one month)
pub const TX_STATS_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

// =============================================================================
// Errors
// =============================================================================

/// Everything header acceptance and the chain queries can report
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("Malformed header: {0}")]
    MalformedHeader(#[from] BlockError),
    #[error("Unknown parent: {0}")]
    UnknownParent(BlockHash),
    #[error("Duplicate header: {0}")]
    Duplicate(BlockHash),
    #[error("Insufficient proof of work: {0}")]
    InsufficientProof(PowError),
    #[error("Prime chain certificate overflow")]
    CertificateOverflow,
    #[error("Invalid proof of work: {0}")]
    InvalidProof(PowError),
    #[error("Checkpoint mismatch at height {height}: expected {expected}, got {got}")]
    CheckpointMismatch {
        height: u32,
        expected: BlockHash,
        got: BlockHash,
    },
    #[error("Bad target: expected {expected}, got {got}")]
    BadTarget {
        expected: CompactTarget,
        got: CompactTarget,
    },
    #[error("Header time {time} not after median time past {median_time_past}")]
    TimeTooOld { time: i64, median_time_past: i64 },
    #[error("Header time {time} too far in the future (limit {limit})")]
    TimeTooNew { time: i64, limit: i64 },
    #[error("Previous block {0} is invalid")]
    InvalidAncestor(BlockHash),
    #[error("Chain work {work} below minimum {minimum}")]
    BelowMinimumChainWork { work: String, minimum: String },
    #[error("Unknown deployment: {0}")]
    UnknownDeployment(String),
    #[error("Block not found: {0}")]
    BlockNotFound(BlockHash),
    #[error("Block not in active chain: {0}")]
    NotInActiveChain(BlockHash),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Node is shutting down")]
    ShuttingDown,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConsensusError {
    /// Worth submitting again later (parent arrives, clock catches up)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::UnknownParent(_) | ConsensusError::TimeTooNew { .. }
        )
    }

    /// The header can never become valid
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConsensusError::MalformedHeader(_)
                | ConsensusError::InsufficientProof(_)
                | ConsensusError::CertificateOverflow
                | ConsensusError::InvalidProof(_)
                | ConsensusError::CheckpointMismatch { .. }
                | ConsensusError::BadTarget { .. }
                | ConsensusError::TimeTooOld { .. }
                | ConsensusError::InvalidAncestor(_)
        )
    }
}

impl From<PowError> for ConsensusError {
    fn from(e: PowError) -> Self {
        match e {
            PowError::InsufficientProof { .. } => ConsensusError::InsufficientProof(e),
            PowError::CertificateOverflow => ConsensusError::CertificateOverflow,
            other => ConsensusError::InvalidProof(other),
        }
    }
}

impl From<IndexError> for ConsensusError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::UnknownParent(hash) => ConsensusError::UnknownParent(hash),
            IndexError::Duplicate(hash) => ConsensusError::Duplicate(hash),
            other => ConsensusError::InvalidParameter(other.to_string()),
        }
    }
}

// =============================================================================
// State collaborator
// =============================================================================

/// Per-block flags handed to the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectContext {
    pub height: u32,
    /// The block lies under the assumed-valid block: scripts may be skipped
    pub skip_script_checks: bool,
}

/// Connector failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The block is invalid; it and its descendants are marked failed
    #[error("Block rejected: {0}")]
    Invalid(String),
    /// The block body is not available yet
    #[error("Block data missing")]
    MissingData,
}

/// Applies and reverts blocks against the transaction state
pub trait ChainConnector: Send + Sync {
    fn connect(
        &mut self,
        hash: &BlockHash,
        header: &BlockHeader,
        ctx: &ConnectContext,
    ) -> Result<(), ConnectError>;

    fn disconnect(&mut self, hash: &BlockHash, header: &BlockHeader);
}

/// Connector accepting every block, for header-only operation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConnector;

impl ChainConnector for NoopConnector {
    fn connect(&mut self, _: &BlockHash, _: &BlockHeader, _: &ConnectContext) -> Result<(), ConnectError> {
        Ok(())
    }

    fn disconnect(&mut self, _: &BlockHash, _: &BlockHeader) {}
}

// =============================================================================
// Snapshots
// =============================================================================

/// Result of offering a header
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// Linked into the tree; `activated` when the active tip changed
    Linked {
        hash: BlockHash,
        height: u32,
        activated: bool,
    },
    /// Linked but not selectable yet
    Deferred {
        hash: BlockHash,
        height: u32,
        reason: ConsensusError,
    },
    /// Stored as failed so it is never re-validated
    Rejected { hash: BlockHash, error: ConsensusError },
}

impl AcceptOutcome {
    pub fn hash(&self) -> BlockHash {
        match self {
            AcceptOutcome::Linked { hash, .. }
            | AcceptOutcome::Deferred { hash, .. }
            | AcceptOutcome::Rejected { hash, .. } => *hash,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, AcceptOutcome::Rejected { .. })
    }
}

/// Active tip summary, published on every tip change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipInfo {
    pub hash: BlockHash,
    pub height: u32,
}

/// Classification of a chain tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TipStatus {
    Active,
    Invalid,
    HeadersOnly,
    ValidFork,
    ValidHeaders,
    Unknown,
}

impl TipStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TipStatus::Active => "active",
            TipStatus::Invalid => "invalid",
            TipStatus::HeadersOnly => "headers-only",
            TipStatus::ValidFork => "valid-fork",
            TipStatus::ValidHeaders => "valid-headers",
            TipStatus::Unknown => "unknown",
        }
    }
}

/// A leaf of the block tree, or the active tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
    /// Blocks between the tip and the active chain
    pub branch_len: u32,
    /// Cumulative work, hex
    pub chain_work: String,
    pub status: TipStatus,
}

/// Header details with chain context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub hash: BlockHash,
    pub height: u32,
    /// Depth in the active chain, -1 off it
    pub confirmations: i64,
    pub version: i32,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub median_time: i64,
    pub nonce: u32,
    pub bits: CompactTarget,
    pub difficulty: f64,
    pub prime_chain_multiplier: String,
    pub prime_chain: Option<String>,
    pub prime_origin: String,
    pub chain_work: String,
    pub work_transition: u64,
    pub tx_count: u32,
    pub chain_tx: u64,
    pub failure: Option<FailureReason>,
    pub previous_block: Option<BlockHash>,
    pub next_block: Option<BlockHash>,
}

/// Transaction and data rates over a window of the active chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTxStats {
    pub time: u32,
    pub tx_count: u64,
    pub data_size: u64,
    pub window_final_block_hash: BlockHash,
    pub window_block_count: u32,
    pub window_tx_count: Option<u64>,
    pub window_data_size: Option<u64>,
    pub window_interval: Option<i64>,
    pub tx_rate: Option<f64>,
    pub data_rate: Option<f64>,
}

// =============================================================================
// Candidate ordering
// =============================================================================

/// Candidate set entry; the greatest entry is the best chain
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    work: BigUint,
    sequence_id: i64,
    id: NodeId,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.work
            .cmp(&other.work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Chain State
// =============================================================================

/// Block tree plus the active chain
pub struct ChainState {
    params: Arc<ConsensusParams>,
    index: BlockIndex,
    /// Active chain by height; never empty
    active: Vec<NodeId>,
    candidates: BTreeSet<Candidate>,
    awaiting_data: HashSet<NodeId>,
    checkpoints: CheckpointManager,
    difficulty: DifficultyEngine,
    versionbits: VersionBitsCache,
    connector: Box<dyn ChainConnector>,
    /// Most-work header that is not failed
    best_header: NodeId,
    /// Next sequence id handed out by `mark_precious`
    precious_sequence: i64,
    last_precious_work: BigUint,
}

impl ChainState {
    /// Header-only chain state
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self::with_connector(params, Box::new(NoopConnector))
    }

    pub fn with_connector(params: Arc<ConsensusParams>, connector: Box<dyn ChainConnector>) -> Self {
        let index = BlockIndex::with_genesis(params.target_min_length, params.genesis.clone());
        let genesis = NodeId(0);
        let mut candidates = BTreeSet::new();
        candidates.insert(Candidate {
            work: index.get(genesis).chain_work.clone(),
            sequence_id: index.get(genesis).sequence_id,
            id: genesis,
        });
        log::info!(
            "Chain state initialized for {} at genesis {}",
            params.network,
            params.genesis_hash
        );

        Self {
            checkpoints: CheckpointManager::from_params(&params),
            difficulty: DifficultyEngine::new(params.clone()),
            versionbits: VersionBitsCache::new(),
            params,
            index,
            active: vec![genesis],
            candidates,
            awaiting_data: HashSet::new(),
            connector,
            best_header: genesis,
            precious_sequence: -1,
            last_precious_work: BigUint::zero(),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    fn tip_id(&self) -> NodeId {
        self.active[self.active.len() - 1]
    }

    fn is_active(&self, id: NodeId) -> bool {
        let height = self.index.get(id).height as usize;
        self.active.get(height) == Some(&id)
    }

    fn lookup(&self, hash: &BlockHash) -> Result<NodeId, ConsensusError> {
        self.index
            .lookup(hash)
            .ok_or(ConsensusError::BlockNotFound(*hash))
    }

    // =========================================================================
    // Header acceptance
    // =========================================================================

    /// Cheap checks that need no proof-of-work evaluation
    pub fn precheck(&self, header: &BlockHeader) -> Result<(), ConsensusError> {
        let hash = header.hash();
        if self.index.contains(&hash) {
            return Err(ConsensusError::Duplicate(hash));
        }
        if !self.index.contains(&header.prev_block) {
            return Err(ConsensusError::UnknownParent(header.prev_block));
        }
        Ok(())
    }

    /// Check the certificate with `validator`, then accept the header
    pub fn process_header(
        &mut self,
        header: BlockHeader,
        validator: &PowValidator,
        now: i64,
    ) -> Result<AcceptOutcome, ConsensusError> {
        self.precheck(&header)?;
        let pow = validator.verify(&header.pow_hash(), header.bits, &header.prime_chain_multiplier);
        self.accept_header(header, pow, now)
    }

    /// Link a header whose proof of work was already evaluated.
    ///
    /// Errors leave the index untouched. Headers failing their own checks are
    /// stored failed and reported as [`AcceptOutcome::Rejected`].
    pub fn accept_header(
        &mut self,
        header: BlockHeader,
        pow: Result<PrimeChain, PowError>,
        now: i64,
    ) -> Result<AcceptOutcome, ConsensusError> {
        self.precheck(&header)?;
        let hash = header.hash();
        let prev_hash = header.prev_block;
        let parent = self.lookup(&prev_hash)?;
        let height = self.index.get(parent).height + 1;
        let parent_failed = self.index.get(parent).status.is_failed();
        let time = header.block_time();

        let limit = now + self.params.max_future_block_time;
        if time > limit {
            log::debug!("Header {} time {} beyond {}", hash, time, limit);
            return Err(ConsensusError::TimeTooNew { time, limit });
        }

        let (prime_chain, mut failure) = match pow {
            Ok(chain) => (Some(chain), None),
            Err(e) => (None, Some((FailureReason::InvalidProof(e.to_string()), ConsensusError::from(e)))),
        };
        if failure.is_none() {
            let expected = self.difficulty.next_required(&self.index, Some(parent));
            if header.bits != expected {
                let got = header.bits;
                failure = Some((
                    FailureReason::BadTarget { expected, got },
                    ConsensusError::BadTarget { expected, got },
                ));
            }
        }
        if failure.is_none() {
            let median_time_past = self.index.median_time_past(parent);
            if time <= median_time_past {
                failure = Some((
                    FailureReason::TimeTooOld,
                    ConsensusError::TimeTooOld { time, median_time_past },
                ));
            }
        }
        if failure.is_none() {
            if let CheckpointResult::Mismatch { expected, got } = self.checkpoints.verify_checkpoint(height, &hash) {
                failure = Some((
                    FailureReason::CheckpointMismatch,
                    ConsensusError::CheckpointMismatch { height, expected, got },
                ));
            }
        }

        let id = self.index.insert(header, prime_chain)?;

        if let Some((reason, error)) = failure {
            self.index.mark_failed(id, reason);
            log::warn!("Rejected header {} at height {}: {}", hash, height, error);
            return Ok(AcceptOutcome::Rejected { hash, error });
        }

        self.index.raise_validity(id, BlockStatus::VALID_TREE);
        if parent_failed {
            let node = self.index.get_mut(id);
            node.status.insert(BlockStatus::FAILED_CHILD);
            node.failure = Some(FailureReason::AncestorFailed);
            log::warn!("Rejected header {} at height {}: parent invalid", hash, height);
            return Ok(AcceptOutcome::Rejected {
                hash,
                error: ConsensusError::InvalidAncestor(prev_hash),
            });
        }

        if self.index.get(id).chain_work > self.index.get(self.best_header).chain_work {
            self.best_header = id;
        }

        let work = &self.index.get(id).chain_work;
        if *work < self.params.minimum_chain_work {
            let reason = ConsensusError::BelowMinimumChainWork {
                work: format!("{:x}", work),
                minimum: format!("{:x}", self.params.minimum_chain_work),
            };
            log::debug!("Header {} at height {} deferred: {}", hash, height, reason);
            return Ok(AcceptOutcome::Deferred { hash, height, reason });
        }

        log::debug!("Accepted header {} at height {}", hash, height);
        self.add_candidate(id);
        let activated = self.activate_best_chain();
        Ok(AcceptOutcome::Linked { hash, height, activated })
    }

    // =========================================================================
    // Chain selection
    // =========================================================================

    fn candidate(&self, id: NodeId) -> Candidate {
        let node = self.index.get(id);
        Candidate {
            work: node.chain_work.clone(),
            sequence_id: node.sequence_id,
            id,
        }
    }

    /// Tree-valid, not failed, and not waiting for data
    fn is_usable(&self, id: NodeId) -> bool {
        self.index.get(id).is_tree_valid() && !self.awaiting_data.contains(&id)
    }

    fn meets_minimum_work(&self, id: NodeId) -> bool {
        Some(id) == self.index.genesis() || self.index.get(id).chain_work >= self.params.minimum_chain_work
    }

    fn add_candidate(&mut self, id: NodeId) {
        if !self.is_usable(id) || !self.meets_minimum_work(id) {
            return;
        }
        if self.index.get(id).chain_work >= self.index.get(self.tip_id()).chain_work {
            let key = self.candidate(id);
            self.candidates.insert(key);
        }
    }

    fn rebuild_candidates(&mut self) {
        self.candidates.clear();
        let tip = self.candidate(self.tip_id());
        self.candidates.insert(tip);
        let ids: Vec<NodeId> = self.index.ids().collect();
        for id in ids {
            self.add_candidate(id);
        }
    }

    fn refresh_best_header(&mut self) {
        let mut best = self.tip_id();
        for id in self.index.ids() {
            let node = self.index.get(id);
            if !node.status.is_failed() && node.chain_work > self.index.get(best).chain_work {
                best = id;
            }
        }
        self.best_header = best;
    }

    /// Every node between `id` and the active chain is usable
    fn path_is_usable(&self, id: NodeId) -> bool {
        let mut walk = id;
        while !self.is_active(walk) {
            if !self.is_usable(walk) {
                return false;
            }
            match self.index.get(walk).parent {
                Some(parent) => walk = parent,
                None => return false,
            }
        }
        true
    }

    /// Best candidate, dropping entries that can no longer be reached
    fn find_best_candidate(&mut self) -> NodeId {
        while let Some(best) = self.candidates.iter().next_back().cloned() {
            if self.is_active(best.id) || self.path_is_usable(best.id) {
                return best.id;
            }
            self.candidates.remove(&best);
        }
        self.tip_id()
    }

    /// Move the active chain to the best candidate. Returns whether the tip
    /// changed.
    pub fn activate_best_chain(&mut self) -> bool {
        let start = self.tip_id();
        loop {
            let best = self.find_best_candidate();
            if best == self.tip_id() {
                break;
            }
            if let Err(failed) = self.reorganize_to(best) {
                log::debug!("Reorganization toward {} stopped at {}", self.index.get(best).hash, failed);
            }
        }

        let tip = self.tip_id();
        let tip_work = self.index.get(tip).chain_work.clone();
        self.candidates.retain(|c| c.work >= tip_work);

        let changed = tip != start;
        if changed {
            let node = self.index.get(tip);
            log::info!(
                "New best tip {} at height {} (work {:x})",
                node.hash,
                node.height,
                node.chain_work
            );
        }
        changed
    }

    fn disconnect_tip(&mut self) {
        let id = self.tip_id();
        let node = self.index.get(id);
        self.connector.disconnect(&node.hash, &node.header);
        log::debug!("Disconnected {} at height {}", node.hash, node.height);
        self.active.pop();
    }

    fn skip_script_checks(&self, id: NodeId) -> bool {
        let assumed = match self.params.assume_valid.and_then(|h| self.index.lookup(&h)) {
            Some(assumed) => assumed,
            None => return false,
        };
        self.index.is_ancestor(id, assumed)
            && self.index.is_ancestor(assumed, self.best_header)
            && self.index.get(self.best_header).chain_work >= self.params.minimum_chain_work
    }

    /// Walk the active chain to `target`. On failure the block that failed is
    /// returned and the chain is left wherever connecting stopped.
    fn reorganize_to(&mut self, target: NodeId) -> Result<(), BlockHash> {
        let fork = self.index.last_common_ancestor(self.tip_id(), target);
        let fork_height = self.index.get(fork).height;
        let disconnects = self.index.get(self.tip_id()).height - fork_height;
        if disconnects > 0 {
            log::info!(
                "Reorganizing: {} blocks back to {} at height {}",
                disconnects,
                self.index.get(fork).hash,
                fork_height
            );
        }
        while self.tip_id() != fork {
            self.disconnect_tip();
        }

        let mut path = Vec::new();
        let mut walk = target;
        while walk != fork {
            path.push(walk);
            match self.index.get(walk).parent {
                Some(parent) => walk = parent,
                None => break,
            }
        }

        for id in path.into_iter().rev() {
            let ctx = ConnectContext {
                height: self.index.get(id).height,
                skip_script_checks: self.skip_script_checks(id),
            };
            let node = self.index.get(id);
            let hash = node.hash;
            match self.connector.connect(&node.hash, &node.header, &ctx) {
                Ok(()) => {
                    self.index.raise_validity(id, BlockStatus::VALID_SCRIPTS);
                    self.active.push(id);
                }
                Err(ConnectError::Invalid(reason)) => {
                    log::warn!("Block {} failed to connect: {}", hash, reason);
                    let touched = self.index.mark_failed(id, FailureReason::ConnectFailed(reason));
                    self.candidates
                        .retain(|c| c.id != id && !touched.contains(&c.id));
                    if self.index.is_ancestor(id, self.best_header) {
                        self.refresh_best_header();
                    }
                    return Err(hash);
                }
                Err(ConnectError::MissingData) => {
                    log::debug!("Block {} waiting for data", hash);
                    self.awaiting_data.insert(id);
                    let descendants = self.index.descendants(id);
                    self.candidates
                        .retain(|c| c.id != id && !descendants.contains(&c.id));
                    return Err(hash);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Operator controls
    // =========================================================================

    /// Mark a block invalid, rewinding the active chain if needed
    pub fn invalidate(&mut self, hash: &BlockHash) -> Result<(), ConsensusError> {
        let id = self.lookup(hash)?;
        if Some(id) == self.index.genesis() {
            return Err(ConsensusError::InvalidParameter(
                "cannot invalidate the genesis block".to_string(),
            ));
        }

        let touched = self.index.mark_failed(id, FailureReason::Invalidated);
        log::info!("Invalidated {} and {} descendants", hash, touched.len());
        if self.is_active(id) {
            while self.tip_id() != id {
                self.disconnect_tip();
            }
            self.disconnect_tip();
        }

        self.refresh_best_header();
        self.rebuild_candidates();
        self.activate_best_chain();
        Ok(())
    }

    /// Clear failures from a block and its ancestors.
    ///
    /// Failures of a header's own checks stay, and so does everything below
    /// them. Descendants of the block keep their flags.
    pub fn reconsider(&mut self, hash: &BlockHash) -> Result<(), ConsensusError> {
        let id = self.lookup(hash)?;
        let height = self.index.get(id).height;

        let mut blocked = false;
        for h in 0..=height {
            let current = match self.index.ancestor(id, h) {
                Some(current) => current,
                None => continue,
            };
            let node = self.index.get(current);
            if node.failure.as_ref().is_some_and(|f| f.is_permanent()) {
                blocked = true;
            }
            if blocked || !node.status.is_failed() {
                continue;
            }
            self.index.clear_failure(current);
        }
        log::info!("Reconsidered {}", hash);

        self.refresh_best_header();
        self.rebuild_candidates();
        self.activate_best_chain();
        Ok(())
    }

    /// Prefer a block over others of equal work, as if seen first
    pub fn mark_precious(&mut self, hash: &BlockHash) -> Result<(), ConsensusError> {
        let id = self.lookup(hash)?;
        let tip_work = self.index.get(self.tip_id()).chain_work.clone();
        if self.index.get(id).chain_work < tip_work {
            return Ok(());
        }
        if tip_work > self.last_precious_work {
            self.precious_sequence = -1;
        }
        self.last_precious_work = tip_work;

        let key = self.candidate(id);
        self.candidates.remove(&key);
        self.index.set_sequence(id, self.precious_sequence);
        self.precious_sequence = self.precious_sequence.saturating_sub(1);
        log::debug!("Marked {} precious", hash);

        self.add_candidate(id);
        self.activate_best_chain();
        Ok(())
    }

    /// Supply the body summary of a block. Resumes activation if the block
    /// was holding it up. Returns whether the tip changed.
    pub fn record_block_data(&mut self, hash: &BlockHash, tx_count: u32, size: u64) -> Result<bool, ConsensusError> {
        let id = self.lookup(hash)?;
        let linked = self.index.record_block_data(id, tx_count, size)?;
        log::debug!("Recorded data for {} ({} nodes linked)", hash, linked.len());
        if !self.awaiting_data.remove(&id) {
            return Ok(false);
        }
        self.rebuild_candidates();
        Ok(self.activate_best_chain())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn tip(&self) -> TipInfo {
        let node = self.index.get(self.tip_id());
        TipInfo {
            hash: node.hash,
            height: node.height,
        }
    }

    pub fn height(&self) -> u32 {
        self.index.get(self.tip_id()).height
    }

    pub fn best_header(&self) -> TipInfo {
        let node = self.index.get(self.best_header);
        TipInfo {
            hash: node.hash,
            height: node.height,
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.contains(hash)
    }

    pub fn node(&self, hash: &BlockHash) -> Option<&BlockIndexNode> {
        self.index.node_by_hash(hash)
    }

    /// Hash of the active block at `height`
    pub fn active_hash(&self, height: u32) -> Option<BlockHash> {
        self.active
            .get(height as usize)
            .map(|id| self.index.get(*id).hash)
    }

    pub fn header_info(&self, hash: &BlockHash) -> Option<HeaderInfo> {
        let id = self.index.lookup(hash)?;
        let node = self.index.get(id);
        let active = self.is_active(id);
        let confirmations = if active {
            (self.height() - node.height) as i64 + 1
        } else {
            -1
        };
        let next_block = if active {
            self.active_hash(node.height + 1)
        } else {
            None
        };

        Some(HeaderInfo {
            hash: node.hash,
            height: node.height,
            confirmations,
            version: node.header.version,
            merkle_root: node.header.merkle_root,
            time: node.header.time,
            median_time: self.index.median_time_past(id),
            nonce: node.header.nonce,
            bits: node.bits(),
            difficulty: node.bits().difficulty(),
            prime_chain_multiplier: node.header.prime_chain_multiplier.to_string(),
            prime_chain: node.prime_chain.map(|c| c.name()),
            prime_origin: node.header.prime_origin().to_string(),
            chain_work: format!("{:064x}", node.chain_work),
            work_transition: node.work_transition,
            tx_count: node.tx_count,
            chain_tx: node.chain_tx,
            failure: node.failure.clone(),
            previous_block: node.parent.map(|p| self.index.get(p).hash),
            next_block,
        })
    }

    /// Ancestor of `hash` at `height`
    pub fn ancestor_at_height(&self, hash: &BlockHash, height: u32) -> Result<BlockHash, ConsensusError> {
        let id = self.lookup(hash)?;
        self.index
            .ancestor(id, height)
            .map(|a| self.index.get(a).hash)
            .ok_or_else(|| {
                ConsensusError::InvalidParameter(format!("height {} above block {}", height, hash))
            })
    }

    /// Every leaf of the tree plus the active tip
    pub fn chain_tips(&self) -> Vec<ChainTip> {
        let tip = self.tip_id();
        let mut ids = self.index.leaves();
        if !ids.contains(&tip) {
            ids.push(tip);
        }

        let mut tips: Vec<ChainTip> = ids
            .into_iter()
            .map(|id| {
                let node = self.index.get(id);
                let fork = self.index.last_common_ancestor(tip, id);
                let status = if id == tip {
                    TipStatus::Active
                } else if node.status.is_failed() {
                    TipStatus::Invalid
                } else if node.chain_tx == 0 {
                    TipStatus::HeadersOnly
                } else if node.status.contains(BlockStatus::VALID_SCRIPTS) {
                    TipStatus::ValidFork
                } else if node.status.contains(BlockStatus::VALID_TREE) {
                    TipStatus::ValidHeaders
                } else {
                    TipStatus::Unknown
                };
                ChainTip {
                    hash: node.hash,
                    height: node.height,
                    branch_len: node.height - self.index.get(fork).height,
                    chain_work: format!("{:064x}", node.chain_work),
                    status,
                }
            })
            .collect();
        tips.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.hash.cmp(&b.hash)));
        tips
    }

    /// Difficulty of the block `hash`, or of the active tip
    pub fn difficulty_of(&self, hash: Option<&BlockHash>) -> Result<f64, ConsensusError> {
        let id = match hash {
            Some(hash) => self.lookup(hash)?,
            None => self.tip_id(),
        };
        Ok(self.index.get(id).bits().difficulty())
    }

    /// Target required of the next block on `hash`, or on the active tip
    pub fn next_target(&self, hash: Option<&BlockHash>) -> Result<CompactTarget, ConsensusError> {
        let id = match hash {
            Some(hash) => self.lookup(hash)?,
            None => self.tip_id(),
        };
        Ok(self.difficulty.next_required(&self.index, Some(id)))
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    fn deployment_context(
        &self,
        name: &str,
        hash: Option<&BlockHash>,
    ) -> Result<(DeploymentPos, NodeId), ConsensusError> {
        let pos = DeploymentPos::from_name(name)
            .ok_or_else(|| ConsensusError::UnknownDeployment(name.to_string()))?;
        let id = match hash {
            Some(hash) => self.lookup(hash)?,
            None => self.tip_id(),
        };
        Ok((pos, id))
    }

    /// Deployment state for the block after `hash` (default: the tip)
    pub fn version_bits_state(&mut self, name: &str, hash: Option<&BlockHash>) -> Result<ThresholdState, ConsensusError> {
        let (pos, id) = self.deployment_context(name, hash)?;
        Ok(self.versionbits.state(&self.index, &self.params, Some(id), pos))
    }

    pub fn version_bits_since(&mut self, name: &str, hash: Option<&BlockHash>) -> Result<u32, ConsensusError> {
        let (pos, id) = self.deployment_context(name, hash)?;
        Ok(self.versionbits.since_height(&self.index, &self.params, Some(id), pos))
    }

    /// Signalling progress of the current window, only while `Started`
    pub fn version_bits_statistics(
        &mut self,
        name: &str,
        hash: Option<&BlockHash>,
    ) -> Result<Option<DeploymentStats>, ConsensusError> {
        let (pos, id) = self.deployment_context(name, hash)?;
        if self.versionbits.state(&self.index, &self.params, Some(id), pos) != ThresholdState::Started {
            return Ok(None);
        }
        Ok(Some(self.versionbits.statistics(&self.index, &self.params, Some(id), pos)))
    }

    /// Version a miner should put in the next block on the active tip
    pub fn compute_block_version(&mut self) -> i32 {
        let tip = self.tip_id();
        self.versionbits
            .compute_block_version(&self.index, &self.params, Some(tip))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Transaction and data rates over the `window` blocks ending at `hash`
    /// (default: the active tip)
    pub fn chain_tx_stats(&self, window: Option<u32>, hash: Option<&BlockHash>) -> Result<ChainTxStats, ConsensusError> {
        let id = match hash {
            Some(hash) => {
                let id = self.lookup(hash)?;
                if !self.is_active(id) {
                    return Err(ConsensusError::NotInActiveChain(*hash));
                }
                id
            }
            None => self.tip_id(),
        };
        let node = self.index.get(id);

        let window = match window {
            Some(window) => {
                if window > 0 && window >= node.height {
                    return Err(ConsensusError::InvalidParameter(format!(
                        "window {} must be below the block height {}",
                        window, node.height
                    )));
                }
                window
            }
            None => {
                let default = (TX_STATS_WINDOW_SECS / self.params.target_spacing.max(1)) as u32;
                default.min(node.height.saturating_sub(1))
            }
        };

        let mut stats = ChainTxStats {
            time: node.header.time,
            tx_count: node.chain_tx,
            data_size: node.chain_data_size,
            window_final_block_hash: node.hash,
            window_block_count: window,
            window_tx_count: None,
            window_data_size: None,
            window_interval: None,
            tx_rate: None,
            data_rate: None,
        };
        if window == 0 {
            return Ok(stats);
        }

        let start = match self.index.ancestor(id, node.height - window) {
            Some(start) => start,
            None => return Ok(stats),
        };
        let past = self.index.get(start);
        let interval = self.index.median_time_past(id) - self.index.median_time_past(start);
        let tx_count = node.chain_tx.saturating_sub(past.chain_tx);
        let data_size = node.chain_data_size.saturating_sub(past.chain_data_size);

        stats.window_tx_count = Some(tx_count);
        stats.window_data_size = Some(data_size);
        stats.window_interval = Some(interval);
        if interval > 0 {
            stats.tx_rate = Some(tx_count as f64 / interval as f64);
            stats.data_rate = Some(data_size as f64 / interval as f64);
        }
        Ok(stats)
    }

    fn check_chain_length(length: u32) -> Result<(), ConsensusError> {
        if length == 0 || length > MAX_CHAIN_LENGTH {
            return Err(ConsensusError::InvalidParameter(format!(
                "chain length {} outside 1..={}",
                length, MAX_CHAIN_LENGTH
            )));
        }
        Ok(())
    }

    /// Successive record origins among active blocks with chains of
    /// `length`, optionally of one type
    pub fn prime_records(&self, length: u32, chain_type: Option<ChainType>) -> Result<Vec<PrimeRecord>, ConsensusError> {
        Self::check_chain_length(length)?;
        let nodes = self.active.iter().map(|id| self.index.get(*id));
        Ok(records::prime_records(nodes, length, chain_type))
    }

    /// Largest origins among active blocks with chains of `length`
    pub fn top_primes(&self, length: u32, chain_type: Option<ChainType>) -> Result<Vec<PrimeRecord>, ConsensusError> {
        Self::check_chain_length(length)?;
        let nodes = self.active.iter().map(|id| self.index.get(*id));
        Ok(records::top_primes(nodes, length, chain_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::NetworkKind;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const NOW: i64 = 2_000_000_000;

    fn regtest() -> ConsensusParams {
        ConsensusParams::for_network(NetworkKind::Regtest).unwrap()
    }

    fn chain_ok(bits: CompactTarget) -> Result<PrimeChain, PowError> {
        Ok(PrimeChain::new(ChainType::Cunningham1, bits))
    }

    /// Header on `parent` one minute later, distinguished by `salt`
    fn child(parent: &BlockHeader, salt: u32) -> BlockHeader {
        BlockHeader {
            version: 2,
            prev_block: parent.hash(),
            merkle_root: BlockHash::of(&salt.to_le_bytes()),
            time: parent.time + 60,
            bits: parent.bits,
            nonce: salt,
            prime_chain_multiplier: BigUint::from(2u32),
        }
    }

    /// `count` headers built on `parent`
    fn branch(parent: &BlockHeader, count: usize, salt: u32) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(count);
        let mut prev = parent.clone();
        for i in 0..count {
            let header = child(&prev, salt * 1000 + i as u32);
            headers.push(header.clone());
            prev = header;
        }
        headers
    }

    fn accept(state: &mut ChainState, header: &BlockHeader) -> AcceptOutcome {
        state
            .accept_header(header.clone(), chain_ok(header.bits), NOW)
            .unwrap()
    }

    fn accept_all(state: &mut ChainState, headers: &[BlockHeader]) {
        for header in headers {
            accept(state, header);
        }
    }

    /// Connector recording calls and failing on demand
    #[derive(Clone, Default)]
    struct RecordingConnector {
        log: Arc<Mutex<Vec<String>>>,
        invalid: Arc<Mutex<HashSet<BlockHash>>>,
        missing: Arc<Mutex<HashSet<BlockHash>>>,
        skipped: Arc<Mutex<HashMap<BlockHash, bool>>>,
    }

    impl ChainConnector for RecordingConnector {
        fn connect(&mut self, hash: &BlockHash, _: &BlockHeader, ctx: &ConnectContext) -> Result<(), ConnectError> {
            if self.invalid.lock().unwrap().contains(hash) {
                return Err(ConnectError::Invalid("bad script".to_string()));
            }
            if self.missing.lock().unwrap().contains(hash) {
                return Err(ConnectError::MissingData);
            }
            self.skipped.lock().unwrap().insert(*hash, ctx.skip_script_checks);
            self.log.lock().unwrap().push(format!("+{}", ctx.height));
            Ok(())
        }

        fn disconnect(&mut self, hash: &BlockHash, _: &BlockHeader) {
            self.log.lock().unwrap().push(format!("-{}", &hash.to_hex()[..8]));
        }
    }

    fn recording(params: ConsensusParams) -> (ChainState, RecordingConnector) {
        let connector = RecordingConnector::default();
        let state = ChainState::with_connector(Arc::new(params), Box::new(connector.clone()));
        (state, connector)
    }

    #[test]
    fn test_genesis_state() {
        let params = regtest();
        let state = ChainState::new(Arc::new(params.clone()));
        assert_eq!(state.tip().hash, params.genesis_hash);
        assert_eq!(state.height(), 0);
        let tips = state.chain_tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].status, TipStatus::Active);
        assert_eq!(tips[0].branch_len, 0);
    }

    #[test]
    fn test_extends_active_chain() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 5, 1);
        for (i, header) in headers.iter().enumerate() {
            match accept(&mut state, header) {
                AcceptOutcome::Linked { height, activated, .. } => {
                    assert_eq!(height, i as u32 + 1);
                    assert!(activated);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(state.tip().hash, headers[4].hash());
        assert_eq!(state.active_hash(3), Some(headers[2].hash()));
        let info = state.header_info(&headers[1].hash()).unwrap();
        assert_eq!(info.confirmations, 4);
        assert_eq!(info.next_block, Some(headers[2].hash()));
        assert_eq!(info.prime_chain.as_deref(), Some("1CC01.000000"));
    }

    #[test]
    fn test_unknown_parent_and_duplicate() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 2, 1);

        let err = state
            .accept_header(headers[1].clone(), chain_ok(headers[1].bits), NOW)
            .unwrap_err();
        assert_eq!(err, ConsensusError::UnknownParent(headers[0].hash()));
        assert!(err.is_retryable());

        accept(&mut state, &headers[0]);
        let err = state
            .accept_header(headers[0].clone(), chain_ok(headers[0].bits), NOW)
            .unwrap_err();
        assert_eq!(err, ConsensusError::Duplicate(headers[0].hash()));
        assert_eq!(state.index().len(), 2);
    }

    #[test]
    fn test_reorg_to_longer_fork() {
        let params = regtest();
        let (mut state, connector) = recording(params.clone());
        let main = branch(&params.genesis, 3, 1);
        accept_all(&mut state, &main);
        let fork = branch(&main[0], 3, 2);
        accept_all(&mut state, &fork[..2]);
        // Equal work: the first-seen chain stays
        assert_eq!(state.tip().hash, main[2].hash());

        assert!(matches!(
            accept(&mut state, &fork[2]),
            AcceptOutcome::Linked { activated: true, height: 4, .. }
        ));
        assert_eq!(state.tip().hash, fork[2].hash());
        assert_eq!(state.active_hash(1), Some(main[0].hash()));

        let log = connector.log.lock().unwrap().clone();
        let expected: Vec<String> = vec![
            "+1".into(),
            "+2".into(),
            "+3".into(),
            format!("-{}", &main[2].hash().to_hex()[..8]),
            format!("-{}", &main[1].hash().to_hex()[..8]),
            "+2".into(),
            "+3".into(),
            "+4".into(),
        ];
        assert_eq!(log, expected);
    }

    #[test]
    fn test_selection_ignores_insertion_order() {
        let params = regtest();
        let a = branch(&params.genesis, 4, 1);
        let b = branch(&a[1], 4, 2);
        let c = branch(&b[0], 2, 3);
        let d = branch(&params.genesis, 5, 4);
        let all: Vec<BlockHeader> = [a, b.clone(), c, d].concat();
        let expected = b[3].hash();
        let mut reference: Option<Vec<(BlockHash, BigUint)>> = None;

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut pending = all.clone();
            pending.shuffle(&mut rng);
            let mut state = ChainState::new(Arc::new(params.clone()));
            while !pending.is_empty() {
                let before = pending.len();
                pending.retain(|header| {
                    match state.accept_header(header.clone(), chain_ok(header.bits), NOW) {
                        Ok(_) => false,
                        Err(ConsensusError::UnknownParent(_)) => true,
                        Err(e) => panic!("unexpected error {}", e),
                    }
                });
                assert!(pending.len() < before);
            }
            assert_eq!(state.tip().hash, expected, "seed {}", seed);
            assert_eq!(state.height(), 6);

            let mut work: Vec<(BlockHash, BigUint)> = all
                .iter()
                .map(|h| (h.hash(), state.node(&h.hash()).unwrap().chain_work.clone()))
                .collect();
            work.sort();
            match &reference {
                Some(reference) => assert_eq!(&work, reference),
                None => reference = Some(work),
            }
        }
    }

    #[test]
    fn test_equal_work_siblings_first_seen_wins() {
        let params = regtest();
        let a = child(&params.genesis, 1);
        let x = child(&a, 2);
        let y = child(&a, 3);

        for (first, second) in [(&x, &y), (&y, &x)] {
            let mut state = ChainState::new(Arc::new(params.clone()));
            accept_all(&mut state, &[a.clone(), first.clone(), second.clone()]);
            assert_eq!(state.tip().hash, first.hash());
            assert_eq!(
                state.node(&x.hash()).unwrap().chain_work,
                state.node(&y.hash()).unwrap().chain_work
            );
            // Settled once both are known
            assert!(!state.activate_best_chain());
            assert_eq!(state.tip().hash, first.hash());

            // Invalidating and reconsidering the winner restores it
            state.invalidate(&first.hash()).unwrap();
            assert_eq!(state.tip().hash, second.hash());
            state.reconsider(&first.hash()).unwrap();
            assert_eq!(state.tip().hash, first.hash());

            // More work on the loser moves the tip
            let z = child(second, 4);
            accept(&mut state, &z);
            assert_eq!(state.tip().hash, z.hash());
            assert_eq!(state.ancestor_at_height(&z.hash(), 2).unwrap(), second.hash());
        }
    }

    #[test]
    fn test_reorg_keeps_fork_point() {
        let params = regtest();
        let (mut state, connector) = recording(params.clone());
        let a = child(&params.genesis, 1);
        let b = child(&a, 2);
        let c = child(&a, 3);
        let d = child(&c, 4);
        accept_all(&mut state, &[a.clone(), b.clone(), c.clone(), d.clone()]);

        assert_eq!(state.tip().hash, d.hash());
        assert_eq!(state.ancestor_at_height(&d.hash(), 1).unwrap(), a.hash());
        assert_eq!(state.active_hash(1), Some(a.hash()));
        // A was connected exactly once
        let log = connector.log.lock().unwrap().clone();
        assert_eq!(log.iter().filter(|entry| *entry == "+1").count(), 1);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_checkpoint_mismatch_rejects_branch() {
        let mut params = regtest();
        let honest = branch(&params.genesis, 3, 1);
        params.checkpoints.insert(2, honest[1].hash());
        let mut state = ChainState::new(Arc::new(params.clone()));
        accept_all(&mut state, &honest[..1]);

        let rogue = branch(&honest[0], 3, 2);
        match accept(&mut state, &rogue[0]) {
            AcceptOutcome::Rejected { error, .. } => {
                assert!(matches!(error, ConsensusError::CheckpointMismatch { height: 2, .. }));
                assert!(error.is_permanent());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            accept(&mut state, &rogue[1]),
            AcceptOutcome::Rejected {
                hash: rogue[1].hash(),
                error: ConsensusError::InvalidAncestor(rogue[0].hash()),
            }
        );
        accept(&mut state, &rogue[2]);
        assert_eq!(state.tip().hash, honest[0].hash());

        // Reconsidering cannot lift a checkpoint failure
        state.reconsider(&rogue[2].hash()).unwrap();
        assert_eq!(state.tip().hash, honest[0].hash());
        assert!(state.node(&rogue[2].hash()).unwrap().status.is_failed());

        accept_all(&mut state, &honest[1..]);
        assert_eq!(state.tip().hash, honest[2].hash());
    }

    #[test]
    fn test_invalid_proof_is_stored_failed() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 2, 1);
        let required = headers[0].bits;
        let pow = Err(PowError::InsufficientProof {
            found: PrimeChain::new(ChainType::BiTwin, CompactTarget(0)),
            required,
        });

        match state.accept_header(headers[0].clone(), pow, NOW).unwrap() {
            AcceptOutcome::Rejected { error, .. } => {
                assert!(matches!(error, ConsensusError::InsufficientProof(_)))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let node = state.node(&headers[0].hash()).unwrap();
        assert!(node.status.contains(BlockStatus::FAILED_VALID));
        assert!(matches!(node.failure, Some(FailureReason::InvalidProof(_))));

        // Offering it again is a duplicate, never a re-validation
        assert_eq!(
            state.accept_header(headers[0].clone(), chain_ok(required), NOW),
            Err(ConsensusError::Duplicate(headers[0].hash()))
        );
        accept(&mut state, &headers[1]);
        let node = state.node(&headers[1].hash()).unwrap();
        assert!(node.status.contains(BlockStatus::FAILED_CHILD));
        assert_eq!(state.height(), 0);
    }

    #[test]
    fn test_bad_target() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let mut header = child(&params.genesis, 1);
        header.bits = CompactTarget::from_length(2);
        match accept(&mut state, &header) {
            AcceptOutcome::Rejected { error, .. } => assert_eq!(
                error,
                ConsensusError::BadTarget {
                    expected: CompactTarget::from_length(1),
                    got: CompactTarget::from_length(2),
                }
            ),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_header_time_bounds() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));

        let mut old = child(&params.genesis, 1);
        old.time = params.genesis.time;
        match accept(&mut state, &old) {
            AcceptOutcome::Rejected { error, .. } => {
                assert!(matches!(error, ConsensusError::TimeTooOld { .. }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let new = child(&params.genesis, 2);
        let now = new.time as i64 - params.max_future_block_time - 1;
        let err = state
            .accept_header(new.clone(), chain_ok(new.bits), now)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::TimeTooNew { .. }));
        assert!(err.is_retryable());
        assert!(!state.contains(&new.hash()));

        // Accepted once the clock catches up
        let now = new.time as i64 - params.max_future_block_time;
        assert!(matches!(
            state.accept_header(new.clone(), chain_ok(new.bits), now),
            Ok(AcceptOutcome::Linked { .. })
        ));
    }

    #[test]
    fn test_invalidate_and_reconsider() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 4, 1);
        accept_all(&mut state, &headers);

        state.invalidate(&headers[1].hash()).unwrap();
        assert_eq!(state.tip().hash, headers[0].hash());
        assert!(state.node(&headers[3].hash()).unwrap().status.is_failed());
        let tips = state.chain_tips();
        assert!(tips
            .iter()
            .any(|t| t.hash == headers[3].hash() && t.status == TipStatus::Invalid));

        // Reconsidering the old tip clears the whole path back
        state.reconsider(&headers[3].hash()).unwrap();
        assert_eq!(state.tip().hash, headers[3].hash());
        assert!(!state.node(&headers[1].hash()).unwrap().status.is_failed());
    }

    #[test]
    fn test_reconsider_leaves_descendants_failed() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 4, 1);
        accept_all(&mut state, &headers);

        state.invalidate(&headers[1].hash()).unwrap();
        state.reconsider(&headers[1].hash()).unwrap();
        assert_eq!(state.tip().hash, headers[1].hash());
        assert!(state.node(&headers[2].hash()).unwrap().status.is_failed());
    }

    #[test]
    fn test_invalidate_switches_to_fork() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let main = branch(&params.genesis, 3, 1);
        let fork = branch(&params.genesis, 2, 2);
        accept_all(&mut state, &main);
        accept_all(&mut state, &fork);
        assert_eq!(state.tip().hash, main[2].hash());

        state.invalidate(&main[0].hash()).unwrap();
        assert_eq!(state.tip().hash, fork[1].hash());
        assert_eq!(state.best_header().hash, fork[1].hash());

        let genesis = params.genesis_hash;
        assert!(matches!(
            state.invalidate(&genesis),
            Err(ConsensusError::InvalidParameter(_))
        ));
        assert_eq!(
            state.invalidate(&BlockHash::of(b"nowhere")),
            Err(ConsensusError::BlockNotFound(BlockHash::of(b"nowhere")))
        );
    }

    #[test]
    fn test_precious_flips_equal_work_tips() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let a = branch(&params.genesis, 1, 1);
        let b = branch(&params.genesis, 1, 2);
        accept_all(&mut state, &a);
        accept_all(&mut state, &b);
        assert_eq!(state.tip().hash, a[0].hash());

        state.mark_precious(&b[0].hash()).unwrap();
        assert_eq!(state.tip().hash, b[0].hash());
        state.mark_precious(&a[0].hash()).unwrap();
        assert_eq!(state.tip().hash, a[0].hash());

        // Blocks with less work are left alone
        state.mark_precious(&params.genesis_hash).unwrap();
        assert_eq!(state.tip().hash, a[0].hash());
    }

    #[test]
    fn test_connect_failure_restores_previous_tip() {
        let params = regtest();
        let (mut state, connector) = recording(params.clone());
        let main = branch(&params.genesis, 2, 1);
        accept_all(&mut state, &main);

        let fork = branch(&params.genesis, 3, 2);
        connector.invalid.lock().unwrap().insert(fork[1].hash());
        accept_all(&mut state, &fork);

        assert_eq!(state.tip().hash, main[1].hash());
        let failed = state.node(&fork[1].hash()).unwrap();
        assert!(matches!(failed.failure, Some(FailureReason::ConnectFailed(_))));
        assert!(state.node(&fork[2].hash()).unwrap().status.is_failed());
        assert!(state
            .node(&fork[0].hash())
            .unwrap()
            .status
            .contains(BlockStatus::VALID_SCRIPTS));
        assert_eq!(state.best_header().hash, main[1].hash());
    }

    #[test]
    fn test_missing_data_parks_until_recorded() {
        let params = regtest();
        let (mut state, connector) = recording(params.clone());
        let headers = branch(&params.genesis, 3, 1);
        connector.missing.lock().unwrap().insert(headers[1].hash());
        accept_all(&mut state, &headers);
        assert_eq!(state.tip().hash, headers[0].hash());

        connector.missing.lock().unwrap().clear();
        assert!(!state.record_block_data(&headers[0].hash(), 3, 500).unwrap());
        assert!(state.record_block_data(&headers[1].hash(), 2, 300).unwrap());
        assert_eq!(state.tip().hash, headers[2].hash());
        assert_eq!(state.node(&headers[1].hash()).unwrap().chain_tx, 6);
    }

    #[test]
    fn test_minimum_chain_work_defers_selection() {
        let mut params = regtest();
        let unit = params.genesis.bits.block_work(params.target_min_length);
        params.minimum_chain_work = unit * 5u32;
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 4, 1);

        for header in &headers[..3] {
            match accept(&mut state, header) {
                AcceptOutcome::Deferred { reason, .. } => {
                    assert!(matches!(reason, ConsensusError::BelowMinimumChainWork { .. }))
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(state.height(), 0);
        assert_eq!(state.best_header().height, 3);

        assert!(matches!(
            accept(&mut state, &headers[3]),
            AcceptOutcome::Linked { activated: true, .. }
        ));
        assert_eq!(state.height(), 4);
    }

    #[test]
    fn test_assume_valid_skips_scripts_below_it() {
        let mut params = regtest();
        let headers = branch(&params.genesis, 4, 1);
        params.assume_valid = Some(headers[2].hash());
        let (mut state, connector) = recording(params);
        // Hold the first block back until every header is known
        connector.missing.lock().unwrap().insert(headers[0].hash());
        accept_all(&mut state, &headers);
        assert_eq!(state.height(), 0);
        connector.missing.lock().unwrap().clear();
        assert!(state.record_block_data(&headers[0].hash(), 1, 100).unwrap());
        assert_eq!(state.height(), 4);

        let skipped = connector.skipped.lock().unwrap().clone();
        assert!(skipped[&headers[0].hash()]);
        assert!(skipped[&headers[2].hash()]);
        assert!(!skipped[&headers[3].hash()]);
    }

    #[test]
    fn test_chain_tip_statuses() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let main = branch(&params.genesis, 3, 1);
        accept_all(&mut state, &main);
        for header in &main {
            state.record_block_data(&header.hash(), 1, 100).unwrap();
        }

        // Headers only
        let short = branch(&main[0], 1, 2);
        accept_all(&mut state, &short);
        // Connected once, then reorganized away
        let old = branch(&main[1], 2, 3);
        accept_all(&mut state, &old);
        for header in &old {
            state.record_block_data(&header.hash(), 1, 100).unwrap();
        }
        let winner = branch(&main[2], 2, 4);
        accept_all(&mut state, &winner);
        // Invalid
        let bad = branch(&main[1], 1, 5);
        accept_all(&mut state, &bad);
        state.invalidate(&bad[0].hash()).unwrap();

        let tips = state.chain_tips();
        let status: HashMap<BlockHash, (TipStatus, u32)> = tips
            .iter()
            .map(|t| (t.hash, (t.status, t.branch_len)))
            .collect();
        assert_eq!(status[&winner[1].hash()], (TipStatus::Active, 0));
        assert_eq!(status[&short[0].hash()], (TipStatus::HeadersOnly, 1));
        assert_eq!(status[&old[1].hash()], (TipStatus::ValidFork, 2));
        assert_eq!(status[&bad[0].hash()], (TipStatus::Invalid, 1));
        assert_eq!(tips[0].hash, winner[1].hash());
    }

    #[test]
    fn test_chain_tx_stats() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let headers = branch(&params.genesis, 20, 1);
        accept_all(&mut state, &headers);
        for header in &headers {
            state.record_block_data(&header.hash(), 2, 1000).unwrap();
        }

        let stats = state.chain_tx_stats(Some(10), None).unwrap();
        assert_eq!(stats.tx_count, 41);
        assert_eq!(stats.window_block_count, 10);
        assert_eq!(stats.window_tx_count, Some(20));
        assert_eq!(stats.window_data_size, Some(10_000));
        assert_eq!(stats.window_interval, Some(600));
        assert_eq!(stats.tx_rate, Some(20.0 / 600.0));

        let default = state.chain_tx_stats(None, None).unwrap();
        assert_eq!(default.window_block_count, 19);

        assert!(matches!(
            state.chain_tx_stats(Some(20), None),
            Err(ConsensusError::InvalidParameter(_))
        ));
        let genesis = state.chain_tx_stats(Some(0), Some(&params.genesis_hash)).unwrap();
        assert_eq!(genesis.window_tx_count, None);

        let fork = branch(&params.genesis, 1, 2);
        accept_all(&mut state, &fork);
        assert_eq!(
            state.chain_tx_stats(None, Some(&fork[0].hash())),
            Err(ConsensusError::NotInActiveChain(fork[0].hash()))
        );
    }

    #[test]
    fn test_prime_records_follow_active_chain() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        let main = branch(&params.genesis, 3, 1);
        accept_all(&mut state, &main);
        let fork = branch(&params.genesis, 1, 2);
        accept_all(&mut state, &fork);

        let top = state.top_primes(1, Some(ChainType::Cunningham1)).unwrap();
        assert_eq!(top.len(), 3);
        assert!(top.iter().all(|r| r.hash != fork[0].hash()));
        assert!(state.top_primes(1, Some(ChainType::BiTwin)).unwrap().is_empty());
        assert!(!state.prime_records(1, None).unwrap().is_empty());
        assert!(matches!(
            state.prime_records(0, None),
            Err(ConsensusError::InvalidParameter(_))
        ));
        assert!(state.top_primes(100, None).is_err());
    }

    #[test]
    fn test_deployment_queries() {
        let params = regtest();
        let mut state = ChainState::new(Arc::new(params.clone()));
        assert_eq!(
            state.version_bits_state("nonsense", None),
            Err(ConsensusError::UnknownDeployment("nonsense".to_string()))
        );
        let state_now = state.version_bits_state("csv", None).unwrap();
        assert_eq!(state_now, ThresholdState::Defined);
        assert_eq!(state.version_bits_since("csv", None).unwrap(), 0);
        assert_eq!(state.version_bits_statistics("csv", None).unwrap(), None);

        // The first window completes at height 79
        let headers = branch(&params.genesis, 79, 1);
        accept_all(&mut state, &headers);
        assert_eq!(state.version_bits_state("csv", None).unwrap(), ThresholdState::Started);
        let stats = state.version_bits_statistics("csv", None).unwrap().unwrap();
        assert_eq!(stats.period, 80);
        assert_eq!(stats.count, 0);
        // Earlier blocks still report no window
        let early = headers[10].hash();
        assert_eq!(state.version_bits_statistics("csv", Some(&early)).unwrap(), None);
    }
}
