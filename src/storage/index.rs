//! Block Index Graph
//!
//! Every header the node has accepted lives here as a [`BlockIndexNode`] in an
//! arena addressed by [`NodeId`]. Nodes are never removed, so ids stay valid
//! for the life of the index. Lookup by identity hash and by parent goes
//! through two side tables:
//! - `by_hash`: identity hash to node
//! - `children`: node to the nodes built on it
//!
//! Ancestor queries use Bitcoin-style skip pointers and run in O(log n).

use crate::consensus::pow::PrimeChain;
use crate::consensus::target::{estimate_work_transition, CompactTarget};
use crate::core::block::BlockHeader;
use crate::crypto::BlockHash;
use bitflags::bitflags;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

/// Number of blocks used for the median time past
pub const MTP_BLOCK_COUNT: usize = 11;

// =============================================================================
// Node identity and status
// =============================================================================

/// Arena index of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Validation progress and failure flags of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockStatus: u32 {
        /// Header parsed, proof of work checked
        const VALID_HEADER = 1 << 0;
        /// Linked to a valid parent with contextual header checks passed
        const VALID_TREE = 1 << 1;
        /// Connected by the state collaborator
        const VALID_SCRIPTS = 1 << 2;
        /// Block body available
        const HAVE_DATA = 1 << 3;
        /// The block itself is invalid
        const FAILED_VALID = 1 << 5;
        /// Descends from an invalid block
        const FAILED_CHILD = 1 << 6;

        const VALID_MASK = Self::VALID_HEADER.bits() | Self::VALID_TREE.bits() | Self::VALID_SCRIPTS.bits();
        const FAILED_MASK = Self::FAILED_VALID.bits() | Self::FAILED_CHILD.bits();
    }
}

impl BlockStatus {
    pub fn is_failed(&self) -> bool {
        self.intersects(BlockStatus::FAILED_MASK)
    }
}

/// Why a node was marked failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum FailureReason {
    /// Certificate rejected by the proof-of-work validator
    InvalidProof(String),
    /// Header target differs from the required target
    BadTarget { expected: CompactTarget, got: CompactTarget },
    /// Header time not after the median time past
    TimeTooOld,
    /// Header hash differs from the pinned checkpoint
    CheckpointMismatch,
    /// Rejected by the state collaborator while connecting
    ConnectFailed(String),
    /// Invalidated by the operator
    Invalidated,
    /// An ancestor failed
    AncestorFailed,
}

impl FailureReason {
    /// Failures of the header itself, which reconsidering can never clear
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FailureReason::InvalidProof(_)
                | FailureReason::BadTarget { .. }
                | FailureReason::TimeTooOld
                | FailureReason::CheckpointMismatch
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InvalidProof(e) => write!(f, "invalid proof of work: {}", e),
            FailureReason::BadTarget { expected, got } => {
                write!(f, "bad target: expected {}, got {}", expected, got)
            }
            FailureReason::TimeTooOld => write!(f, "time not after median time past"),
            FailureReason::CheckpointMismatch => write!(f, "checkpoint mismatch"),
            FailureReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            FailureReason::Invalidated => write!(f, "invalidated"),
            FailureReason::AncestorFailed => write!(f, "ancestor failed"),
        }
    }
}

/// Index errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Unknown parent: {0}")]
    UnknownParent(BlockHash),
    #[error("Duplicate block: {0}")]
    Duplicate(BlockHash),
    #[error("Genesis already indexed")]
    GenesisExists,
    #[error("Genesis must be indexed first")]
    MissingGenesis,
    #[error("Block data must contain at least one transaction")]
    EmptyBlockData,
}

// =============================================================================
// Block Index Node
// =============================================================================

/// One header in the index
#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub hash: BlockHash,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    /// Ancestor at `skip_height(height)`
    pub skip: Option<NodeId>,
    pub height: u32,
    /// Cumulative work from genesis to this node inclusive
    pub chain_work: BigUint,
    pub status: BlockStatus,
    pub failure: Option<FailureReason>,
    /// Transactions in this block, 0 until data is recorded
    pub tx_count: u32,
    /// Transactions from genesis to here, 0 until all of them are known
    pub chain_tx: u64,
    pub data_size: u64,
    pub chain_data_size: u64,
    /// First-seen order; lower wins ties, negative after `mark_precious`
    pub sequence_id: i64,
    /// Chain found by the proof-of-work check
    pub prime_chain: Option<PrimeChain>,
    /// Estimated target at which miners find longer chains
    pub work_transition: u64,
}

impl BlockIndexNode {
    pub fn bits(&self) -> CompactTarget {
        self.header.bits
    }

    pub fn time(&self) -> i64 {
        self.header.block_time()
    }

    /// Tree-valid and not failed
    pub fn is_tree_valid(&self) -> bool {
        self.status.contains(BlockStatus::VALID_TREE) && !self.status.is_failed()
    }
}

// =============================================================================
// Skip list heights
// =============================================================================

fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

/// Height the skip pointer of a node at `height` points to
fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

// =============================================================================
// Block Index
// =============================================================================

/// Arena of all known headers
#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<BlockHash, NodeId>,
    children: HashMap<NodeId, Vec<NodeId>>,
    /// Minimum chain length, the base of the work scale
    min_length: u32,
    next_sequence: i64,
}

impl BlockIndex {
    pub fn new(min_length: u32) -> Self {
        Self {
            min_length,
            ..Self::default()
        }
    }

    /// Index rooted at `genesis`
    pub fn with_genesis(min_length: u32, genesis: BlockHeader) -> Self {
        let mut index = Self::new(min_length);
        index.push_genesis(genesis);
        index
    }

    /// Index the genesis header. Genesis is valid and has data by definition.
    pub fn insert_genesis(&mut self, header: BlockHeader) -> Result<NodeId, IndexError> {
        if !self.nodes.is_empty() {
            return Err(IndexError::GenesisExists);
        }
        Ok(self.push_genesis(header))
    }

    fn push_genesis(&mut self, header: BlockHeader) -> NodeId {
        let hash = header.hash();
        let node = BlockIndexNode {
            hash,
            chain_work: header.bits.block_work(self.min_length),
            work_transition: header.bits.to_u32() as u64,
            header,
            parent: None,
            skip: None,
            height: 0,
            status: BlockStatus::VALID_MASK | BlockStatus::HAVE_DATA,
            failure: None,
            tx_count: 1,
            chain_tx: 1,
            data_size: 0,
            chain_data_size: 0,
            sequence_id: 0,
            prime_chain: None,
        };
        self.next_sequence = 1;
        self.push(node)
    }

    /// Index a header whose parent is already known
    pub fn insert(&mut self, header: BlockHeader, prime_chain: Option<PrimeChain>) -> Result<NodeId, IndexError> {
        if self.nodes.is_empty() {
            return Err(IndexError::MissingGenesis);
        }
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(IndexError::Duplicate(hash));
        }
        let parent_id = self
            .lookup(&header.prev_block)
            .ok_or(IndexError::UnknownParent(header.prev_block))?;

        let parent = self.get(parent_id);
        let height = parent.height + 1;
        let chain_work = &parent.chain_work + header.bits.block_work(self.min_length);
        let found_length = prime_chain.map(|c| c.length).unwrap_or(header.bits);
        let work_transition = estimate_work_transition(parent.work_transition, header.bits, found_length);
        let skip = self.ancestor(parent_id, skip_height(height));

        let sequence_id = self.next_sequence;
        self.next_sequence += 1;

        let node = BlockIndexNode {
            hash,
            header,
            parent: Some(parent_id),
            skip,
            height,
            chain_work,
            status: BlockStatus::VALID_HEADER,
            failure: None,
            tx_count: 0,
            chain_tx: 0,
            data_size: 0,
            chain_data_size: 0,
            sequence_id,
            prime_chain,
            work_transition,
        };
        let id = self.push(node);
        self.children.entry(parent_id).or_default().push(id);
        Ok(id)
    }

    fn push(&mut self, node: BlockIndexNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    /// Node by id. Ids handed out by this index are always valid.
    pub fn get(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id.index()]
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node_by_hash(&self, hash: &BlockHash) -> Option<&BlockIndexNode> {
        self.lookup(hash).map(|id| self.get(id))
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn genesis(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Ancestor of `id` at `height`, or `None` above the node's height
    pub fn ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut walk = id;
        let mut walk_height = self.get(walk).height;
        if height > walk_height {
            return None;
        }
        while walk_height > height {
            let node = self.get(walk);
            let skip = skip_height(walk_height);
            let skip_prev = skip_height(walk_height - 1);
            let take_skip = match node.skip {
                Some(_) if skip == height => true,
                Some(_) => skip > height && !(skip_prev + 2 < skip && skip_prev >= height),
                None => false,
            };
            match (take_skip, node.skip, node.parent) {
                (true, Some(target), _) => {
                    walk = target;
                    walk_height = skip;
                }
                (_, _, Some(parent)) => {
                    walk = parent;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    /// Whether `ancestor` lies on the path from genesis to `id`
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestor(id, self.get(ancestor).height) == Some(ancestor)
    }

    /// Median of the last [`MTP_BLOCK_COUNT`] block times ending at `id`
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MTP_BLOCK_COUNT);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == MTP_BLOCK_COUNT {
                break;
            }
            let node = self.get(current);
            times.push(node.time());
            walk = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn set_status(&mut self, id: NodeId, status: BlockStatus) {
        self.get_mut(id).status = status;
    }

    /// Raise the validity of a node up to `level`. Returns false for failed nodes.
    pub fn raise_validity(&mut self, id: NodeId, level: BlockStatus) -> bool {
        let node = self.get_mut(id);
        if node.status.is_failed() {
            return false;
        }
        let mut raised = BlockStatus::VALID_HEADER;
        if level.intersects(BlockStatus::VALID_TREE | BlockStatus::VALID_SCRIPTS) {
            raised |= BlockStatus::VALID_TREE;
        }
        if level.contains(BlockStatus::VALID_SCRIPTS) {
            raised |= BlockStatus::VALID_SCRIPTS;
        }
        node.status |= raised;
        true
    }

    /// Mark `id` failed and every descendant failed-child.
    ///
    /// Returns the descendants touched.
    pub fn mark_failed(&mut self, id: NodeId, reason: FailureReason) -> Vec<NodeId> {
        {
            let node = self.get_mut(id);
            node.status.insert(BlockStatus::FAILED_VALID);
            if !node.failure.as_ref().is_some_and(|f| f.is_permanent()) {
                node.failure = Some(reason);
            }
        }
        let descendants = self.descendants(id);
        for &child in &descendants {
            let node = self.get_mut(child);
            node.status.insert(BlockStatus::FAILED_CHILD);
            if node.failure.is_none() {
                node.failure = Some(FailureReason::AncestorFailed);
            }
        }
        descendants
    }

    /// Drop the failure flags of a single node
    pub fn clear_failure(&mut self, id: NodeId) {
        let node = self.get_mut(id);
        node.status.remove(BlockStatus::FAILED_MASK);
        node.failure = None;
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(&id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// All nodes built on `id`, excluding `id`
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        while let Some(next) = stack.pop() {
            result.push(next);
            stack.extend_from_slice(self.children(next));
        }
        result
    }

    /// Nodes with no children
    pub fn leaves(&self) -> Vec<NodeId> {
        self.ids().filter(|id| self.children(*id).is_empty()).collect()
    }

    /// Deepest node that is an ancestor of both `a` and `b`
    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let height = self.get(a).height.min(self.get(b).height);
        let mut a = self.ancestor(a, height).unwrap_or(a);
        let mut b = self.ancestor(b, height).unwrap_or(b);
        while a != b {
            match (self.get(a).parent, self.get(b).parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                // Both paths end at the single genesis node
                _ => break,
            }
        }
        a
    }

    /// Record the body of a block.
    ///
    /// Cumulative transaction counts flow down to descendants whose whole path
    /// now has data. Returns the nodes whose cumulative counts became known.
    pub fn record_block_data(&mut self, id: NodeId, tx_count: u32, size: u64) -> Result<Vec<NodeId>, IndexError> {
        if tx_count == 0 {
            return Err(IndexError::EmptyBlockData);
        }
        {
            let node = self.get_mut(id);
            node.tx_count = tx_count;
            node.data_size = size;
            node.status.insert(BlockStatus::HAVE_DATA);
        }

        let parent_linked = match self.get(id).parent {
            Some(parent) => self.get(parent).chain_tx != 0,
            None => true,
        };
        if !parent_linked {
            return Ok(Vec::new());
        }

        let mut linked = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let (parent_tx, parent_size) = match self.get(current).parent {
                Some(parent) => {
                    let p = self.get(parent);
                    (p.chain_tx, p.chain_data_size)
                }
                None => (0, 0),
            };
            let node = self.get_mut(current);
            node.chain_tx = parent_tx + node.tx_count as u64;
            node.chain_data_size = parent_size + node.data_size;
            linked.push(current);

            for &child in self.children(current) {
                if self.get(child).status.contains(BlockStatus::HAVE_DATA) {
                    queue.push_back(child);
                }
            }
        }
        Ok(linked)
    }

    /// Give `id` the next precedence value below every first-seen id
    pub fn set_sequence(&mut self, id: NodeId, sequence_id: i64) {
        self.get_mut(id).sequence_id = sequence_id;
    }
}
