//! Header storage: the block index graph and the checkpoint table

pub mod checkpoint;
pub mod index;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointResult};
pub use index::{
    BlockIndex, BlockIndexNode, BlockStatus, FailureReason, IndexError, NodeId, MTP_BLOCK_COUNT,
};
