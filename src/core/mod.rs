//! Core chain components
//!
//! This module contains:
//! - Block headers and their wire encoding
//! - Genesis block construction
//! - Chain state (header acceptance, chain selection, reorgs, operator controls)
//! - Prime records over the active chain

pub mod block;
pub mod chain_state;
pub mod genesis;
pub mod records;

pub use block::{BlockError, BlockHeader, BLOCK_HEADER_PREFIX_SIZE, MAX_MULTIPLIER_BYTES};
pub use chain_state::{
    AcceptOutcome, ChainConnector, ChainState, ChainTip, ChainTxStats, ConnectContext,
    ConnectError, ConsensusError, HeaderInfo, NoopConnector, TipInfo, TipStatus,
};
pub use genesis::{create_genesis_header, CENT, COIN};
pub use records::{prime_records, primorial_form, top_primes, PrimeRecord, TOP_PRIMES_COUNT};
