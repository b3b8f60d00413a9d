//! Consensus rules
//!
//! - Network parameters and their JSON overrides
//! - Compact prime-chain targets and chain work
//! - Prime-chain proof-of-work validation
//! - Difficulty retargeting and block subsidy
//! - Version-bits deployment tracking

pub mod difficulty;
pub mod params;
pub mod pow;
pub mod target;
pub mod versionbits;

pub use difficulty::{block_subsidy, DifficultyEngine};
pub use params::{
    ConsensusConfig, ConsensusParams, Deployment, DeploymentOverride, DeploymentPos, NetworkKind,
    ParamsError, RetargetMode, ALWAYS_ACTIVE, NO_TIMEOUT,
};
pub use pow::{ChainType, PowError, PowValidator, PrimeChain, PrimeChainVerifier};
pub use target::{CompactTarget, TargetError};
pub use versionbits::{DeploymentStats, ThresholdState, VersionBitsCache};
