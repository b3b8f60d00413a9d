//! Per-network consensus parameters
//!
//! Networks differ only in data: one [`ConsensusParams`] value is built per
//! process, checked against its genesis constants, optionally adjusted from a
//! JSON [`ConsensusConfig`] and then shared read-only.

use crate::consensus::target::CompactTarget;
use crate::core::block::BlockHeader;
use crate::core::genesis::create_genesis_header;
use crate::crypto::{BlockHash, HashParseError};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, BufReader};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Deployment timeout meaning "never times out"
pub const NO_TIMEOUT: i64 = i64::MAX;

/// Deployment start time meaning "active from genesis"
pub const ALWAYS_ACTIVE: i64 = -1;

/// Maximum allowed drift of a header time into the future (seconds)
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

// =============================================================================
// Errors
// =============================================================================

/// Parameter construction and configuration errors
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    #[error("Genesis {field} mismatch on {network}: expected {expected}, got {got}")]
    GenesisMismatch {
        network: NetworkKind,
        field: &'static str,
        expected: BlockHash,
        got: BlockHash,
    },
    #[error("Unknown deployment: {0}")]
    UnknownDeployment(String),
    #[error("Invalid chain work: {0}")]
    InvalidChainWork(String),
    #[error("Invalid hash: {0}")]
    InvalidHash(#[from] HashParseError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] serde_json::Error),
}

// =============================================================================
// Network Kind
// =============================================================================

/// The three networks a node can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Main,
    #[serde(alias = "testnet")]
    Test,
    Regtest,
}

impl NetworkKind {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkKind::Main => "main",
            NetworkKind::Test => "test",
            NetworkKind::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkKind {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(NetworkKind::Main),
            "test" | "testnet" => Ok(NetworkKind::Test),
            "regtest" => Ok(NetworkKind::Regtest),
            other => Err(ParamsError::UnknownNetwork(other.to_string())),
        }
    }
}

/// How the difficulty engine moves the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetargetMode {
    /// Adjust every block from the spacing of the last two blocks
    Continuous,
    /// Adjust once per `timespan / spacing` blocks
    Windowed,
}

// =============================================================================
// Deployments
// =============================================================================

/// Known soft-fork deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPos {
    TestDummy,
    Csv,
    Segwit,
}

impl DeploymentPos {
    pub const ALL: [DeploymentPos; 3] = [DeploymentPos::TestDummy, DeploymentPos::Csv, DeploymentPos::Segwit];

    pub fn name(&self) -> &'static str {
        match self {
            DeploymentPos::TestDummy => "testdummy",
            DeploymentPos::Csv => "csv",
            DeploymentPos::Segwit => "segwit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pos| pos.name() == name)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DeploymentPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeploymentPos {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ParamsError::UnknownDeployment(s.to_string()))
    }
}

/// A BIP9 deployment: the version bit and its signalling window in MTP seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub bit: u8,
    pub start_time: i64,
    pub timeout: i64,
}

impl Deployment {
    pub const fn new(bit: u8, start_time: i64, timeout: i64) -> Self {
        Self {
            bit,
            start_time,
            timeout,
        }
    }

    /// A zero timeout switches the deployment off and hides it
    pub fn is_disabled(&self) -> bool {
        self.timeout == 0
    }

    pub fn is_always_active(&self) -> bool {
        self.start_time == ALWAYS_ACTIVE
    }

    /// Version bit mask
    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

// =============================================================================
// Consensus Params
// =============================================================================

/// Everything that differs between networks
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: NetworkKind,
    /// Difficulty averaging timespan (seconds)
    pub target_timespan: i64,
    /// Desired block spacing (seconds)
    pub target_spacing: i64,
    pub retarget_mode: RetargetMode,
    pub no_retargeting: bool,
    /// Shortest chain length ever required
    pub target_min_length: u32,
    /// Chain length required of the first blocks
    pub target_initial_length: u32,
    /// Signalling blocks per window needed to lock in a deployment
    pub rule_change_activation_threshold: u32,
    /// Blocks per signalling window
    pub miner_confirmation_window: u32,
    pub deployments: [Deployment; 3],
    pub checkpoints: BTreeMap<u32, BlockHash>,
    pub minimum_chain_work: BigUint,
    pub assume_valid: Option<BlockHash>,
    pub max_future_block_time: i64,
    pub genesis: BlockHeader,
    pub genesis_hash: BlockHash,
}

struct GenesisConstants {
    time: u32,
    nonce: u32,
    length: u32,
    multiplier: u64,
    hash: &'static str,
}

const GENESIS_VERSION: i32 = 2;
const GENESIS_MERKLE_ROOT: &str = "fe5d7082c24c53362f6b82211913d536677aaffafde0dcec6ff7b348ff6265f8";

impl ConsensusParams {
    /// Build the parameters of `network`, checking its genesis block
    pub fn for_network(network: NetworkKind) -> Result<Self, ParamsError> {
        match network {
            NetworkKind::Main => Self::mainnet(),
            NetworkKind::Test => Self::testnet(),
            NetworkKind::Regtest => Self::regtest(),
        }
    }

    /// Build parameters by network name
    pub fn from_name(name: &str) -> Result<Self, ParamsError> {
        Self::for_network(name.parse()?)
    }

    /// Build parameters for `config.network` and apply its overrides
    pub fn from_config(config: &ConsensusConfig) -> Result<Self, ParamsError> {
        let mut params = Self::for_network(config.network)?;
        params.apply_config(config)?;
        Ok(params)
    }

    fn mainnet() -> Result<Self, ParamsError> {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(
            72_204,
            BlockHash::from_hex("661b85bab200d0b1f72c6909c5b2602af8227459ae72b7afbff75d16c8e2b703")?,
        );
        checkpoints.insert(
            2_000_000,
            BlockHash::from_hex("4e49f85b69f68d6f58b2b18473c4bf17d88e6dd7c79d7d416e22522da17bc91a")?,
        );
        let assume_valid =
            BlockHash::from_hex("b7183015dc5e4f2e1be353329e7fd9c0eb32efef412e0a0c5c970a9aacde8d8d")?;
        checkpoints.insert(3_128_684, assume_valid);

        Self::build(
            NetworkKind::Main,
            GenesisConstants {
                time: 1_384_627_170,
                nonce: 49_030_125,
                length: 6,
                multiplier: 5_651_310,
                hash: "1d724e874ee9ea571563239bde095911f128db47c7612fb1968c08c9f95cabe8",
            },
            Self {
                network: NetworkKind::Main,
                target_timespan: 7 * 24 * 60 * 60,
                target_spacing: 60,
                retarget_mode: RetargetMode::Continuous,
                no_retargeting: false,
                target_min_length: 6,
                target_initial_length: 7,
                rule_change_activation_threshold: 1026,
                miner_confirmation_window: 1080,
                deployments: [
                    Deployment::new(28, 1_199_145_601, 1_230_767_999),
                    Deployment::new(0, 1_462_060_800, 1_493_596_800),
                    Deployment::new(1, 999_999_999_999, 999_999_999_999),
                ],
                checkpoints,
                minimum_chain_work: parse_chain_work("0x31d4a178b250")?,
                assume_valid: Some(assume_valid),
                max_future_block_time: MAX_FUTURE_BLOCK_TIME,
                genesis: placeholder_genesis(),
                genesis_hash: BlockHash::zero(),
            },
        )
    }

    fn testnet() -> Result<Self, ParamsError> {
        let assume_valid =
            BlockHash::from_hex("e0fd3ea6ef46adabd8f4a58d8b957e9909cd1006eaf23712761f8e72d595c676")?;
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(442_608, assume_valid);

        Self::build(
            NetworkKind::Test,
            GenesisConstants {
                time: 1_385_686_192,
                nonce: 46_032,
                length: 4,
                multiplier: 211_890,
                hash: "26ee5563233ed8cbdd8af5f16bc55b73d9d8cc727392d507292ca959fd08c03f",
            },
            Self {
                network: NetworkKind::Test,
                target_timespan: 7 * 24 * 60 * 60,
                target_spacing: 60,
                retarget_mode: RetargetMode::Continuous,
                no_retargeting: false,
                target_min_length: 2,
                target_initial_length: 4,
                rule_change_activation_threshold: 810,
                miner_confirmation_window: 1080,
                deployments: [
                    Deployment::new(28, 1_199_145_601, 1_230_767_999),
                    Deployment::new(0, 1_456_790_400, 1_493_596_800),
                    Deployment::new(1, 999_999_999_999, NO_TIMEOUT),
                ],
                checkpoints,
                minimum_chain_work: parse_chain_work("0x1beed3c6966e0")?,
                assume_valid: Some(assume_valid),
                max_future_block_time: MAX_FUTURE_BLOCK_TIME,
                genesis: placeholder_genesis(),
                genesis_hash: BlockHash::zero(),
            },
        )
    }

    fn regtest() -> Result<Self, ParamsError> {
        let genesis_hash =
            BlockHash::from_hex("3864a16a5e7c9f79f2ab2ebc41e943f342f6737b83649844f6b41334eb7e5ba8")?;
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, genesis_hash);

        Self::build(
            NetworkKind::Regtest,
            GenesisConstants {
                time: 1_385_686_192,
                nonce: 46_032,
                length: 1,
                multiplier: 211_890,
                hash: "3864a16a5e7c9f79f2ab2ebc41e943f342f6737b83649844f6b41334eb7e5ba8",
            },
            Self {
                network: NetworkKind::Regtest,
                target_timespan: 7 * 24 * 60 * 60,
                target_spacing: 60,
                retarget_mode: RetargetMode::Windowed,
                no_retargeting: true,
                target_min_length: 1,
                target_initial_length: 1,
                rule_change_activation_threshold: 60,
                miner_confirmation_window: 80,
                deployments: [
                    Deployment::new(28, 0, NO_TIMEOUT),
                    Deployment::new(0, 0, 999_999_999_999),
                    Deployment::new(1, 999_999_999_999, NO_TIMEOUT),
                ],
                checkpoints,
                minimum_chain_work: BigUint::zero(),
                assume_valid: None,
                max_future_block_time: MAX_FUTURE_BLOCK_TIME,
                genesis: placeholder_genesis(),
                genesis_hash: BlockHash::zero(),
            },
        )
    }

    fn build(network: NetworkKind, constants: GenesisConstants, mut params: Self) -> Result<Self, ParamsError> {
        let genesis = create_genesis_header(
            constants.time,
            constants.nonce,
            CompactTarget::from_length(constants.length),
            GENESIS_VERSION,
            constants.multiplier,
        );
        check_genesis(
            network,
            &genesis,
            BlockHash::from_hex(constants.hash)?,
            BlockHash::from_hex(GENESIS_MERKLE_ROOT)?,
        )?;
        params.genesis_hash = genesis.hash();
        params.genesis = genesis;
        Ok(params)
    }

    /// Blocks per difficulty interval
    pub fn interval(&self) -> i64 {
        self.target_timespan / self.target_spacing
    }

    pub fn deployment(&self, pos: DeploymentPos) -> &Deployment {
        &self.deployments[pos.index()]
    }

    /// Deployments that are not switched off, in table order
    pub fn active_deployments(&self) -> impl Iterator<Item = (DeploymentPos, &Deployment)> {
        DeploymentPos::ALL
            .into_iter()
            .map(move |pos| (pos, self.deployment(pos)))
            .filter(|(_, dep)| !dep.is_disabled())
    }

    /// Apply the overrides of a config file
    pub fn apply_config(&mut self, config: &ConsensusConfig) -> Result<(), ParamsError> {
        for (name, change) in &config.deployments {
            let pos: DeploymentPos = name.parse()?;
            let deployment = &mut self.deployments[pos.index()];
            if let Some(start_time) = change.start_time {
                deployment.start_time = start_time;
            }
            if let Some(timeout) = change.timeout {
                deployment.timeout = timeout;
            }
            log::info!(
                "Deployment {} overridden: start {} timeout {}",
                name,
                deployment.start_time,
                deployment.timeout
            );
        }
        if let Some(hash) = config.assume_valid {
            self.assume_valid = if hash.is_zero() { None } else { Some(hash) };
        }
        if let Some(work) = &config.minimum_chain_work {
            self.minimum_chain_work = parse_chain_work(work)?;
        }
        Ok(())
    }
}

fn placeholder_genesis() -> BlockHeader {
    BlockHeader {
        version: GENESIS_VERSION,
        prev_block: BlockHash::zero(),
        merkle_root: BlockHash::zero(),
        time: 0,
        bits: CompactTarget::default(),
        nonce: 0,
        prime_chain_multiplier: BigUint::zero(),
    }
}

/// Compare a genesis header with the network's hard-coded hashes
pub fn check_genesis(
    network: NetworkKind,
    genesis: &BlockHeader,
    expected_hash: BlockHash,
    expected_merkle_root: BlockHash,
) -> Result<(), ParamsError> {
    if genesis.merkle_root != expected_merkle_root {
        return Err(ParamsError::GenesisMismatch {
            network,
            field: "merkle root",
            expected: expected_merkle_root,
            got: genesis.merkle_root,
        });
    }
    let hash = genesis.hash();
    if hash != expected_hash {
        return Err(ParamsError::GenesisMismatch {
            network,
            field: "hash",
            expected: expected_hash,
            got: hash,
        });
    }
    Ok(())
}

/// Parse a big-endian hex amount of chain work (optional `0x` prefix)
pub fn parse_chain_work(s: &str) -> Result<BigUint, ParamsError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(BigUint::zero());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(|| ParamsError::InvalidChainWork(s.to_string()))
}

// =============================================================================
// Config File
// =============================================================================

/// Override of one deployment's signalling window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOverride {
    pub start_time: Option<i64>,
    pub timeout: Option<i64>,
}

/// Operator configuration loaded from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub network: NetworkKind,
    /// Keyed by deployment name
    pub deployments: HashMap<String, DeploymentOverride>,
    /// Zero hash disables assume-valid
    pub assume_valid: Option<BlockHash>,
    /// Big-endian hex
    pub minimum_chain_work: Option<String>,
}

impl ConsensusConfig {
    pub fn for_network(network: NetworkKind) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let file = fs::File::open(path.as_ref())?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        log::debug!("Loaded consensus config from {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_all_networks_build() {
        for network in [NetworkKind::Main, NetworkKind::Test, NetworkKind::Regtest] {
            let params = ConsensusParams::for_network(network).unwrap();
            assert_eq!(params.network, network);
            assert_eq!(params.genesis_hash, params.genesis.hash());
            assert!(params.genesis.prev_block.is_zero());
            assert_eq!(params.interval(), 10080);
        }
    }

    #[test]
    fn test_genesis_pow_hashes() {
        let expected = [
            (
                NetworkKind::Main,
                "e99f0a9e66163debc065c313e638aa895d2b80652d109dbe4beb9808f62d1157",
            ),
            (
                NetworkKind::Test,
                "82361f6f8e8501cc66d868b71a75f568023dbce1e3371585d9c0aaa453311cd3",
            ),
            (
                NetworkKind::Regtest,
                "d9ef03f215888ecb0a82acdcd4e067b29f0ce3f49e327df656c400335a19eb2a",
            ),
        ];
        for (network, pow_hash) in expected {
            let params = ConsensusParams::for_network(network).unwrap();
            assert_eq!(params.genesis.pow_hash().to_hex(), pow_hash);
        }
    }

    #[test]
    fn test_regtest_checkpoint_is_genesis() {
        let params = ConsensusParams::for_network(NetworkKind::Regtest).unwrap();
        assert_eq!(params.checkpoints.get(&0), Some(&params.genesis_hash));
        assert!(params.no_retargeting);
        assert_eq!(params.retarget_mode, RetargetMode::Windowed);
    }

    #[test]
    fn test_genesis_mismatch_is_reported() {
        let params = ConsensusParams::for_network(NetworkKind::Main).unwrap();
        let mut tampered = params.genesis.clone();
        tampered.nonce += 1;
        let err = check_genesis(
            NetworkKind::Main,
            &tampered,
            params.genesis_hash,
            params.genesis.merkle_root,
        )
        .unwrap_err();
        assert!(matches!(err, ParamsError::GenesisMismatch { field: "hash", .. }));
    }

    #[test]
    fn test_network_names() {
        assert_eq!("main".parse::<NetworkKind>().unwrap(), NetworkKind::Main);
        assert_eq!("testnet".parse::<NetworkKind>().unwrap(), NetworkKind::Test);
        assert_eq!("regtest".parse::<NetworkKind>().unwrap(), NetworkKind::Regtest);
        assert!(matches!(
            "signet".parse::<NetworkKind>(),
            Err(ParamsError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn test_deployment_lookup() {
        assert_eq!(DeploymentPos::from_name("csv"), Some(DeploymentPos::Csv));
        assert!(matches!(
            "taproot".parse::<DeploymentPos>(),
            Err(ParamsError::UnknownDeployment(_))
        ));
        let params = ConsensusParams::for_network(NetworkKind::Main).unwrap();
        assert_eq!(params.deployment(DeploymentPos::TestDummy).bit, 28);
        assert_eq!(params.deployment(DeploymentPos::Csv).mask(), 1);
    }

    #[test]
    fn test_chain_work_parsing() {
        assert_eq!(parse_chain_work("0x10").unwrap(), BigUint::from(16u32));
        assert_eq!(parse_chain_work("0x").unwrap(), BigUint::zero());
        assert!(parse_chain_work("0xzz").is_err());
    }

    #[test]
    fn test_config_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "network": "regtest",
                "deployments": {{ "csv": {{ "start_time": 100, "timeout": 0 }} }},
                "assume_valid": "{}",
                "minimum_chain_work": "0x400"
            }}"#,
            BlockHash::of(b"valid")
        )
        .unwrap();

        let config = ConsensusConfig::load(file.path()).unwrap();
        let params = ConsensusParams::from_config(&config).unwrap();
        assert_eq!(params.network, NetworkKind::Regtest);
        let csv = params.deployment(DeploymentPos::Csv);
        assert_eq!(csv.start_time, 100);
        assert!(csv.is_disabled());
        assert!(params
            .active_deployments()
            .all(|(pos, _)| pos != DeploymentPos::Csv));
        assert_eq!(params.assume_valid, Some(BlockHash::of(b"valid")));
        assert_eq!(params.minimum_chain_work, BigUint::from(1024u32));
    }

    #[test]
    fn test_config_rejects_unknown_deployment() {
        let mut config = ConsensusConfig::for_network(NetworkKind::Regtest);
        config
            .deployments
            .insert("taproot".to_string(), DeploymentOverride::default());
        assert!(matches!(
            ConsensusParams::from_config(&config),
            Err(ParamsError::UnknownDeployment(_))
        ));
    }

    #[test]
    fn test_default_config_is_main() {
        let config: ConsensusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.network, NetworkKind::Main);
        assert!(config.deployments.is_empty());
    }
}
