//! CLI commands
//!
//! Inspection commands over the consensus parameters of a network: genesis,
//! parameters, header decoding, target arithmetic and deployments.

use crate::consensus::{
    block_subsidy, CompactTarget, ConsensusConfig, ConsensusParams, NetworkKind, RetargetMode,
    NO_TIMEOUT,
};
use crate::core::{BlockHeader, COIN};
use crate::crypto::BlockHash;
use crate::storage::CheckpointManager;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub params: Arc<ConsensusParams>,
}

impl AppState {
    /// Parameters of `network`, with overrides from an optional JSON config.
    /// An explicit network wins over the one in the file.
    pub fn new(network: Option<NetworkKind>, config: Option<&Path>) -> CliResult<Self> {
        let mut config = match config {
            Some(path) => {
                log::info!("Loading consensus config from {:?}", path);
                ConsensusConfig::load(path)?
            }
            None => ConsensusConfig::default(),
        };
        if let Some(network) = network {
            config.network = network;
        }
        let params = ConsensusParams::from_config(&config)?;
        Ok(Self {
            params: Arc::new(params),
        })
    }
}

/// Header fields for display
#[derive(Debug, Serialize)]
pub struct HeaderSummary {
    pub hash: BlockHash,
    pub pow_hash: BlockHash,
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
    pub prime_chain_multiplier: String,
    pub prime_origin: String,
}

impl HeaderSummary {
    pub fn of(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            pow_hash: header.pow_hash(),
            version: header.version,
            prev_block: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits.to_string(),
            nonce: header.nonce,
            prime_chain_multiplier: header.prime_chain_multiplier.to_string(),
            prime_origin: header.prime_origin().to_string(),
        }
    }
}

/// Network parameters for display
#[derive(Debug, Serialize)]
pub struct ParamsSummary {
    pub network: String,
    pub genesis_hash: BlockHash,
    pub target_spacing: i64,
    pub target_timespan: i64,
    pub retarget_mode: RetargetMode,
    pub no_retargeting: bool,
    pub target_min_length: u32,
    pub target_initial_length: u32,
    pub miner_confirmation_window: u32,
    pub rule_change_activation_threshold: u32,
    pub max_future_block_time: i64,
    pub minimum_chain_work: String,
    pub assume_valid: Option<BlockHash>,
    pub checkpoints: Vec<(u32, BlockHash)>,
}

impl ParamsSummary {
    pub fn of(params: &ConsensusParams) -> Self {
        Self {
            network: params.network.to_string(),
            genesis_hash: params.genesis_hash,
            target_spacing: params.target_spacing,
            target_timespan: params.target_timespan,
            retarget_mode: params.retarget_mode,
            no_retargeting: params.no_retargeting,
            target_min_length: params.target_min_length,
            target_initial_length: params.target_initial_length,
            miner_confirmation_window: params.miner_confirmation_window,
            rule_change_activation_threshold: params.rule_change_activation_threshold,
            max_future_block_time: params.max_future_block_time,
            minimum_chain_work: format!("{:x}", params.minimum_chain_work),
            assume_valid: params.assume_valid,
            checkpoints: CheckpointManager::from_params(params)
                .all()
                .into_iter()
                .map(|cp| (cp.height, cp.hash))
                .collect(),
        }
    }
}

fn print_json(value: &impl Serialize) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_coins(amount: i64) -> String {
    format!("{}.{:08}", amount / COIN, amount % COIN)
}

/// Parse a target given as `0x07800000`, `07800000` or `07.800000`
pub fn parse_target(s: &str) -> CliResult<CompactTarget> {
    let s = s.trim();
    let bits = match s.split_once('.') {
        Some((length, fractional)) => {
            let length = u32::from_str_radix(length, 16)?;
            let fractional = u32::from_str_radix(fractional, 16)?;
            if length > 0xff || fractional > 0x00ff_ffff {
                return Err(format!("target {} out of range", s).into());
            }
            (length << 24) | fractional
        }
        None => {
            let hex = s.strip_prefix("0x").unwrap_or(s);
            u32::from_str_radix(hex, 16)?
        }
    };
    Ok(CompactTarget(bits))
}

/// Show the genesis block of the network
pub fn cmd_genesis(state: &AppState, json: bool) -> CliResult<()> {
    let params = &state.params;
    let summary = HeaderSummary::of(&params.genesis);
    if json {
        return print_json(&summary);
    }

    println!("🧱 Genesis block ({})", params.network);
    println!("   ├─ Hash: {}", summary.hash);
    println!("   ├─ Merkle root: {}", summary.merkle_root);
    println!("   ├─ Time: {}", summary.time);
    println!("   ├─ Bits: {}", summary.bits);
    println!("   ├─ Nonce: {}", summary.nonce);
    println!("   ├─ Multiplier: {}", summary.prime_chain_multiplier);
    println!("   └─ Prime origin: {}", summary.prime_origin);
    Ok(())
}

/// Show the consensus parameters of the network
pub fn cmd_params(state: &AppState, json: bool) -> CliResult<()> {
    let summary = ParamsSummary::of(&state.params);
    if json {
        return print_json(&summary);
    }

    println!("⚙️  Consensus parameters ({})", summary.network);
    println!("   ├─ Genesis: {}", summary.genesis_hash);
    println!(
        "   ├─ Spacing: {}s, timespan: {}s ({:?}{})",
        summary.target_spacing,
        summary.target_timespan,
        summary.retarget_mode,
        if summary.no_retargeting { ", disabled" } else { "" }
    );
    println!(
        "   ├─ Chain length: min {}, initial {}",
        summary.target_min_length, summary.target_initial_length
    );
    println!(
        "   ├─ Deployment window: {} blocks, threshold {}",
        summary.miner_confirmation_window, summary.rule_change_activation_threshold
    );
    println!("   ├─ Minimum chain work: 0x{}", summary.minimum_chain_work);
    match summary.assume_valid {
        Some(hash) => println!("   ├─ Assume valid: {}", hash),
        None => println!("   ├─ Assume valid: -"),
    }
    println!("   └─ Checkpoints: {}", summary.checkpoints.len());
    for (height, hash) in &summary.checkpoints {
        println!("      └─ {}: {}", height, hash);
    }
    Ok(())
}

/// Decode a hex-serialized header
pub fn cmd_decode_header(hex_header: &str, json: bool) -> CliResult<()> {
    let bytes = hex::decode(hex_header.trim())?;
    let header = BlockHeader::from_bytes(&bytes)?;
    let summary = HeaderSummary::of(&header);
    if json {
        return print_json(&summary);
    }

    println!("📦 Header {}", summary.hash);
    println!("   ├─ Version: {}", summary.version);
    println!("   ├─ Previous: {}", summary.prev_block);
    println!("   ├─ Merkle root: {}", summary.merkle_root);
    println!("   ├─ Time: {}", summary.time);
    println!("   ├─ Bits: {}", summary.bits);
    println!("   ├─ Nonce: {}", summary.nonce);
    println!("   ├─ PoW hash: {}", summary.pow_hash);
    println!("   ├─ Multiplier: {}", summary.prime_chain_multiplier);
    println!("   └─ Prime origin: {}", summary.prime_origin);
    Ok(())
}

/// Show what a target means, and where it moves after a block `spacing`
/// seconds apart
pub fn cmd_target(state: &AppState, bits: &str, spacing: Option<i64>) -> CliResult<()> {
    let params = &state.params;
    let target = parse_target(bits)?;
    target.validate(params.target_min_length)?;

    println!("🎯 Target {} (0x{:08x})", target, target.to_u32());
    println!("   ├─ Length: {}", target.length());
    println!("   ├─ Fractional difficulty: {}", target.fractional_difficulty());
    println!("   ├─ Difficulty: {:.8}", target.difficulty());
    println!("   ├─ Block work: 0x{:x}", target.block_work(params.target_min_length));
    println!("   └─ Subsidy: {} coins", format_coins(block_subsidy(target)));

    if let Some(spacing) = spacing {
        let next = target.next_continuous(
            params.target_min_length,
            params.interval(),
            params.target_spacing,
            spacing,
        )?;
        println!("\n   After a {}s block: {}", spacing, next.min(CompactTarget::limit(params)));
    }
    Ok(())
}

/// List the deployments of the network
pub fn cmd_versionbits(state: &AppState) -> CliResult<()> {
    let params = &state.params;
    println!(
        "🗳️  Deployments ({}, window {} / threshold {})",
        params.network, params.miner_confirmation_window, params.rule_change_activation_threshold
    );
    for (pos, deployment) in params.active_deployments() {
        let timeout = if deployment.timeout == NO_TIMEOUT {
            "never".to_string()
        } else {
            deployment.timeout.to_string()
        };
        let start = if deployment.is_always_active() {
            "always active".to_string()
        } else {
            deployment.start_time.to_string()
        };
        println!(
            "   └─ {} (bit {}): start {}, timeout {}",
            pos, deployment.bit, start, timeout
        );
    }
    Ok(())
}
