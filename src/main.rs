//! Prime-Consensus CLI Application
//!
//! Inspect the consensus parameters of a prime-chain network.

use clap::{Parser, Subcommand};
use prime_consensus::cli::{self, AppState};
use prime_consensus::consensus::NetworkKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prime-consensus")]
#[command(version = "0.1.0")]
#[command(about = "Consensus core of a prime-chain proof-of-work coin", long_about = None)]
struct Cli {
    /// Network: main, test or regtest (overrides the config file)
    #[arg(short, long)]
    network: Option<NetworkKind>,

    /// JSON file with consensus overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the genesis block
    Genesis {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the consensus parameters
    Params {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode a hex-serialized block header
    DecodeHeader {
        /// Header bytes in hex
        hex: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Explain a compact target (0x07800000 or 07.800000)
    Target {
        /// Compact target
        bits: String,

        /// Also show the target after a block this many seconds after its parent
        #[arg(short, long)]
        spacing: Option<i64>,
    },

    /// List soft-fork deployments
    Versionbits,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Header decoding runs without network parameters
    let network = cli.network;
    let config = cli.config;
    let state = || AppState::new(network, config.as_deref());

    match cli.command {
        Commands::DecodeHeader { hex, json } => {
            cli::cmd_decode_header(&hex, json)?;
        }

        Commands::Genesis { json } => {
            cli::cmd_genesis(&state()?, json)?;
        }

        Commands::Params { json } => {
            cli::cmd_params(&state()?, json)?;
        }

        Commands::Target { bits, spacing } => {
            cli::cmd_target(&state()?, &bits, spacing)?;
        }

        Commands::Versionbits => {
            cli::cmd_versionbits(&state()?)?;
        }
    }

    Ok(())
}
