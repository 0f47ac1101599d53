use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use chainlens_core::exposure::DepthPreset;
use chainlens_core::Direction;

/// chainlens: local Bitcoin forensics. Traces UTXO flow, detects CoinJoins,
/// clusters addresses and simulates what an exchange could trace.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(flatten)]
    pub node: NodeArgs,

    /// JSON policy file overriding scoring weights, thresholds and limits.
    #[arg(long, env = "CHAINLENS_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Directory of BIP-329 JSONL files naming exchanges and services.
    #[arg(long, env = "CHAINLENS_ENTITY_DIR")]
    pub entity_dir: Option<PathBuf>,

    /// Cluster snapshot to load at startup and save after the command.
    #[arg(long, env = "CHAINLENS_CLUSTER_SNAPSHOT")]
    pub cluster_snapshot: Option<PathBuf>,

    /// Abort the command after this many seconds, printing partial results.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Maximum concurrent upstream calls (overrides the policy file).
    #[arg(long)]
    pub rpc_concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct NodeArgs {
    /// Bitcoin Core RPC URL.
    #[arg(long, default_value = "http://127.0.0.1:8332", env = "CHAINLENS_RPC_URL")]
    pub rpc_url: String,

    /// RPC username (optional; not needed with a cookie file).
    #[arg(long, env = "CHAINLENS_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password (optional; not needed with a cookie file).
    #[arg(long, env = "CHAINLENS_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Path to bitcoind's `.cookie` file.
    #[arg(long, env = "CHAINLENS_RPC_COOKIE")]
    pub rpc_cookie: Option<PathBuf>,

    /// Cap on outbound RPC requests per second.
    #[arg(long)]
    pub rpc_requests_per_second: Option<u32>,

    /// Maximum calls per JSON-RPC batch request.
    #[arg(long, default_value = "50")]
    pub rpc_batch_size: usize,

    /// Electrum server (`host:port`) used as the address indexer. Forward
    /// tracing, address scoring and dust scans need one.
    #[arg(long, env = "CHAINLENS_ELECTRUM")]
    pub electrum: Option<String>,
}

/// Depth as either an explicit number or a named preset.
#[derive(Args, Clone, Copy)]
pub struct DepthArgs {
    /// Maximum hops to follow (at most 50).
    #[arg(long, conflicts_with = "preset")]
    pub depth: Option<u32>,

    /// Named depth: quick (3), standard (6), deep (10) or thorough (15).
    #[arg(long)]
    pub preset: Option<DepthPreset>,
}

impl DepthArgs {
    pub fn resolve(self, default: u32) -> u32 {
        match (self.depth, self.preset) {
            (Some(depth), _) => depth,
            (None, Some(preset)) => preset.depth(),
            (None, None) => default,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the connected node's chain and whether an indexer is available.
    Info,

    /// Run the CoinJoin detector on a transaction and merge its inputs.
    Classify {
        txid: String,
    },

    /// Trace an output forward or backward, hop by hop.
    Trace {
        /// Origin as `txid:vout`.
        outpoint: String,
        #[arg(long, default_value = "backward")]
        direction: Direction,
        #[command(flatten)]
        depth: DepthArgs,
    },

    /// Trace both directions from output 0 of a transaction.
    Tree {
        txid: String,
        #[arg(long, default_value = "3")]
        forward_depth: u32,
        #[arg(long, default_value = "3")]
        backward_depth: u32,
    },

    /// Privacy score for a single output.
    Score {
        /// Output as `txid:vout`.
        outpoint: String,
        #[command(flatten)]
        depth: DepthArgs,
    },

    /// Privacy score for every UTXO held by an address.
    ScoreAddress {
        address: String,
        #[command(flatten)]
        depth: DepthArgs,
    },

    /// Simulate what an exchange could trace from a withdrawal.
    Exposure {
        /// The withdrawal transaction.
        txid: String,
        /// The address that received the withdrawal.
        address: String,
        #[command(flatten)]
        depth: DepthArgs,
    },

    /// List dust UTXOs of an address and flag likely dust attacks.
    Dust {
        address: String,
        /// Report outputs at or below this value (satoshis).
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Address clustering operations.
    #[command(subcommand)]
    Cluster(ClusterCommand),
}

#[derive(Subcommand)]
pub enum ClusterCommand {
    /// Assert common ownership of two or more addresses.
    Merge {
        #[arg(required = true, num_args = 2..)]
        addresses: Vec<String>,
    },
    /// Show the cluster containing an address.
    Show { address: String },
}
