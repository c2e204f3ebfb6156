use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use streamverse_core::chunk::DEFAULT_CHUNK_DURATION_SECS;
use streamverse_core::gate::GateConfig;

use crate::state::NodeConfig;

#[derive(Parser)]
#[command(name = "streamverse")]
#[command(about = "Pay-per-chunk video streaming node", version)]
pub struct Cli {
    /// Storage directory for objects, catalog and databases
    #[arg(long, default_value = "/var/lib/streamverse")]
    pub storage_dir: PathBuf,

    /// HTTP port
    #[arg(long, default_value = "4021")]
    pub http_port: u16,

    /// Address that receives chunk payments
    #[arg(long, default_value = "0x0000000000000000000000000000000000000000")]
    pub pay_to: String,

    /// Settlement network
    #[arg(long, default_value = "polygon-amoy")]
    pub network: String,

    /// Default price per chunk in atomic units (1000 = $0.001 USDC)
    #[arg(long, default_value = "1000")]
    pub price: u64,

    /// x402 facilitator base URL. When set, payments settle there;
    /// otherwise signed vouchers are verified locally.
    #[arg(long)]
    pub facilitator_url: Option<String>,

    /// How long a consumed payment proof is remembered
    #[arg(long, default_value = "600")]
    pub replay_window_secs: u64,

    /// Upper bound on one settlement verification
    #[arg(long, default_value = "10")]
    pub verify_timeout_secs: u64,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve,
    /// Register a media file as a paid asset
    Register {
        /// Path to the media file
        #[arg(long)]
        file: PathBuf,
        /// Playback duration in seconds
        #[arg(long)]
        duration: f64,
        /// Seconds of playback per paid chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_DURATION_SECS)]
        chunk_duration: f64,
        /// Price per chunk in atomic units (defaults to the node's --price)
        #[arg(long)]
        price: Option<u64>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Stream an asset from a node, paying per chunk, into a file
    Stream {
        /// Node base URL (e.g. http://localhost:4021)
        #[arg(long)]
        server: String,
        /// Asset content address
        #[arg(long)]
        asset: String,
        /// Output file
        #[arg(long)]
        output: PathBuf,
        /// Payer key file (from `keygen`); a throwaway key is used if omitted
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Retries per chunk after network or verifier trouble
        #[arg(long, default_value = "3")]
        max_retries: u32,
        /// Resume at this chunk, appending to the output file
        #[arg(long, default_value = "0")]
        start_at: u32,
        /// Refuse to commit more than this many atomic units in total
        #[arg(long)]
        budget: Option<u64>,
    },
    /// Create a payer signing key
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
    /// Print an asset's chunk layout and price
    Info {
        #[arg(long)]
        server: String,
        #[arg(long)]
        asset: String,
    },
}

impl Cli {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            storage_dir: self.storage_dir.clone(),
            gate: GateConfig {
                pay_to: self.pay_to.clone(),
                network: self.network.clone(),
                replay_window: Duration::from_secs(self.replay_window_secs),
                verify_timeout: Duration::from_secs(self.verify_timeout_secs),
                ..GateConfig::default()
            },
            facilitator_url: self.facilitator_url.clone(),
        }
    }
}
