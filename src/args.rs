use clap::{Parser, Subcommand};
use std::path::PathBuf;
use worker_bridge::WorkerType;

#[derive(Parser)]
#[command(name = "worker-bridge")]
#[command(version)]
#[command(about = "Drive per-domain worker processes over the JSON line protocol", long_about = None)]
pub(crate) struct Cli {
    /// Config file to use instead of $WORKER_BRIDGE_CONFIG or the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Send one action to a worker and print the response data
    Call {
        /// Worker type (device, memory, model, processing, inference, postprocessing)
        worker: WorkerType,

        /// Action name, with or without the domain prefix
        action: String,

        /// JSON payload sent as the request data
        #[arg(long)]
        data: Option<String>,

        /// Override the configured call timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print every entity of a domain
    List {
        domain: WorkerType,
    },

    /// Print one entity of a domain, refreshing the listing if needed
    Ensure {
        domain: WorkerType,

        /// Entity id as it appears in the listing
        id: String,
    },

    /// Show configured workers
    Status {
        /// Start every configured worker and run one health probe
        #[arg(long)]
        probe: bool,

        /// Number of recent diagnostic lines to include per worker
        #[arg(short = 'n', long, default_value = "0")]
        lines: usize,
    },

    /// Print the resolved configuration
    Config,
}
