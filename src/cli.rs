use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `Fleetpost` - guardrailed multi-channel outbound dispatch.
#[derive(Parser, Debug)]
#[command(name = "fleetpost")]
#[command(version)]
#[command(about = "Guardrailed multi-channel outbound dispatch.", long_about = None)]
pub struct Cli {
    /// Config file to load (default: ~/.fleetpost/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one dispatch batch through the guardrails gateway
    Dispatch {
        /// Cadence to serve (primary, follow_up, revival)
        #[arg(short, long, default_value = "primary")]
        motion: String,

        /// Plan and report the batch without sending anything
        #[arg(long)]
        dry_run: bool,

        /// Batch approval token minted by a prior dry run
        #[arg(long)]
        token: Option<String>,
    },

    /// Inspect and work the artifact queue
    Queue {
        #[command(subcommand)]
        queue_command: QueueCommands,
    },

    /// Show warmup, circuit, and queue state
    Status,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List artifacts awaiting review
    List {
        /// Maximum artifacts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Show the approved backlog instead of pending review
        #[arg(long)]
        approved: bool,
    },

    /// Approve a pending artifact for dispatch
    Approve {
        /// Artifact id
        id: String,
    },

    /// Reject a pending artifact
    Reject {
        /// Artifact id
        id: String,
    },
}
