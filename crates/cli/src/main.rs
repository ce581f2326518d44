//! vpactl - offline inspection tool for the vertical resource recommender
//!
//! Reads the same cluster snapshot and checkpoint files as the controller
//! and never writes to them.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{checkpoints, evictions, recommend};
use std::path::PathBuf;

/// Vertical resource recommender CLI
#[derive(Parser)]
#[command(name = "vpactl")]
#[command(author, version, about = "Inspect vertical resource recommendations offline", long_about = None)]
pub struct Cli {
    /// Cluster snapshot file (can also be set via VPA_SNAPSHOT_PATH env var)
    #[arg(long, env = "VPA_SNAPSHOT_PATH", default_value = "/var/lib/vpa/cluster.json")]
    pub snapshot: PathBuf,

    /// Checkpoint directory (can also be set via VPA_CHECKPOINT_DIR env var)
    #[arg(long, env = "VPA_CHECKPOINT_DIR", default_value = "/var/lib/vpa/checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compute recommendations from the snapshot and stored checkpoints
    Recommend {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,

        /// Ingest the snapshot's usage history before computing
        #[arg(long)]
        history: bool,
    },

    /// Inspect stored checkpoints
    #[command(subcommand)]
    Checkpoints(CheckpointCommands),

    /// Show which pods the updater would evict
    Evictions {
        /// Fraction of replicas of one controller that may be evicted at once
        #[arg(long, default_value_t = 0.5)]
        tolerance: f64,

        /// Groups with fewer live pods are never evicted from
        #[arg(long, default_value_t = 2)]
        min_replicas: u32,

        /// Smallest relative request change worth an eviction
        #[arg(long, default_value_t = 0.10)]
        min_change_priority: f64,
    },
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List checkpoints
    List {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show the usage percentiles stored in one checkpoint
    Inspect {
        /// Checkpoint to inspect (format: namespace/name)
        checkpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Recommend { namespace, history } => {
            recommend::show_recommendations(
                &cli.snapshot,
                &cli.checkpoint_dir,
                namespace,
                history,
                cli.format,
            )
            .await?;
        }
        Commands::Checkpoints(checkpoints_cmd) => match checkpoints_cmd {
            CheckpointCommands::List { namespace } => {
                checkpoints::list_checkpoints(&cli.checkpoint_dir, namespace, cli.format).await?;
            }
            CheckpointCommands::Inspect { checkpoint } => {
                checkpoints::inspect_checkpoint(&cli.checkpoint_dir, &checkpoint, cli.format)
                    .await?;
            }
        },
        Commands::Evictions {
            tolerance,
            min_replicas,
            min_change_priority,
        } => {
            let config = evictions::plan_config(tolerance, min_replicas, min_change_priority);
            evictions::show_eviction_plan(&cli.snapshot, config, cli.format).await?;
        }
    }

    Ok(())
}
