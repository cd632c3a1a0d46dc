//! boardsync: keep a local task file and a remote board in step.
//!
//! # Usage
//!
//! ```text
//! boardsync push [--dry-run] [--delete-orphaned] [--no-batch] [--annotate] [--json]
//! boardsync pull [--dry-run] [--force | --skip-conflicts] [--no-recreate]
//!                [--remove-orphaned] [--id ID] [--json]
//! boardsync status [--json]
//! boardsync prune --max-age-days N [--dry-run]
//! ```
//!
//! Every command reads `~/.boardsync/config.yaml` unless `--config` says
//! otherwise. The API token comes from the environment variable named by
//! `api_token_env`.

mod board_api;
mod commands;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{prune::PruneArgs, pull::PullArgs, push::PushArgs, status::StatusArgs};
use config::Config;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "boardsync",
    version,
    about = "Synchronize a local task file with a remote board",
    long_about = None,
)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, update and recreate board items from local records.
    Push(PushArgs),

    /// Apply board edits to the local task file.
    Pull(PullArgs),

    /// Show the mapping between local records and board items.
    Status(StatusArgs),

    /// Remove mapping entries that have not synced recently.
    Prune(PruneArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    match cli.command {
        Commands::Push(args) => args.run(&config).await,
        Commands::Pull(args) => args.run(&config).await,
        Commands::Status(args) => args.run(&config),
        Commands::Prune(args) => args.run(&config),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
