//! `boardsync prune`: drop mapping entries that have not synced in a while.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use super::{build_engine, dry_run_prefix};
use crate::config::Config;

/// Arguments for `boardsync prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Remove entries whose last sync is older than this many days.
    #[arg(long)]
    pub max_age_days: u64,

    /// Only count matching entries.
    #[arg(long)]
    pub dry_run: bool,
}

impl PruneArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let engine = build_engine(config, false)?;
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);
        let count = engine
            .prune(max_age, self.dry_run)
            .context("failed to prune mappings")?;
        let verb = if self.dry_run { "would remove" } else { "removed" };
        println!(
            "{}{verb} {count} mapping(s) older than {} day(s)",
            dry_run_prefix(self.dry_run),
            self.max_age_days
        );
        Ok(())
    }
}
