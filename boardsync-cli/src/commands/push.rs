//! `boardsync push`: send local records to the board.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use boardsync_sync::{PushPolicy, PushReport};

use super::{build_engine, dry_run_prefix};
use crate::config::Config;

/// Arguments for `boardsync push`.
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Classify records without touching the board, mapping or task file.
    #[arg(long)]
    pub dry_run: bool,

    /// Delete board items whose local record no longer exists.
    #[arg(long)]
    pub delete_orphaned: bool,

    /// Issue one request per mutation instead of batching.
    #[arg(long)]
    pub no_batch: bool,

    /// Post record details as a note on newly created items.
    #[arg(long)]
    pub annotate: bool,

    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PushArgs {
    pub async fn run(self, config: &Config) -> Result<()> {
        let engine = build_engine(config, !self.no_batch)?;
        let policy = PushPolicy {
            delete_orphaned: self.delete_orphaned,
            dry_run: self.dry_run,
            annotate: self.annotate,
        };
        let report = engine
            .push(&policy)
            .await
            .with_context(|| format!("push to board {} failed", config.board_id))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize push report")?
            );
        } else {
            print_report(&report, &config.board_id);
        }
        if report.has_errors() {
            bail!("{} record(s) failed to push", report.errors.len());
        }
        Ok(())
    }
}

fn print_report(report: &PushReport, board: &str) {
    let prefix = dry_run_prefix(report.dry_run);
    if report.change_count() == 0 && report.errors.is_empty() && report.orphaned.is_empty() {
        println!(
            "{prefix}{} board {board} is up to date ({} unchanged)",
            "✓".green(),
            report.unchanged.len()
        );
        return;
    }
    println!(
        "{prefix}{} push to board {board}: {} created, {} updated, {} recreated, {} deleted, {} unchanged",
        "✓".green(),
        report.created.len(),
        report.updated.len(),
        report.recreated.len(),
        report.deleted.len(),
        report.unchanged.len(),
    );

    for created in &report.created {
        let remote = created
            .remote_id
            .as_ref()
            .map_or_else(|| "(new)".to_owned(), |id| id.to_string());
        println!("  {}  {} → {remote}", "+".green(), created.local_id);
    }
    for updated in &report.updated {
        let note = if updated.renamed { " (renamed)" } else { "" };
        println!(
            "  {}  {} → {}{note}",
            "~".yellow(),
            updated.local_id,
            updated.remote_id
        );
    }
    for recreated in &report.recreated {
        let new = recreated
            .new_remote_id
            .as_ref()
            .map_or_else(|| "(new)".to_owned(), |id| id.to_string());
        println!(
            "  {}  {} → {new} (was {})",
            "↻".cyan(),
            recreated.local_id,
            recreated.old_remote_id
        );
    }
    for deleted in &report.deleted {
        println!("  {}  {} ({})", "-".red(), deleted.local_id, deleted.remote_id);
    }
    for orphan in &report.orphaned {
        println!(
            "  {}  {} ({}) has no local record; use --delete-orphaned to remove it",
            "?".bright_black(),
            orphan.local_id,
            orphan.remote_id
        );
    }
    for error in &report.errors {
        eprintln!("  {}  {}: {}", "!".red().bold(), error.record_id, error.error);
    }
}
