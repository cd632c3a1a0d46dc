//! `boardsync pull`: bring board edits into the local task file.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use boardsync_sync::{PullPolicy, PullReport};

use super::{build_engine, dry_run_prefix};
use crate::config::Config;

/// Arguments for `boardsync pull`.
#[derive(Args, Debug)]
pub struct PullArgs {
    /// Classify items without writing the task file or mapping.
    #[arg(long)]
    pub dry_run: bool,

    /// Take the board's version even when both sides changed.
    #[arg(long)]
    pub force: bool,

    /// Leave records changed on both sides untouched instead of failing.
    #[arg(long, conflicts_with = "force")]
    pub skip_conflicts: bool,

    /// Do not create local records for board items that have none.
    #[arg(long)]
    pub no_recreate: bool,

    /// Delete local records whose board item is gone.
    #[arg(long)]
    pub remove_orphaned: bool,

    /// Only pull the item carrying this local id.
    #[arg(long)]
    pub id: Option<String>,

    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PullArgs {
    pub async fn run(self, config: &Config) -> Result<()> {
        let engine = build_engine(config, false)?;
        let policy = PullPolicy {
            force_overwrite: self.force,
            skip_conflicts: self.skip_conflicts,
            recreate_missing: !self.no_recreate,
            remove_orphaned: self.remove_orphaned,
            only: self.id.map(Into::into),
            dry_run: self.dry_run,
        };
        let report = engine
            .pull(&policy)
            .await
            .with_context(|| format!("pull from board {} failed", config.board_id))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize pull report")?
            );
        } else {
            print_report(&report, &config.board_id);
        }
        if report.has_errors() {
            bail!("{} item(s) could not be pulled", report.errors.len());
        }
        if !report.conflicts.is_empty() {
            bail!(
                "{} conflict(s); rerun with --force or --skip-conflicts",
                report.conflicts.len()
            );
        }
        Ok(())
    }
}

fn print_report(report: &PullReport, board: &str) {
    let prefix = dry_run_prefix(report.dry_run);
    println!(
        "{prefix}{} pull from board {board}: {} new, {} updated, {} conflicts, {} orphaned, {} unchanged",
        "✓".green(),
        report.new.len(),
        report.updated.len(),
        report.conflicts.len(),
        report.orphaned_ids.len(),
        report.unchanged.len(),
    );

    for record in &report.new {
        println!("  {}  {} {}", "+".green(), record.id, record.title);
    }
    for updated in &report.updated {
        println!(
            "  {}  {} ({})",
            "~".yellow(),
            updated.local_id,
            updated.fields.join(", ")
        );
    }
    for id in &report.skipped {
        println!("  {}  {} skipped (changed on both sides)", "·".bright_black(), id);
    }
    for id in &report.orphaned_ids {
        println!("  {}  {} has no board item", "?".bright_black(), id);
    }
    for conflict in &report.conflicts {
        println!(
            "  {}  {} ↔ {}: {}",
            "✗".red(),
            conflict.local_id,
            conflict.remote_id,
            conflict.reason
        );
        for field in &conflict.fields {
            match &field.diff {
                Some(diff) => {
                    println!("       {}:", field.field.bold());
                    for line in diff.lines() {
                        println!("         {line}");
                    }
                }
                None => println!(
                    "       {}: local {:?}, board {:?}",
                    field.field.bold(),
                    field.local,
                    field.remote
                ),
            }
        }
    }
    for error in &report.errors {
        eprintln!("  {}  {}: {}", "!".red().bold(), error.record_id, error.error);
    }
}
