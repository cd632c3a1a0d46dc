//! `boardsync status`: mapping visibility.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use boardsync_sync::StatusReport;

use super::{build_engine, format_age};
use crate::config::Config;

/// Arguments for `boardsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct MappingRow {
    #[tabled(rename = "local id")]
    local_id: String,
    #[tabled(rename = "remote id")]
    remote_id: String,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "note")]
    note: String,
}

impl StatusArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let engine = build_engine(config, false)?;
        let report = engine.status().context("failed to read sync state")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report, config);
        Ok(())
    }
}

fn print_table(report: &StatusReport, config: &Config) {
    println!(
        "boardsync v{} | board {} | {} mapped | {} unmapped",
        env!("CARGO_PKG_VERSION"),
        config.board_id,
        report.mappings.len(),
        report.unmapped.len(),
    );

    if report.mappings.is_empty() {
        println!("No mappings yet. Run 'boardsync push' or 'boardsync pull'.");
    } else {
        let rows: Vec<MappingRow> = report
            .mappings
            .iter()
            .map(|entry| MappingRow {
                local_id: entry.local_id.to_string(),
                remote_id: entry.remote_id.to_string(),
                last_sync: format_age(entry.last_synced_at),
                note: entry.remote_note_id.clone().unwrap_or_default(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    if !report.unmapped.is_empty() {
        let ids: Vec<String> = report.unmapped.iter().map(ToString::to_string).collect();
        println!("{} not on the board: {}", "○".yellow(), ids.join(", "));
    }
    if !report.dangling.is_empty() {
        let ids: Vec<String> = report.dangling.iter().map(ToString::to_string).collect();
        println!(
            "{} mapped but missing locally: {}",
            "?".bright_black(),
            ids.join(", ")
        );
    }
}
