pub mod prune;
pub mod pull;
pub mod push;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use boardsync_core::JsonTaskFile;
use boardsync_sync::{ColumnMap, Engine, MappingStore, MutationBatcher, Target};

use crate::board_api::HttpBoard;
use crate::config::Config;

/// Wire an [`Engine`] from `config`. With `batch`, pushes go through a
/// mutation batcher sized by `batch_size`.
pub fn build_engine(config: &Config, batch: bool) -> Result<Engine> {
    let columns = ColumnMap::from_table(&config.columns).context("invalid `columns` table")?;
    let token = std::env::var(&config.api_token_env).ok();
    let client = Arc::new(HttpBoard::new(
        config.api_url.clone(),
        token,
        config.api_token_env.clone(),
    ));

    let mut local = JsonTaskFile::new(&config.tasks_file);
    if let Some(tag) = &config.tag {
        local = local.with_tag(tag.clone());
    }
    let mapping = MappingStore::new(&config.mapping_file)
        .with_lock_options(config.lock_options())
        .with_cache_ttl(config.cache_ttl());
    let target = Target {
        board: config.board_id.as_str().into(),
        groups: config.groups.iter().map(|g| g.as_str().into()).collect(),
    };

    let retry = config.retry_policy();
    let engine = Engine::new(Arc::new(local), mapping, client.clone(), Arc::new(columns), target)
        .with_retry(retry);
    if batch && config.batch_size > 1 {
        let batcher = MutationBatcher::new(client, config.batch_size).with_retry(retry);
        return Ok(engine.with_batcher(batcher));
    }
    Ok(engine)
}

/// `42s`, `5m`, `3h`, `2d`.
pub fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 60 * 60 => format!("{}m", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h", s / (60 * 60)),
        s => format!("{}d", s / (60 * 60 * 24)),
    }
}

pub fn dry_run_prefix(dry_run: bool) -> &'static str {
    if dry_run {
        "[dry-run] "
    } else {
        ""
    }
}
