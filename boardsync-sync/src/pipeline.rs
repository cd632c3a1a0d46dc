//! Sync pipeline entrypoint shared by every command.
//!
//! [`Engine`] owns the collaborators of one board link and runs the
//! run-level steps around the reconcilers: reading the local collection,
//! fetching the remote set, and writing back afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use boardsync_core::{BoardRef, GroupRef, LocalId, LocalStore};

use crate::batcher::MutationBatcher;
use crate::columns::ColumnMapper;
use crate::error::SyncError;
use crate::mapping::{now_millis, MappingEntry, MappingStore};
use crate::pull::{apply_pull, plan_pull, PullPlan, PullPolicy, PullReport, PulledItem};
use crate::push::{push_records, PushContext, PushPolicy, PushReport};
use crate::remote::RemoteClient;
use crate::retry::{RetryPolicy, RetryingClient};

/// Where pushed items go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub board: BoardRef,
    /// Candidate groups in preference order; empty means the board's first.
    pub groups: Vec<GroupRef>,
}

/// Mapping overview returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub mappings: Vec<MappingEntry>,
    /// Local records with no mapping entry.
    pub unmapped: Vec<LocalId>,
    /// Mapping entries whose local record is gone.
    pub dangling: Vec<LocalId>,
}

/// One configured link between a local collection and a board.
pub struct Engine {
    local: Arc<dyn LocalStore>,
    mapping: MappingStore,
    remote: RetryingClient,
    columns: Arc<dyn ColumnMapper>,
    target: Target,
    batcher: Option<MutationBatcher>,
}

impl Engine {
    /// Remote calls are retried with the default [`RetryPolicy`].
    pub fn new(
        local: Arc<dyn LocalStore>,
        mapping: MappingStore,
        remote: Arc<dyn RemoteClient>,
        columns: Arc<dyn ColumnMapper>,
        target: Target,
    ) -> Self {
        Self {
            local,
            mapping,
            remote: RetryingClient::new(remote, RetryPolicy::default()),
            columns,
            target,
            batcher: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.remote = self.remote.with_policy(policy);
        self
    }

    /// Send push mutations through `batcher`.
    pub fn with_batcher(mut self, batcher: MutationBatcher) -> Self {
        self.batcher = Some(batcher);
        self
    }

    pub fn mapping(&self) -> &MappingStore {
        &self.mapping
    }

    /// Push the local collection to the board.
    pub async fn push(&self, policy: &PushPolicy) -> Result<PushReport, SyncError> {
        let original = self.local.read_all()?;
        let mut records = original.clone();
        let ctx = PushContext {
            mapping: &self.mapping,
            remote: &self.remote,
            columns: self.columns.as_ref(),
            board: &self.target.board,
            groups: &self.target.groups,
            batcher: self.batcher.as_ref(),
        };
        let report = push_records(&ctx, &mut records, policy).await?;

        if !policy.dry_run && records != original {
            self.local.write_all(&records)?;
            tracing::debug!("remote ids written back to local store");
        }
        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            recreated = report.recreated.len(),
            deleted = report.deleted.len(),
            errors = report.errors.len(),
            dry_run = policy.dry_run,
            "push finished"
        );
        Ok(report)
    }

    /// Pull the board into the local collection.
    pub async fn pull(&self, policy: &PullPolicy) -> Result<PullReport, SyncError> {
        let records = self.local.read_all()?;
        let items = self.remote.fetch_items(&self.target.board, None).await?;
        let pulled: Vec<PulledItem> = items
            .iter()
            .map(|item| PulledItem::decode(item, self.columns.as_ref()))
            .collect();
        if policy.dry_run {
            let state = self.mapping.load(true)?;
            return Ok(finish_pull(plan_pull(&pulled, &records, &state, policy)));
        }

        let session = self.mapping.begin().await?;
        let plan = plan_pull(&pulled, &records, session.state(), policy);
        if !plan.is_empty() {
            apply_pull(&plan, records, self.local.as_ref(), session)?;
        }
        Ok(finish_pull(plan))
    }

    /// Drop mapping entries not synced within `max_age`. With `dry_run`,
    /// only counts them.
    pub fn prune(&self, max_age: Duration, dry_run: bool) -> Result<usize, SyncError> {
        if !dry_run {
            return self.mapping.prune_older_than(max_age);
        }
        let cutoff = cutoff_for(max_age);
        Ok(self
            .mapping
            .list_all()?
            .iter()
            .filter(|e| cutoff.is_some_and(|c| e.last_synced_at < c))
            .count())
    }

    /// Current mappings plus the local records they do not cover.
    pub fn status(&self) -> Result<StatusReport, SyncError> {
        let records = self.local.read_all()?;
        let state = self.mapping.load(true)?;
        let unmapped = records
            .iter()
            .filter(|r| state.get_by_local(&r.id).is_none())
            .map(|r| r.id.clone())
            .collect();
        let dangling = state
            .entries()
            .iter()
            .filter(|e| !records.iter().any(|r| r.id == e.local_id))
            .map(|e| e.local_id.clone())
            .collect();
        Ok(StatusReport {
            mappings: state.entries().to_vec(),
            unmapped,
            dangling,
        })
    }
}

fn finish_pull(plan: PullPlan) -> PullReport {
    let report = plan.report;
    tracing::info!(
        new = report.new.len(),
        updated = report.updated.len(),
        conflicts = report.conflicts.len(),
        orphaned = report.orphaned_ids.len(),
        errors = report.errors.len(),
        dry_run = report.dry_run,
        "pull finished"
    );
    report
}

fn cutoff_for(max_age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| now_millis().checked_sub_signed(age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{ColumnMap, SyncedField};
    use crate::memory::MemoryBoard;
    use boardsync_core::{JsonTaskFile, Record};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, board: Arc<MemoryBoard>) -> Engine {
        let tasks = dir.path().join("tasks.json");
        let local = JsonTaskFile::new(&tasks);
        local
            .write_all(&[Record::new("1", "First"), Record::new("2", "Second")])
            .unwrap();
        Engine::new(
            Arc::new(local),
            MappingStore::new(dir.path().join("mappings.json")),
            board,
            Arc::new(ColumnMap::new("local_id").with(SyncedField::Status, "status")),
            Target {
                board: "b1".into(),
                groups: vec!["todo".into()],
            },
        )
    }

    #[tokio::test]
    async fn status_lists_unmapped_records() {
        let dir = TempDir::new().unwrap();
        let board = Arc::new(MemoryBoard::new("b1", &["todo"]));
        let engine = engine(&dir, board);
        let status = engine.status().unwrap();
        assert!(status.mappings.is_empty());
        assert_eq!(status.unmapped, vec![LocalId::from("1"), LocalId::from("2")]);

        engine.push(&PushPolicy::default()).await.unwrap();
        let status = engine.status().unwrap();
        assert_eq!(status.mappings.len(), 2);
        assert!(status.unmapped.is_empty());
        assert!(status.dangling.is_empty());
    }

    #[tokio::test]
    async fn prune_dry_run_only_counts() {
        let dir = TempDir::new().unwrap();
        let board = Arc::new(MemoryBoard::new("b1", &["todo"]));
        let engine = engine(&dir, board);
        engine.push(&PushPolicy::default()).await.unwrap();

        assert_eq!(engine.prune(Duration::from_secs(3600), true).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.prune(Duration::from_millis(1), true).unwrap(), 2);
        assert_eq!(engine.mapping().list_all().unwrap().len(), 2);
        assert_eq!(engine.prune(Duration::from_millis(1), false).unwrap(), 2);
        assert!(engine.mapping().load(true).unwrap().is_empty());
    }
}
