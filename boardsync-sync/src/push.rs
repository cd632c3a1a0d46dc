//! Push reconciler: local records → remote board.
//!
//! Each record is classified against its mapping entry and the live remote
//! item, then created, updated, recreated or left alone. Mutations go
//! through the [`MutationBatcher`] when one is supplied. Failures are
//! collected per record; only group resolution and the mapping lock abort
//! the run.

use std::collections::HashSet;

use serde::Serialize;

use boardsync_core::{BoardRef, GroupRef, LocalId, Record, RemoteId, RemoteItem};

use crate::batcher::{Mutation, MutationBatcher, MutationHandle};
use crate::columns::ColumnMapper;
use crate::error::{RemoteError, SyncError};
use crate::mapping::{MappingEntry, MappingState, MappingStore};
use crate::remote::{RemoteClient, NAME_FIELD};

/// Switches for one push run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushPolicy {
    /// Delete remote items whose local record is gone.
    pub delete_orphaned: bool,
    /// Classify only; no remote, mapping or local writes.
    pub dry_run: bool,
    /// Post the record details as a note on newly created items.
    pub annotate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Created {
    pub local_id: LocalId,
    /// `None` on a dry run.
    pub remote_id: Option<RemoteId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Updated {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    /// The item name was changed to the record title.
    pub renamed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recreated {
    pub local_id: LocalId,
    pub old_remote_id: RemoteId,
    /// `None` on a dry run.
    pub new_remote_id: Option<RemoteId>,
}

/// A mapping whose local record no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedPair {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
}

/// A failure confined to one record or item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub record_id: String,
    pub error: String,
}

impl RecordError {
    pub fn new(record_id: impl ToString, error: impl ToString) -> Self {
        Self {
            record_id: record_id.to_string(),
            error: error.to_string(),
        }
    }
}

/// Outcome of a push run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub dry_run: bool,
    pub created: Vec<Created>,
    pub updated: Vec<Updated>,
    pub recreated: Vec<Recreated>,
    pub deleted: Vec<OrphanedPair>,
    pub orphaned: Vec<OrphanedPair>,
    pub unchanged: Vec<LocalId>,
    pub errors: Vec<RecordError>,
}

impl PushReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Number of remote writes this run made (or would make).
    pub fn change_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.recreated.len() + self.deleted.len()
    }
}

/// Collaborators for one push run.
pub struct PushContext<'a> {
    pub mapping: &'a MappingStore,
    pub remote: &'a dyn RemoteClient,
    pub columns: &'a dyn ColumnMapper,
    pub board: &'a BoardRef,
    pub groups: &'a [GroupRef],
    pub batcher: Option<&'a MutationBatcher>,
}

enum Action {
    Create { stale: Option<RemoteId> },
    Update { remote_id: RemoteId, renamed: bool },
}

enum Pending {
    Queued(MutationHandle),
    Done(Result<RemoteItem, RemoteError>),
}

impl Pending {
    async fn resolve(self) -> Result<RemoteItem, RemoteError> {
        match self {
            Pending::Queued(handle) => handle.await,
            Pending::Done(result) => result,
        }
    }
}

struct Planned {
    index: usize,
    action: Action,
    pending: Option<Pending>,
}

/// Push `records` to the board.
///
/// On success, `remote_id` back-references in `records` are updated in
/// place; the caller decides whether to write them back.
pub async fn push_records(
    ctx: &PushContext<'_>,
    records: &mut [Record],
    policy: &PushPolicy,
) -> Result<PushReport, SyncError> {
    let mut report = PushReport {
        dry_run: policy.dry_run,
        ..PushReport::default()
    };
    // A real run holds the mapping lock from classification to the final
    // write, so a held lock aborts before any remote mutation.
    let mut session = if policy.dry_run {
        None
    } else {
        Some(ctx.mapping.begin().await?)
    };
    let state = match &session {
        Some(session) => session.state().clone(),
        None => ctx.mapping.load(true)?,
    };
    let group = resolve_group(ctx).await?;
    tracing::debug!(board = %ctx.board, group = %group, records = records.len(), "push started");

    let mut planned = Vec::new();
    let mut seen = HashSet::new();
    for (index, record) in records.iter().enumerate() {
        if record.id.0.trim().is_empty() {
            report
                .errors
                .push(RecordError::new(index, "record has no local id"));
            continue;
        }
        if !seen.insert(record.id.clone()) {
            report
                .errors
                .push(RecordError::new(&record.id, "duplicate local id"));
            continue;
        }
        match classify(ctx, &state, record).await {
            Ok(Some(action)) => planned.push(Planned {
                index,
                action,
                pending: None,
            }),
            Ok(None) => report.unchanged.push(record.id.clone()),
            Err(err) => report.errors.push(RecordError::new(&record.id, err)),
        }
    }

    if policy.dry_run {
        for plan in &planned {
            let local_id = records[plan.index].id.clone();
            record_outcome(&mut report, local_id, &plan.action, None);
        }
        scan_orphans(ctx, &state, records, policy, &mut report).await;
        return Ok(report);
    }

    for plan in &mut planned {
        let record = &records[plan.index];
        let mutation = build_mutation(ctx, &group, record, &plan.action);
        plan.pending = Some(submit(ctx, mutation).await);
    }
    if let Some(batcher) = ctx.batcher {
        batcher.flush().await;
    }

    let mut agreements = Vec::new();
    let mut stale = Vec::new();
    for plan in planned {
        let record = &mut records[plan.index];
        if let Action::Create { stale: Some(old) } = &plan.action {
            stale.push(old.clone());
        }
        let Some(pending) = plan.pending else {
            continue;
        };
        let item = match pending.resolve().await {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!(local_id = %record.id, error = %err, "push failed for record");
                report.errors.push(RecordError::new(&record.id, err));
                continue;
            }
        };
        tracing::info!(local_id = %record.id, remote_id = %item.id, "pushed record");

        let mut entry = MappingEntry::new(item.id.clone(), record.id.clone(), item.updated_at)
            .with_fingerprint(record.fingerprint());
        if policy.annotate && matches!(plan.action, Action::Create { .. }) {
            entry.remote_note_id = annotate(ctx, record, &item.id).await;
        }
        record.remote_id = Some(item.id.clone());
        record_outcome(&mut report, record.id.clone(), &plan.action, Some(item.id));
        agreements.push(entry);
    }

    // Mapped records that did not need a write still get their back-reference.
    {
        let unchanged: HashSet<&LocalId> = report.unchanged.iter().collect();
        for record in records.iter_mut().filter(|r| unchanged.contains(&r.id)) {
            if let Some(entry) = state.get_by_local(&record.id) {
                if record.remote_id.as_ref() != Some(&entry.remote_id) {
                    record.remote_id = Some(entry.remote_id.clone());
                }
            }
        }
    }

    let removed = scan_orphans(ctx, &state, records, policy, &mut report).await;

    if let Some(mut session) = session.take() {
        if !(agreements.is_empty() && stale.is_empty() && removed.is_empty()) {
            let state = session.state_mut();
            for old in &stale {
                state.remove(old);
            }
            for remote_id in &removed {
                state.remove(remote_id);
            }
            for entry in agreements {
                state.upsert(entry);
            }
            session.commit()?;
        }
    }
    Ok(report)
}

/// The first configured group present on the board, else the board's
/// first group.
async fn resolve_group(ctx: &PushContext<'_>) -> Result<GroupRef, SyncError> {
    let available = ctx.remote.list_groups(ctx.board).await?;
    let chosen = if ctx.groups.is_empty() {
        available.first().map(|g| g.id.clone())
    } else {
        ctx.groups
            .iter()
            .find(|wanted| available.iter().any(|g| &g.id == *wanted))
            .cloned()
    };
    chosen.ok_or_else(|| SyncError::NoTargetGroup {
        board: ctx.board.clone(),
    })
}

async fn classify(
    ctx: &PushContext<'_>,
    state: &MappingState,
    record: &Record,
) -> Result<Option<Action>, RemoteError> {
    let Some(entry) = state.get_by_local(&record.id) else {
        // A back-reference without a mapping (lost mapping file) is adopted
        // when the item still exists.
        if let Some(remote_id) = &record.remote_id {
            if let Some(item) = ctx.remote.get_item(remote_id).await? {
                tracing::debug!(local_id = %record.id, remote_id = %item.id, "adopting back-referenced item");
                return Ok(Some(Action::Update {
                    renamed: item.name != record.title,
                    remote_id: item.id,
                }));
            }
        }
        tracing::debug!(local_id = %record.id, "unmapped, will create");
        return Ok(Some(Action::Create { stale: None }));
    };
    let Some(item) = ctx.remote.get_item(&entry.remote_id).await? else {
        tracing::debug!(local_id = %record.id, remote_id = %entry.remote_id, "remote item gone, will recreate");
        return Ok(Some(Action::Create {
            stale: Some(entry.remote_id.clone()),
        }));
    };
    let renamed = item.name != record.title;
    let fingerprint = record.fingerprint();
    if !renamed && entry.local_fingerprint.as_deref() == Some(fingerprint.as_str()) {
        tracing::debug!(local_id = %record.id, "unchanged since last sync");
        return Ok(None);
    }
    Ok(Some(Action::Update {
        remote_id: item.id,
        renamed,
    }))
}

fn build_mutation(
    ctx: &PushContext<'_>,
    group: &GroupRef,
    record: &Record,
    action: &Action,
) -> Mutation {
    let mut fields = ctx.columns.to_fields(record);
    match action {
        Action::Create { .. } => Mutation::CreateItem {
            board: ctx.board.clone(),
            group: group.clone(),
            name: record.title.clone(),
            fields,
        },
        Action::Update { remote_id, renamed } => {
            if *renamed {
                fields.insert(NAME_FIELD.to_owned(), record.title.clone().into());
            }
            Mutation::UpdateItem {
                board: ctx.board.clone(),
                id: remote_id.clone(),
                fields,
            }
        }
    }
}

async fn submit(ctx: &PushContext<'_>, mutation: Mutation) -> Pending {
    if let Some(batcher) = ctx.batcher {
        return Pending::Queued(batcher.enqueue(mutation).await);
    }
    let result = match &mutation {
        Mutation::CreateItem {
            board,
            group,
            name,
            fields,
        } => ctx.remote.create_item(board, group, name, fields).await,
        Mutation::UpdateItem { board, id, fields } => {
            ctx.remote.update_item(board, id, fields).await
        }
    };
    Pending::Done(result)
}

fn record_outcome(
    report: &mut PushReport,
    local_id: LocalId,
    action: &Action,
    remote_id: Option<RemoteId>,
) {
    match action {
        Action::Create { stale: None } => report.created.push(Created {
            local_id,
            remote_id,
        }),
        Action::Create { stale: Some(old) } => report.recreated.push(Recreated {
            local_id,
            old_remote_id: old.clone(),
            new_remote_id: remote_id,
        }),
        Action::Update {
            remote_id: target,
            renamed,
        } => report.updated.push(Updated {
            local_id,
            remote_id: remote_id.unwrap_or_else(|| target.clone()),
            renamed: *renamed,
        }),
    }
}

async fn annotate(ctx: &PushContext<'_>, record: &Record, remote_id: &RemoteId) -> Option<String> {
    let body = if record.details.trim().is_empty() {
        record.description.as_str()
    } else {
        record.details.as_str()
    };
    if body.trim().is_empty() {
        return None;
    }
    match ctx.remote.post_note(remote_id, body).await {
        Ok(note_id) => Some(note_id),
        Err(err) => {
            tracing::warn!(local_id = %record.id, error = %err, "could not post note");
            None
        }
    }
}

/// Report mappings whose local record is gone; delete them remotely when
/// asked. Returns the remote ids whose mappings should be dropped.
async fn scan_orphans(
    ctx: &PushContext<'_>,
    state: &MappingState,
    records: &[Record],
    policy: &PushPolicy,
    report: &mut PushReport,
) -> Vec<RemoteId> {
    let present: HashSet<&LocalId> = records.iter().map(|r| &r.id).collect();
    let mut removed = Vec::new();
    for entry in state.entries() {
        if present.contains(&entry.local_id) {
            continue;
        }
        let pair = OrphanedPair {
            local_id: entry.local_id.clone(),
            remote_id: entry.remote_id.clone(),
        };
        if !policy.delete_orphaned {
            report.orphaned.push(pair);
            continue;
        }
        if policy.dry_run {
            report.deleted.push(pair);
            continue;
        }
        match ctx.remote.delete_item(&entry.remote_id).await {
            Ok(existed) => {
                tracing::info!(local_id = %entry.local_id, remote_id = %entry.remote_id, existed, "deleted orphaned item");
                removed.push(entry.remote_id.clone());
                report.deleted.push(pair);
            }
            Err(err) => report.errors.push(RecordError::new(&entry.local_id, err)),
        }
    }
    removed
}
