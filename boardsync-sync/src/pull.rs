//! Pull reconciler: remote board → local records.
//!
//! Planning is pure: [`plan_pull`] classifies every decoded remote item
//! against the local collection and the mapping state. [`apply_pull`] then
//! writes the local store once and the mapping store once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use similar::TextDiff;

use boardsync_core::{LocalId, LocalStore, Record, RecordPatch, RemoteId, RemoteItem};

use crate::columns::ColumnMapper;
use crate::error::SyncError;
use crate::mapping::{MappingEntry, MappingSession, MappingState};
use crate::push::RecordError;

/// Switches for one pull run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPolicy {
    /// Take the remote version even when both sides changed.
    pub force_overwrite: bool,
    /// Leave conflicting records alone instead of reporting a conflict.
    pub skip_conflicts: bool,
    /// Insert local records for remote items that have none.
    pub recreate_missing: bool,
    /// Delete local records whose remote item is gone.
    pub remove_orphaned: bool,
    /// Only consider the item carrying this local id.
    pub only: Option<LocalId>,
    pub dry_run: bool,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self {
            force_overwrite: false,
            skip_conflicts: false,
            recreate_missing: true,
            remove_orphaned: false,
            only: None,
            dry_run: false,
        }
    }
}

/// A remote item decoded into record shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledItem {
    pub remote_id: RemoteId,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub patch: RecordPatch,
}

impl PulledItem {
    pub fn decode(item: &RemoteItem, columns: &dyn ColumnMapper) -> Self {
        let mut patch = columns.decode(item);
        if patch.title.is_none() {
            patch.title = Some(item.name.clone());
        }
        Self {
            remote_id: item.id.clone(),
            name: item.name.clone(),
            updated_at: item.updated_at,
            patch,
        }
    }
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub field: &'static str,
    pub local: String,
    pub remote: String,
    /// Unified diff for multi-line text fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub reason: String,
    pub fields: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledUpdate {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub fields: Vec<&'static str>,
}

/// Outcome of a pull run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub dry_run: bool,
    pub new: Vec<Record>,
    pub updated: Vec<PulledUpdate>,
    pub conflicts: Vec<ConflictRecord>,
    /// Local ids re-created from the board; always a subset of `new`.
    pub recreated: Vec<LocalId>,
    pub orphaned_ids: Vec<LocalId>,
    pub unchanged: Vec<LocalId>,
    /// Conflicts left alone because of `skip_conflicts`.
    pub skipped: Vec<LocalId>,
    pub errors: Vec<RecordError>,
}

impl PullReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.new.len() + self.updated.len() + self.orphaned_ids.len()
    }
}

/// Writes computed by [`plan_pull`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPlan {
    pub report: PullReport,
    /// Replacements for existing records.
    updates: Vec<Record>,
    removals: Vec<LocalId>,
    agreements: Vec<MappingEntry>,
}

impl PullPlan {
    /// True when applying the plan would not write anything.
    pub fn is_empty(&self) -> bool {
        self.report.new.is_empty()
            && self.updates.is_empty()
            && self.removals.is_empty()
            && self.agreements.is_empty()
    }
}

/// Classify `items` against `records` and `state`.
pub fn plan_pull(
    items: &[PulledItem],
    records: &[Record],
    state: &MappingState,
    policy: &PullPolicy,
) -> PullPlan {
    let mut plan = PullPlan {
        report: PullReport {
            dry_run: policy.dry_run,
            ..PullReport::default()
        },
        ..PullPlan::default()
    };
    let by_id: HashMap<&LocalId, &Record> = records.iter().map(|r| (&r.id, r)).collect();
    let fetched: HashSet<&RemoteId> = items.iter().map(|i| &i.remote_id).collect();
    let mut claimed: HashMap<LocalId, RemoteId> = HashMap::new();

    for item in items {
        let Some(local_id) = item.patch.local_id.clone() else {
            tracing::debug!(remote_id = %item.remote_id, "remote item has no local id");
            plan.report.errors.push(RecordError::new(
                &item.remote_id,
                SyncError::Validation(format!("item '{}' has no local id", item.name)),
            ));
            continue;
        };
        if policy.only.as_ref().is_some_and(|only| only != &local_id) {
            continue;
        }
        if let Some(first) = claimed.get(&local_id) {
            plan.report.conflicts.push(ConflictRecord {
                local_id,
                remote_id: item.remote_id.clone(),
                reason: format!("remote item {first} already carries this local id"),
                fields: vec![],
            });
            continue;
        }
        claimed.insert(local_id.clone(), item.remote_id.clone());

        let Some(record) = by_id.get(&local_id).copied() else {
            plan_missing(&mut plan, item, policy);
            continue;
        };
        if let Some(reason) = ambiguous_identity(item, record, state, &by_id, &fetched) {
            tracing::debug!(local_id = %local_id, remote_id = %item.remote_id, %reason, "ambiguous identity");
            plan.report.conflicts.push(ConflictRecord {
                local_id,
                remote_id: item.remote_id.clone(),
                reason,
                fields: diff_fields(record, &item.patch),
            });
            continue;
        }
        plan_existing(&mut plan, item, record, state, policy);
    }

    if policy.only.is_none() {
        for record in records {
            let Some(remote_id) = &record.remote_id else {
                continue;
            };
            if fetched.contains(remote_id) || claimed.contains_key(&record.id) {
                continue;
            }
            tracing::debug!(local_id = %record.id, remote_id = %remote_id, "local record orphaned");
            plan.report.orphaned_ids.push(record.id.clone());
            if policy.remove_orphaned {
                plan.removals.push(record.id.clone());
            }
        }
    }
    plan
}

fn plan_missing(plan: &mut PullPlan, item: &PulledItem, policy: &PullPolicy) {
    let Some(mut record) = item.patch.to_record() else {
        return;
    };
    if !policy.recreate_missing {
        tracing::debug!(local_id = %record.id, "no local record, recreation disabled");
        return;
    }
    record.remote_id = Some(item.remote_id.clone());
    plan.agreements.push(
        MappingEntry::new(item.remote_id.clone(), record.id.clone(), item.updated_at)
            .with_fingerprint(record.fingerprint()),
    );
    plan.report.recreated.push(record.id.clone());
    plan.report.new.push(record);
}

fn plan_existing(
    plan: &mut PullPlan,
    item: &PulledItem,
    record: &Record,
    state: &MappingState,
    policy: &PullPolicy,
) {
    let local_id = record.id.clone();
    let diffs = diff_fields(record, &item.patch);
    let entry = state
        .get_by_local(&local_id)
        .filter(|e| e.remote_id == item.remote_id);
    let linked = record.remote_id.as_ref() == Some(&item.remote_id);

    if diffs.is_empty() {
        let fingerprint = record.fingerprint();
        let agreed = entry.is_some_and(|e| e.local_fingerprint.as_ref() == Some(&fingerprint));
        if !agreed {
            plan.agreements.push(
                MappingEntry::new(item.remote_id.clone(), local_id.clone(), item.updated_at)
                    .with_fingerprint(fingerprint),
            );
        }
        if !linked {
            let mut relinked = record.clone();
            relinked.remote_id = Some(item.remote_id.clone());
            plan.updates.push(relinked);
        }
        plan.report.unchanged.push(local_id);
        return;
    }

    if !policy.force_overwrite {
        if let Some(entry) = entry {
            let remote_changed = item.updated_at > entry.last_synced_at;
            // Without a stored fingerprint a differing record cannot be shown
            // to be unchanged locally.
            let local_changed = !entry
                .local_fingerprint
                .as_ref()
                .is_some_and(|fp| *fp == record.fingerprint());
            if remote_changed && local_changed {
                if policy.skip_conflicts {
                    tracing::debug!(local_id = %local_id, "conflict skipped");
                    plan.report.unchanged.push(local_id.clone());
                    plan.report.skipped.push(local_id);
                } else {
                    tracing::debug!(local_id = %local_id, "both sides changed since last sync");
                    plan.report.conflicts.push(ConflictRecord {
                        local_id,
                        remote_id: item.remote_id.clone(),
                        reason: "changed locally and remotely since last sync".to_owned(),
                        fields: diffs,
                    });
                }
                return;
            }
            if local_changed {
                tracing::debug!(local_id = %local_id, "local is ahead, leaving for push");
                plan.report.unchanged.push(local_id);
                return;
            }
        }
    }

    let mut updated = record.clone();
    updated.apply_patch(&item.patch);
    updated.remote_id = Some(item.remote_id.clone());
    plan.agreements.push(
        MappingEntry::new(item.remote_id.clone(), local_id.clone(), item.updated_at)
            .with_fingerprint(updated.fingerprint()),
    );
    plan.report.updated.push(PulledUpdate {
        local_id,
        remote_id: item.remote_id.clone(),
        fields: diffs.iter().map(|d| d.field).collect(),
    });
    plan.updates.push(updated);
}

/// Reason the item cannot be paired with `record`, if any.
fn ambiguous_identity(
    item: &PulledItem,
    record: &Record,
    state: &MappingState,
    by_id: &HashMap<&LocalId, &Record>,
    fetched: &HashSet<&RemoteId>,
) -> Option<String> {
    if let Some(entry) = state.get_by_remote(&item.remote_id) {
        if entry.local_id != record.id && by_id.contains_key(&entry.local_id) {
            return Some(format!(
                "remote item is mapped to local record {}",
                entry.local_id
            ));
        }
    }
    let linked = record
        .remote_id
        .as_ref()
        .or_else(|| state.get_by_local(&record.id).map(|e| &e.remote_id));
    match linked {
        Some(other) if other != &item.remote_id && fetched.contains(other) => Some(format!(
            "local record is linked to remote item {other}"
        )),
        _ => None,
    }
}

/// Differences between `record` and the fields present in `patch`.
pub fn diff_fields(record: &Record, patch: &RecordPatch) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    let mut text = |field: &'static str, local: &str, remote: Option<&String>| {
        if let Some(remote) = remote {
            if local != remote {
                diffs.push(FieldDiff {
                    field,
                    local: local.to_owned(),
                    remote: remote.clone(),
                    diff: unified_diff(local, remote),
                });
            }
        }
    };
    text("title", &record.title, patch.title.as_ref());
    text("description", &record.description, patch.description.as_ref());
    text("details", &record.details, patch.details.as_ref());
    text("testStrategy", &record.test_strategy, patch.test_strategy.as_ref());

    if let Some(status) = &patch.status {
        if status != &record.status {
            diffs.push(label_diff("status", record.status.to_string(), status.to_string()));
        }
    }
    if let Some(priority) = patch.priority {
        if priority != record.priority {
            diffs.push(label_diff("priority", record.priority.to_string(), priority.to_string()));
        }
    }
    if let Some(deps) = &patch.dependencies {
        let local = record.dependency_set();
        let remote = boardsync_core::types::normalize_dependencies(deps);
        if local != remote {
            diffs.push(label_diff("dependencies", join(&local), join(&remote)));
        }
    }
    diffs
}

fn label_diff(field: &'static str, local: String, remote: String) -> FieldDiff {
    FieldDiff {
        field,
        local,
        remote,
        diff: None,
    }
}

fn unified_diff(local: &str, remote: &str) -> Option<String> {
    if !local.contains('\n') && !remote.contains('\n') {
        return None;
    }
    Some(
        TextDiff::from_lines(local, remote)
            .unified_diff()
            .header("local", "remote")
            .to_string(),
    )
}

fn join(ids: &[LocalId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Apply `plan` to `records`: one local write, then one mapping write
/// through the held `session`.
///
/// Returns the collection as written.
pub fn apply_pull(
    plan: &PullPlan,
    mut records: Vec<Record>,
    local: &dyn LocalStore,
    mut session: MappingSession<'_>,
) -> Result<Vec<Record>, SyncError> {
    let content_changed =
        !(plan.report.new.is_empty() && plan.updates.is_empty() && plan.removals.is_empty());
    if content_changed {
        let updates: HashMap<&LocalId, &Record> = plan.updates.iter().map(|r| (&r.id, r)).collect();
        for record in records.iter_mut() {
            if let Some(updated) = updates.get(&record.id) {
                *record = (*updated).clone();
            }
        }
        let removals: HashSet<&LocalId> = plan.removals.iter().collect();
        records.retain(|r| !removals.contains(&r.id));
        records.extend(plan.report.new.iter().cloned());
        local.write_all(&records)?;
        tracing::info!(
            new = plan.report.new.len(),
            updated = plan.report.updated.len(),
            removed = plan.removals.len(),
            "local collection written"
        );
    }

    if !(plan.agreements.is_empty() && plan.removals.is_empty()) {
        let state = session.state_mut();
        for local_id in &plan.removals {
            state.remove_local(local_id);
        }
        for entry in &plan.agreements {
            state.upsert(entry.clone());
        }
        session.commit()?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::TaskStatus;
    use chrono::Duration;

    fn item(remote: &str, local: &str, title: &str, at: DateTime<Utc>) -> PulledItem {
        PulledItem {
            remote_id: remote.into(),
            name: title.into(),
            updated_at: at,
            patch: RecordPatch {
                local_id: Some(local.into()),
                title: Some(title.into()),
                ..RecordPatch::default()
            },
        }
    }

    fn linked(id: &str, title: &str, remote: &str) -> Record {
        let mut record = Record::new(id, title);
        record.remote_id = Some(remote.into());
        record
    }

    fn synced(record: &Record, at: DateTime<Utc>) -> MappingState {
        let entry = MappingEntry::new(
            record.remote_id.clone().unwrap(),
            record.id.clone(),
            at,
        )
        .with_fingerprint(record.fingerprint());
        MappingState::from_entries(vec![entry], at)
    }

    #[test]
    fn identical_item_is_unchanged() {
        let now = Utc::now();
        let record = linked("1", "Same", "R1");
        let plan = plan_pull(
            &[item("R1", "1", "Same", now)],
            &[record.clone()],
            &synced(&record, now),
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.unchanged, vec![LocalId::from("1")]);
        assert!(plan.is_empty());
    }

    #[test]
    fn remote_only_change_updates() {
        let t0 = Utc::now();
        let record = linked("1", "Old", "R1");
        let plan = plan_pull(
            &[item("R1", "1", "New", t0 + Duration::seconds(5))],
            &[record.clone()],
            &synced(&record, t0),
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.updated.len(), 1);
        assert_eq!(plan.report.updated[0].fields, vec!["title"]);
    }

    #[test]
    fn local_only_change_is_left_for_push() {
        let t0 = Utc::now();
        let original = linked("1", "Old", "R1");
        let state = synced(&original, t0);
        let mut edited = original.clone();
        edited.title = "Edited locally".into();
        let plan = plan_pull(
            &[item("R1", "1", "Old", t0 - Duration::seconds(1))],
            &[edited],
            &state,
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.unchanged, vec![LocalId::from("1")]);
        assert!(plan.report.updated.is_empty());
    }

    #[test]
    fn both_sides_changed_is_a_conflict_with_field_diffs() {
        let t0 = Utc::now();
        let original = linked("1", "Old", "R1");
        let state = synced(&original, t0);
        let mut edited = original.clone();
        edited.title = "Local title".into();
        let items = [item("R1", "1", "Remote title", t0 + Duration::seconds(5))];

        let plan = plan_pull(&items, &[edited.clone()], &state, &PullPolicy::default());
        assert_eq!(plan.report.conflicts.len(), 1);
        let fields = &plan.report.conflicts[0].fields;
        assert_eq!(fields[0].field, "title");
        assert_eq!(fields[0].local, "Local title");
        assert_eq!(fields[0].remote, "Remote title");

        let skip = PullPolicy {
            skip_conflicts: true,
            ..PullPolicy::default()
        };
        let plan = plan_pull(&items, &[edited.clone()], &state, &skip);
        assert!(plan.report.conflicts.is_empty());
        assert_eq!(plan.report.skipped, vec![LocalId::from("1")]);

        let force = PullPolicy {
            force_overwrite: true,
            ..PullPolicy::default()
        };
        let plan = plan_pull(&items, &[edited], &state, &force);
        assert_eq!(plan.report.updated.len(), 1);
    }

    #[test]
    fn entry_without_fingerprint_still_detects_conflicts() {
        let t0 = Utc::now();
        let record = linked("1", "Local title", "R1");
        let entry = MappingEntry::new("R1".into(), "1".into(), t0);
        let state = MappingState::from_entries(vec![entry], t0);

        let newer = [item("R1", "1", "Remote title", t0 + Duration::seconds(30))];
        let plan = plan_pull(&newer, &[record.clone()], &state, &PullPolicy::default());
        assert_eq!(plan.report.conflicts.len(), 1);
        assert!(plan.report.updated.is_empty());
        assert!(plan.updates.is_empty());

        // Board untouched since the agreement: the difference is a local edit.
        let same_age = [item("R1", "1", "Remote title", t0)];
        let plan = plan_pull(&same_age, &[record], &state, &PullPolicy::default());
        assert!(plan.report.conflicts.is_empty());
        assert!(plan.report.updated.is_empty());
        assert_eq!(plan.report.unchanged, vec![LocalId::from("1")]);
    }

    #[test]
    fn record_linked_to_another_fetched_item_conflicts() {
        let now = Utc::now();
        let one = linked("1", "one", "R2");
        let two = Record::new("2", "two");
        let plan = plan_pull(
            &[item("R1", "1", "one", now), item("R2", "2", "two", now)],
            &[one, two],
            &MappingState::empty(),
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.conflicts.len(), 1);
        let conflict = &plan.report.conflicts[0];
        assert_eq!(conflict.local_id, LocalId::from("1"));
        assert_eq!(conflict.remote_id, RemoteId::from("R1"));
        assert!(conflict.reason.contains("linked to remote item R2"), "got: {}", conflict.reason);
        assert_eq!(plan.report.unchanged, vec![LocalId::from("2")]);
    }

    #[test]
    fn item_without_local_id_is_a_validation_error() {
        let mut orphan = item("R5", "5", "x", Utc::now());
        orphan.patch.local_id = None;
        let plan = plan_pull(&[orphan], &[], &MappingState::empty(), &PullPolicy::default());
        assert_eq!(plan.report.errors.len(), 1);
        assert_eq!(plan.report.errors[0].record_id, "R5");
        assert!(plan.report.new.is_empty());
    }

    #[test]
    fn missing_record_is_recreated_unless_disabled() {
        let items = [item("R9", "99", "From board", Utc::now())];
        let plan = plan_pull(&items, &[], &MappingState::empty(), &PullPolicy::default());
        assert_eq!(plan.report.new.len(), 1);
        assert_eq!(plan.report.new[0].id, LocalId::from("99"));
        assert_eq!(plan.report.new[0].remote_id, Some(RemoteId::from("R9")));
        assert_eq!(plan.report.recreated, vec![LocalId::from("99")]);

        let off = PullPolicy {
            recreate_missing: false,
            ..PullPolicy::default()
        };
        let plan = plan_pull(&items, &[], &MappingState::empty(), &off);
        assert!(plan.report.new.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn remote_item_mapped_to_another_record_conflicts() {
        let now = Utc::now();
        let a = linked("1", "A", "R1");
        let b = Record::new("2", "B");
        let state = synced(&a, now);
        // R1 claims local id 2, but the mapping binds R1 to record 1.
        let plan = plan_pull(
            &[item("R1", "2", "A", now)],
            &[a, b],
            &state,
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.conflicts.len(), 1);
        assert!(plan.report.conflicts[0].reason.contains("mapped to local record 1"));
    }

    #[test]
    fn duplicate_local_id_across_items_conflicts() {
        let now = Utc::now();
        let plan = plan_pull(
            &[item("R1", "5", "a", now), item("R2", "5", "b", now)],
            &[],
            &MappingState::empty(),
            &PullPolicy::default(),
        );
        assert_eq!(plan.report.new.len(), 1);
        assert_eq!(plan.report.conflicts.len(), 1);
        assert_eq!(plan.report.conflicts[0].remote_id, RemoteId::from("R2"));
    }

    #[test]
    fn only_filter_skips_other_items_and_orphan_scan() {
        let now = Utc::now();
        let stray = linked("3", "gone", "R3");
        let policy = PullPolicy {
            only: Some("2".into()),
            ..PullPolicy::default()
        };
        let plan = plan_pull(
            &[item("R1", "1", "one", now), item("R2", "2", "two", now)],
            &[stray],
            &MappingState::empty(),
            &policy,
        );
        assert_eq!(plan.report.new.len(), 1);
        assert_eq!(plan.report.new[0].id, LocalId::from("2"));
        assert!(plan.report.orphaned_ids.is_empty());
    }

    #[test]
    fn orphans_are_reported() {
        let record = linked("3", "gone", "R3");
        let plan = plan_pull(&[], &[record], &MappingState::empty(), &PullPolicy::default());
        assert_eq!(plan.report.orphaned_ids, vec![LocalId::from("3")]);
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn dependency_order_is_not_a_difference() {
        let mut record = Record::new("1", "t");
        record.dependencies = vec!["2".into(), "3".into()];
        let patch = RecordPatch {
            dependencies: Some(vec!["3".into(), "2".into(), "3".into()]),
            status: Some(TaskStatus::Pending),
            ..RecordPatch::default()
        };
        assert!(diff_fields(&record, &patch).is_empty());
    }

    #[test]
    fn multi_line_text_carries_unified_diff() {
        let mut record = Record::new("1", "t");
        record.details = "step one\nstep two\n".into();
        let patch = RecordPatch {
            details: Some("step one\nstep 2\n".into()),
            ..RecordPatch::default()
        };
        let diffs = diff_fields(&record, &patch);
        let diff = diffs[0].diff.as_deref().unwrap();
        assert!(diff.contains("-step two"));
        assert!(diff.contains("+step 2"));
    }
}
