//! Domain types shared by the local store and the reconcilers.
//!
//! All types are serializable via serde + serde_json. Field names on disk are
//! camelCase to match the task files written by the owning local tool.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of a record in the local collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "IdRepr")]
pub struct LocalId(pub String);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for LocalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LocalId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Task files written by older tools store ids as JSON numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(u64),
}

impl From<IdRepr> for LocalId {
    fn from(repr: IdRepr) -> Self {
        match repr {
            IdRepr::Text(s) => Self(s),
            IdRepr::Number(n) => Self(n.to_string()),
        }
    }
}

/// Identity of an item on the remote board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A remote board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardRef(pub String);

impl fmt::Display for BoardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for BoardRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A group (section) inside a remote board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef(pub String);

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for GroupRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Workflow status of a record.
///
/// The set is open: labels this crate does not know are kept verbatim in
/// [`TaskStatus::Other`] so they survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Review,
    Done,
    Deferred,
    Cancelled,
    Blocked,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Other(label) => label,
        }
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().replace(['_', ' '], "-").as_str() {
            "pending" => TaskStatus::Pending,
            "in-progress" => TaskStatus::InProgress,
            "review" => TaskStatus::Review,
            "done" => TaskStatus::Done,
            "deferred" => TaskStatus::Deferred,
            "cancelled" => TaskStatus::Cancelled,
            "blocked" => TaskStatus::Blocked,
            _ => TaskStatus::Other(s),
        }
    }
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_owned()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Parse a priority label case-insensitively.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Local-only child of a [`Record`]. Never pushed; preserved by pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRecord {
    pub id: LocalId,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A work item in the local collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: LocalId,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<LocalId>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub test_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubRecord>,
    /// Keys written by the owning tool that this crate does not model.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<LocalId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::default(),
            priority: Priority::default(),
            dependencies: vec![],
            description: String::new(),
            details: String::new(),
            test_strategy: String::new(),
            remote_id: None,
            subtasks: vec![],
            extra: BTreeMap::new(),
        }
    }

    /// Dependencies as a sorted, deduplicated list.
    pub fn dependency_set(&self) -> Vec<LocalId> {
        normalize_dependencies(&self.dependencies)
    }

    /// SHA-256 over the synced field set.
    ///
    /// Subtasks, the remote back-reference and unknown keys are excluded so
    /// that only edits which push would propagate change the digest.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for part in [
            self.title.as_str(),
            self.status.as_str(),
            &self.priority.to_string(),
            self.description.as_str(),
            self.details.as_str(),
            self.test_strategy.as_str(),
        ] {
            h.update(part.as_bytes());
            h.update([0u8]);
        }
        for dep in self.dependency_set() {
            h.update(dep.0.as_bytes());
            h.update([0x1f]);
        }
        hex::encode(h.finalize())
    }

    /// Apply every field present in `patch`. Subtasks and unknown keys are
    /// left untouched.
    pub fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(status) = &patch.status {
            self.status = status.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(details) = &patch.details {
            self.details = details.clone();
        }
        if let Some(test_strategy) = &patch.test_strategy {
            self.test_strategy = test_strategy.clone();
        }
        if let Some(deps) = &patch.dependencies {
            self.dependencies = deps.clone();
        }
    }
}

/// Sort and deduplicate a dependency list.
pub fn normalize_dependencies(deps: &[LocalId]) -> Vec<LocalId> {
    let mut deps = deps.to_vec();
    deps.sort();
    deps.dedup();
    deps
}

/// Partial record decoded from a remote item. Absent fields were not mapped
/// or not set remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    pub local_id: Option<LocalId>,
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub description: Option<String>,
    pub details: Option<String>,
    pub test_strategy: Option<String>,
    pub dependencies: Option<Vec<LocalId>>,
}

impl RecordPatch {
    /// Build a fresh record from this patch. Returns `None` without a local id.
    pub fn to_record(&self) -> Option<Record> {
        let id = self.local_id.clone()?;
        let mut record = Record::new(id, self.title.clone().unwrap_or_default());
        record.apply_patch(self);
        Some(record)
    }
}

/// Remote column values, keyed by column id.
pub type FieldMap = BTreeMap<String, Value>;

/// An item on the remote board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub id: RemoteId,
    pub name: String,
    #[serde(alias = "updated_at")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupRef>,
    #[serde(default)]
    pub fields: FieldMap,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
