//! Record field ↔ board column translation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use boardsync_core::{FieldMap, LocalId, Priority, Record, RecordPatch, RemoteItem, TaskStatus};

use crate::error::SyncError;

/// Bidirectional translation between records and remote column values.
pub trait ColumnMapper: Send + Sync {
    /// Column values for `record`. The title is not included; it travels as
    /// the item name.
    fn to_fields(&self, record: &Record) -> FieldMap;

    /// Decode whatever synced fields `item` carries.
    fn decode(&self, item: &RemoteItem) -> RecordPatch;
}

/// A record field that can be bound to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncedField {
    LocalId,
    Status,
    Priority,
    Description,
    Details,
    TestStrategy,
    Dependencies,
}

impl SyncedField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "id" | "local_id" | "localId" => Some(SyncedField::LocalId),
            "status" => Some(SyncedField::Status),
            "priority" => Some(SyncedField::Priority),
            "description" => Some(SyncedField::Description),
            "details" => Some(SyncedField::Details),
            "test_strategy" | "testStrategy" => Some(SyncedField::TestStrategy),
            "dependencies" => Some(SyncedField::Dependencies),
            _ => None,
        }
    }
}

/// Column ids for each synced field. Only `local_id` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<String>,
}

impl ColumnMap {
    pub fn new(local_id_column: impl Into<String>) -> Self {
        Self {
            local_id: local_id_column.into(),
            status: None,
            priority: None,
            description: None,
            details: None,
            test_strategy: None,
            dependencies: None,
        }
    }

    /// Bind `field` to `column`.
    pub fn with(mut self, field: SyncedField, column: impl Into<String>) -> Self {
        let column = column.into();
        match field {
            SyncedField::LocalId => self.local_id = column,
            SyncedField::Status => self.status = Some(column),
            SyncedField::Priority => self.priority = Some(column),
            SyncedField::Description => self.description = Some(column),
            SyncedField::Details => self.details = Some(column),
            SyncedField::TestStrategy => self.test_strategy = Some(column),
            SyncedField::Dependencies => self.dependencies = Some(column),
        }
        self
    }

    /// Build from a `field name → column id` table, as found in config files.
    pub fn from_table(table: &BTreeMap<String, String>) -> Result<Self, SyncError> {
        let mut local_id = None;
        let mut fields = Vec::new();
        for (name, column) in table {
            match SyncedField::parse(name) {
                Some(SyncedField::LocalId) => local_id = Some(column.clone()),
                Some(field) => fields.push((field, column.clone())),
                None => {
                    return Err(SyncError::Validation(format!(
                        "unknown field '{name}' in column table"
                    )))
                }
            }
        }
        let local_id = local_id.ok_or_else(|| {
            SyncError::Validation("column table must map 'local_id'".to_owned())
        })?;
        Ok(fields
            .into_iter()
            .fold(Self::new(local_id), |map, (field, column)| map.with(field, column)))
    }
}

impl ColumnMapper for ColumnMap {
    fn to_fields(&self, record: &Record) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(self.local_id.clone(), Value::from(record.id.0.as_str()));
        let mut put = |column: &Option<String>, value: String| {
            if let Some(column) = column {
                fields.insert(column.clone(), Value::from(value));
            }
        };
        put(&self.status, record.status.to_string());
        put(&self.priority, record.priority.to_string());
        put(&self.description, record.description.clone());
        put(&self.details, record.details.clone());
        put(&self.test_strategy, record.test_strategy.clone());
        put(&self.dependencies, join_ids(&record.dependency_set()));
        fields
    }

    fn decode(&self, item: &RemoteItem) -> RecordPatch {
        let text = |column: &Option<String>| {
            column
                .as_ref()
                .and_then(|c| item.fields.get(c))
                .and_then(value_text)
        };
        RecordPatch {
            local_id: value_text(item.fields.get(&self.local_id).unwrap_or(&Value::Null))
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .map(LocalId),
            title: Some(item.name.clone()),
            status: text(&self.status)
                .filter(|s| !s.trim().is_empty())
                .map(TaskStatus::from),
            priority: text(&self.priority).and_then(|s| Priority::parse(&s)),
            description: text(&self.description),
            details: text(&self.details),
            test_strategy: text(&self.test_strategy),
            dependencies: text(&self.dependencies).map(|s| split_ids(&s)),
        }
    }
}

/// Plain text of a column value. Structured values carry it under `text`.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map.get("text").and_then(value_text),
        Value::Null | Value::Array(_) => None,
    }
}

fn join_ids(ids: &[LocalId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_ids(s: &str) -> Vec<LocalId> {
    let ids: Vec<LocalId> = s
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(LocalId::from)
        .collect();
    boardsync_core::types::normalize_dependencies(&ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn full_map() -> ColumnMap {
        ColumnMap::new("text_local")
            .with(SyncedField::Status, "status")
            .with(SyncedField::Priority, "priority")
            .with(SyncedField::Details, "long_text")
            .with(SyncedField::Dependencies, "deps")
    }

    fn item(fields: FieldMap) -> RemoteItem {
        RemoteItem {
            id: "R1".into(),
            name: "Fix login".into(),
            updated_at: Utc::now(),
            group: None,
            fields,
        }
    }

    #[test]
    fn encodes_mapped_fields_only() {
        let mut record = Record::new("42", "Fix login");
        record.dependencies = vec!["9".into(), "3".into(), "9".into()];
        record.description = "not mapped".into();
        let fields = full_map().to_fields(&record);

        assert_eq!(fields["text_local"], "42");
        assert_eq!(fields["status"], "pending");
        assert_eq!(fields["priority"], "medium");
        assert_eq!(fields["deps"], "3,9");
        assert_eq!(fields["long_text"], "");
        assert!(!fields.contains_key("name"));
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn decodes_strings_and_structured_values() {
        let fields = FieldMap::from([
            ("text_local".to_owned(), Value::from(99)),
            ("status".to_owned(), serde_json::json!({"text": "In Progress"})),
            ("priority".to_owned(), Value::from("HIGH")),
            ("deps".to_owned(), Value::from(" 4, 2 ,,2")),
        ]);
        let patch = full_map().decode(&item(fields));

        assert_eq!(patch.local_id, Some(LocalId::from("99")));
        assert_eq!(patch.title.as_deref(), Some("Fix login"));
        assert_eq!(patch.status, Some(TaskStatus::InProgress));
        assert_eq!(patch.priority, Some(Priority::High));
        assert_eq!(patch.dependencies, Some(vec!["2".into(), "4".into()]));
        assert_eq!(patch.details, None);
        assert_eq!(patch.description, None);
    }

    #[test]
    fn blank_local_id_is_unresolvable() {
        let fields = FieldMap::from([("text_local".to_owned(), Value::from("  "))]);
        assert_eq!(full_map().decode(&item(fields)).local_id, None);
        assert_eq!(full_map().decode(&item(FieldMap::new())).local_id, None);
    }

    #[test]
    fn encode_then_decode_recovers_the_record() {
        let mut record = Record::new("7", "Ship it");
        record.status = TaskStatus::Review;
        record.priority = Priority::Low;
        record.details = "line one\nline two".into();
        record.dependencies = vec!["1".into()];
        let map = full_map();
        let patch = map.decode(&RemoteItem {
            name: record.title.clone(),
            ..item(map.to_fields(&record))
        });
        assert_eq!(patch.to_record(), Some(record));
    }

    #[test]
    fn table_requires_local_id_and_known_fields() {
        let mut table = BTreeMap::from([("status".to_owned(), "s".to_owned())]);
        assert!(ColumnMap::from_table(&table).is_err());

        table.insert("local_id".into(), "lid".into());
        let map = ColumnMap::from_table(&table).unwrap();
        assert_eq!(map.local_id, "lid");
        assert_eq!(map.status.as_deref(), Some("s"));

        table.insert("owner".into(), "o".into());
        assert!(matches!(
            ColumnMap::from_table(&table),
            Err(SyncError::Validation(_))
        ));
    }
}
