//! Local record collection backed by a JSON task file.
//!
//! # Accepted layouts
//!
//! ```text
//! { "tasks": [ … ], "metadata": { … } }            (flat envelope)
//! { "<tag>": { "tasks": [ … ], … }, … }            (tagged envelope)
//! [ … ]                                            (legacy bare array)
//! ```
//!
//! `write_all` re-reads the current envelope and replaces only the `tasks`
//! array, so keys owned by other tools survive. Writes are atomic:
//! serialize → `<file>.tmp` sibling → rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{io_err, StoreError};
use crate::types::Record;

/// Read/write access to the full local record collection.
pub trait LocalStore: Send + Sync {
    /// All records in stable file order.
    fn read_all(&self) -> Result<Vec<Record>, StoreError>;

    /// Atomically replace the collection, preserving any outer envelope.
    fn write_all(&self, records: &[Record]) -> Result<(), StoreError>;
}

/// A task file on disk.
#[derive(Debug, Clone)]
pub struct JsonTaskFile {
    path: PathBuf,
    tag: Option<String>,
}

impl JsonTaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tag: None,
        }
    }

    /// Read and write the tasks under `<tag>.tasks` when the file uses a
    /// tagged envelope.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Option<Value>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Locate the tasks array inside `doc`.
    fn tasks_slot<'a>(&self, doc: &'a mut Value) -> Option<&'a mut Value> {
        if doc.is_array() {
            return Some(doc);
        }
        let root = doc.as_object_mut()?;
        match &self.tag {
            Some(tag) if !root.contains_key("tasks") => root
                .entry(tag.clone())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .map(|tagged| tagged.entry("tasks").or_insert(Value::Array(vec![]))),
            _ => Some(root.entry("tasks").or_insert(Value::Array(vec![]))),
        }
    }
}

impl LocalStore for JsonTaskFile {
    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        let Some(mut doc) = self.read_document()? else {
            return Ok(vec![]);
        };
        let Some(slot) = self.tasks_slot(&mut doc) else {
            return Ok(vec![]);
        };
        serde_json::from_value(slot.take()).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&self, records: &[Record]) -> Result<(), StoreError> {
        let mut doc = self
            .read_document()?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let tasks = serde_json::to_value(records)?;
        match self.tasks_slot(&mut doc) {
            Some(slot) => *slot = tasks,
            None => {
                // Scalar root: nothing worth preserving.
                let mut root = Map::new();
                root.insert("tasks".into(), tasks);
                doc = Value::Object(root);
            }
        }

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }
        let json = serde_json::to_string_pretty(&doc)?;
        atomic_replace(&self.path, json.as_bytes())
    }
}

/// Write `bytes` to `<path>.tmp` then rename over `path`.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonTaskFile::new(tmp.path().join("tasks.json"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn write_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = JsonTaskFile::new(tmp.path().join("nested").join("tasks.json"));
        let records = vec![Record::new("2", "b"), Record::new("1", "a")];
        store.write_all(&records).unwrap();
        let loaded = store.read_all().unwrap();
        let ids: Vec<_> = loaded.iter().map(|r| r.id.0.as_str()).collect();
        assert_eq!(ids, ["2", "1"]);
    }

    #[test]
    fn write_preserves_envelope_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{"metadata":{"project":"demo"},"tasks":[{"id":1,"title":"a"}]}"#,
        )
        .unwrap();
        let store = JsonTaskFile::new(&path);
        let mut records = store.read_all().unwrap();
        records[0].status = TaskStatus::Done;
        store.write_all(&records).unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["project"], "demo");
        assert_eq!(doc["tasks"][0]["status"], "done");
    }

    #[test]
    fn tagged_envelope_is_read_and_written_in_place() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{"master":{"tasks":[{"id":"7","title":"x"}],"metadata":{"v":2}},"other":{"tasks":[]}}"#,
        )
        .unwrap();
        let store = JsonTaskFile::new(&path).with_tag("master");
        let mut records = store.read_all().unwrap();
        assert_eq!(records.len(), 1);
        records.push(Record::new("8", "y"));
        store.write_all(&records).unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["master"]["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(doc["master"]["metadata"]["v"], 2);
        assert!(doc["other"]["tasks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn legacy_bare_array_is_supported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.json");
        std::fs::write(&path, r#"[{"id":"1","title":"a"}]"#).unwrap();
        let store = JsonTaskFile::new(&path);
        assert_eq!(store.read_all().unwrap().len(), 1);
        store.write_all(&[]).unwrap();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(doc.as_array().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonTaskFile::new(&path).read_all().unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("tasks.json"));
    }

    #[test]
    fn atomic_replace_cleans_up_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.json");
        atomic_replace(&path, b"[]").unwrap();
        assert!(path.exists());
        assert!(!tmp.path().join("tasks.json.tmp").exists());
    }
}
