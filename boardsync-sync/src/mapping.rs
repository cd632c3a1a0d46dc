//! Mapping store: durable local id ↔ remote id index.
//!
//! Persists a [`MappingFile`]-shaped JSON document (by default at
//! `<tasks dir>/.boardsync/mappings.json`):
//!
//! ```text
//! { "version": 1, "lastSyncAt": 1718000000000,
//!   "mappings": [ { "localId": "42", "remoteId": "9001", "lastSyncedAt": 1718000000000 } ] }
//! ```
//!
//! Each entry is one agreed-upon pair. The pairing is strictly 1:1: inserting
//! a pair evicts any other entry that shares either side. Lookup indexes are
//! derived from the entry list on load and after every mutation; they are
//! never persisted.
//!
//! Every write takes the `<file>.lock` lock, then goes through a `.tmp`
//! sibling and a rename. Reads are served from a short-TTL in-process cache
//! unless the caller asks to bypass it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use boardsync_core::{local_store::atomic_replace, FileLock, LocalId, LockOptions, RemoteId};

use crate::error::{io_err, SyncError};

/// Format version written to new mapping files.
pub const MAPPING_VERSION: u32 = 1;

/// How long a loaded state is reused without touching disk.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Current time at the millisecond precision used on disk.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ---------------------------------------------------------------------------
// Persisted shapes
// ---------------------------------------------------------------------------

/// One agreed-upon local/remote pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_synced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_note_id: Option<String>,
    /// [`boardsync_core::Record::fingerprint`] at the time of agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_fingerprint: Option<String>,
}

impl MappingEntry {
    pub fn new(remote_id: RemoteId, local_id: LocalId, last_synced_at: DateTime<Utc>) -> Self {
        Self {
            local_id,
            remote_id,
            last_synced_at,
            remote_note_id: None,
            local_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.local_fingerprint = Some(fingerprint.into());
        self
    }
}

/// On-disk payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MappingFile<'a> {
    version: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    last_sync_at: DateTime<Utc>,
    mappings: &'a [MappingEntry],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingFileCompat {
    Structured(MappingFileStructuredCompat),
    /// Early files stored a bare `{ remoteId: localId }` object.
    Legacy(HashMap<String, String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingFileStructuredCompat {
    version: Option<u32>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_sync_at: Option<DateTime<Utc>>,
    mappings: Vec<MappingEntry>,
}

// ---------------------------------------------------------------------------
// In-memory state
// ---------------------------------------------------------------------------

/// The mapping aggregate: entry list plus the two lookup indexes derived
/// from it.
#[derive(Debug, Clone)]
pub struct MappingState {
    pub version: u32,
    pub last_sync_at: DateTime<Utc>,
    entries: Vec<MappingEntry>,
    by_remote: HashMap<RemoteId, usize>,
    by_local: HashMap<LocalId, usize>,
}

impl Default for MappingState {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for MappingState {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.last_sync_at == other.last_sync_at
            && self.entries == other.entries
    }
}

impl MappingState {
    pub fn empty() -> Self {
        Self {
            version: MAPPING_VERSION,
            last_sync_at: now_millis(),
            entries: vec![],
            by_remote: HashMap::new(),
            by_local: HashMap::new(),
        }
    }

    /// Build a state from a raw entry list. Entries that break the 1:1
    /// pairing are resolved in favour of the later one.
    pub fn from_entries(entries: Vec<MappingEntry>, last_sync_at: DateTime<Utc>) -> Self {
        let mut state = Self {
            last_sync_at,
            ..Self::empty()
        };
        for entry in entries {
            state.insert_unindexed(entry);
            state.reindex();
        }
        state
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_by_remote(&self, remote_id: &RemoteId) -> Option<&MappingEntry> {
        self.by_remote.get(remote_id).map(|&i| &self.entries[i])
    }

    pub fn get_by_local(&self, local_id: &LocalId) -> Option<&MappingEntry> {
        self.by_local.get(local_id).map(|&i| &self.entries[i])
    }

    /// Insert or refresh a pair.
    ///
    /// Re-upserting an existing pair keeps its note id and fingerprint unless
    /// the new entry carries its own.
    pub fn upsert(&mut self, entry: MappingEntry) {
        self.insert_unindexed(entry);
        self.reindex();
        self.touch();
    }

    /// Drop the entry for `remote_id`.
    pub fn remove(&mut self, remote_id: &RemoteId) -> Option<MappingEntry> {
        let index = *self.by_remote.get(remote_id)?;
        let removed = self.entries.remove(index);
        self.reindex();
        self.touch();
        Some(removed)
    }

    /// Drop the entry for `local_id`.
    pub fn remove_local(&mut self, local_id: &LocalId) -> Option<MappingEntry> {
        let index = *self.by_local.get(local_id)?;
        let removed = self.entries.remove(index);
        self.reindex();
        self.touch();
        Some(removed)
    }

    /// Attach a posted note to the pair for `remote_id`.
    pub fn set_note(&mut self, remote_id: &RemoteId, note_id: impl Into<String>) -> bool {
        let Some(&index) = self.by_remote.get(remote_id) else {
            return false;
        };
        self.entries[index].remote_note_id = Some(note_id.into());
        self.touch();
        true
    }

    /// Remove entries last synced before `cutoff`.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.last_synced_at >= cutoff);
        let removed = before - self.entries.len();
        self.reindex();
        self.touch();
        removed
    }

    fn insert_unindexed(&mut self, mut entry: MappingEntry) {
        let same_pair = self.entries.iter().position(|e| {
            e.remote_id == entry.remote_id && e.local_id == entry.local_id
        });
        if let Some(index) = same_pair {
            let old = &self.entries[index];
            if entry.remote_note_id.is_none() {
                entry.remote_note_id = old.remote_note_id.clone();
            }
            if entry.local_fingerprint.is_none() {
                entry.local_fingerprint = old.local_fingerprint.clone();
            }
            self.entries[index] = entry;
            return;
        }

        let displaced = self.entries.len();
        self.entries
            .retain(|e| e.remote_id != entry.remote_id && e.local_id != entry.local_id);
        if self.entries.len() != displaced {
            tracing::debug!(
                local_id = %entry.local_id,
                remote_id = %entry.remote_id,
                evicted = displaced - self.entries.len(),
                "re-pairing evicted conflicting mapping(s)",
            );
        }
        self.entries.push(entry);
    }

    fn reindex(&mut self) {
        self.by_remote.clear();
        self.by_local.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.by_remote.insert(entry.remote_id.clone(), i);
            self.by_local.insert(entry.local_id.clone(), i);
        }
    }

    fn touch(&mut self) {
        self.last_sync_at = now_millis();
    }
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CachedState {
    loaded_at: Instant,
    state: MappingState,
}

/// Handle to a mapping file on disk.
#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    lock: LockOptions,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedState>>,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: LockOptions::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current state.
    ///
    /// A missing file yields an empty state. A file that cannot be parsed
    /// also yields an empty state, with a warning. Only I/O failures other
    /// than "not found" are errors.
    pub fn load(&self, bypass_cache: bool) -> Result<MappingState, SyncError> {
        if !bypass_cache {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(cached.state.clone());
                }
            }
        }
        let state = self.read_from_disk()?;
        self.remember(&state);
        Ok(state)
    }

    /// Write `state` under the lock.
    pub fn persist(&self, state: &MappingState) -> Result<(), SyncError> {
        let _guard = FileLock::acquire(&self.path, self.lock)?;
        self.write_locked(state)
    }

    /// Read-modify-write under a single lock window.
    ///
    /// The state handed to `f` is always read fresh from disk.
    pub fn update<R>(&self, f: impl FnOnce(&mut MappingState) -> R) -> Result<R, SyncError> {
        let _guard = FileLock::acquire(&self.path, self.lock)?;
        let mut state = self.read_from_disk()?;
        let out = f(&mut state);
        self.write_locked(&state)?;
        Ok(out)
    }

    /// Take the lock and read the state fresh; the lock is held until the
    /// returned session is committed or dropped.
    ///
    /// Acquisition polls on the blocking pool, so waiting out another
    /// holder never parks an async worker.
    pub async fn begin(&self) -> Result<MappingSession<'_>, SyncError> {
        let path = self.path.clone();
        let opts = self.lock;
        let guard = tokio::task::spawn_blocking(move || FileLock::acquire(&path, opts))
            .await
            .map_err(|e| io_err(&self.path, std::io::Error::other(e)))??;
        let state = self.read_from_disk()?;
        Ok(MappingSession {
            store: self,
            state,
            _guard: guard,
        })
    }

    pub fn get_by_remote(&self, remote_id: &RemoteId) -> Result<Option<MappingEntry>, SyncError> {
        Ok(self.load(false)?.get_by_remote(remote_id).cloned())
    }

    pub fn get_by_local(&self, local_id: &LocalId) -> Result<Option<MappingEntry>, SyncError> {
        Ok(self.load(false)?.get_by_local(local_id).cloned())
    }

    pub fn upsert(
        &self,
        remote_id: &RemoteId,
        local_id: &LocalId,
        synced_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let entry = MappingEntry::new(remote_id.clone(), local_id.clone(), synced_at);
        self.upsert_entry(entry)
    }

    pub fn upsert_entry(&self, entry: MappingEntry) -> Result<(), SyncError> {
        self.update(|state| state.upsert(entry))
    }

    pub fn remove(&self, remote_id: &RemoteId) -> Result<bool, SyncError> {
        self.update(|state| state.remove(remote_id).is_some())
    }

    pub fn remove_local(&self, local_id: &LocalId) -> Result<bool, SyncError> {
        self.update(|state| state.remove_local(local_id).is_some())
    }

    pub fn set_note(&self, remote_id: &RemoteId, note_id: &str) -> Result<bool, SyncError> {
        self.update(|state| state.set_note(remote_id, note_id))
    }

    pub fn list_all(&self) -> Result<Vec<MappingEntry>, SyncError> {
        Ok(self.load(false)?.entries().to_vec())
    }

    /// Remove every entry not synced within `max_age`. Returns the count.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize, SyncError> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now_millis().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let removed = self.update(|state| state.prune_older_than(cutoff))?;
        if removed > 0 {
            tracing::info!(removed, "pruned stale mappings");
        }
        Ok(removed)
    }

    fn read_from_disk(&self) -> Result<MappingState, SyncError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MappingState::empty()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        match serde_json::from_str::<MappingFileCompat>(&contents) {
            Ok(MappingFileCompat::Structured(file)) => {
                let mut state = MappingState::from_entries(
                    file.mappings,
                    file.last_sync_at.unwrap_or_else(now_millis),
                );
                state.version = file.version.unwrap_or(MAPPING_VERSION);
                Ok(state)
            }
            Ok(MappingFileCompat::Legacy(pairs)) => {
                let now = now_millis();
                let mut pairs: Vec<_> = pairs.into_iter().collect();
                pairs.sort();
                let entries = pairs
                    .into_iter()
                    .map(|(remote, local)| MappingEntry::new(remote.into(), local.into(), now))
                    .collect();
                Ok(MappingState::from_entries(entries, now))
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "mapping file is corrupt; starting from an empty mapping",
                );
                Ok(MappingState::empty())
            }
        }
    }

    fn write_locked(&self, state: &MappingState) -> Result<(), SyncError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }
        let file = MappingFile {
            version: state.version,
            last_sync_at: state.last_sync_at,
            mappings: state.entries(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        atomic_replace(&self.path, json.as_bytes())?;
        self.remember(state);
        Ok(())
    }

    fn remember(&self, state: &MappingState) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedState {
            loaded_at: Instant::now(),
            state: state.clone(),
        });
    }
}

/// A locked read-modify-write window over the mapping file.
///
/// Dropping the session without [`commit`](Self::commit) releases the lock
/// and leaves the file untouched.
#[derive(Debug)]
pub struct MappingSession<'a> {
    store: &'a MappingStore,
    state: MappingState,
    _guard: FileLock,
}

impl MappingSession<'_> {
    pub fn state(&self) -> &MappingState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MappingState {
        &mut self.state
    }

    /// Write the state and release the lock.
    pub fn commit(self) -> Result<(), SyncError> {
        self.store.write_locked(&self.state)
    }
}
