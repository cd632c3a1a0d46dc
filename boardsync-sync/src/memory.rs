//! In-process board used by tests and offline dry runs.
//!
//! Behaves like the remote service from the reconcilers' point of view:
//! items live in groups, every mutation advances the item's `updated_at`,
//! and ids are assigned by the board. Calls are counted per operation and
//! failures can be queued per operation to exercise error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use boardsync_core::{BoardRef, FieldMap, GroupRef, RemoteId, RemoteItem};

use crate::batcher::{BatchTransport, CombinedMutation, Mutation};
use crate::error::RemoteError;
use crate::mapping::now_millis;
use crate::remote::{GroupInfo, RemoteClient, NAME_FIELD};

/// Operation name used to queue a failure for a whole combined batch.
pub const BATCH_OP: &str = "batch";

#[derive(Debug, Default)]
struct BoardState {
    groups: Vec<GroupInfo>,
    items: BTreeMap<RemoteId, RemoteItem>,
    notes: Vec<(RemoteId, String, String)>,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
}

impl BoardState {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = now_millis();
        let next = match self.clock {
            Some(prev) if prev >= now => prev + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn enter(&mut self, op: &'static str) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn create(&mut self, group: &GroupRef, name: &str, fields: &FieldMap) -> Result<RemoteItem, RemoteError> {
        if !self.groups.iter().any(|g| &g.id == group) {
            return Err(RemoteError::NotFound(format!("group {group}")));
        }
        self.next_id += 1;
        let id = RemoteId(format!("{}", 1000 + self.next_id));
        let mut fields = fields.clone();
        fields.remove(NAME_FIELD);
        let item = RemoteItem {
            id: id.clone(),
            name: name.to_owned(),
            updated_at: self.tick(),
            group: Some(group.clone()),
            fields,
        };
        self.items.insert(id, item.clone());
        Ok(item)
    }

    fn update(&mut self, id: &RemoteId, fields: &FieldMap) -> Result<RemoteItem, RemoteError> {
        let now = self.tick();
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("item {id}")))?;
        for (key, value) in fields {
            if key == NAME_FIELD {
                if let Some(name) = value.as_str() {
                    item.name = name.to_owned();
                }
            } else {
                item.fields.insert(key.clone(), value.clone());
            }
        }
        item.updated_at = now;
        Ok(item.clone())
    }
}

/// A single board held in memory.
#[derive(Debug)]
pub struct MemoryBoard {
    board: BoardRef,
    state: Mutex<BoardState>,
}

impl MemoryBoard {
    pub fn new(board: impl Into<String>, groups: &[&str]) -> Self {
        let state = BoardState {
            groups: groups
                .iter()
                .map(|g| GroupInfo {
                    id: GroupRef::from(*g),
                    title: g.to_string(),
                })
                .collect(),
            ..BoardState::default()
        };
        Self {
            board: BoardRef(board.into()),
            state: Mutex::new(state),
        }
    }

    pub fn board(&self) -> &BoardRef {
        &self.board
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an item as if someone created it on the board directly.
    pub fn seed_item(&self, group: &str, name: &str, fields: FieldMap) -> RemoteItem {
        let mut state = self.lock();
        let group = GroupRef::from(group);
        if !state.groups.iter().any(|g| g.id == group) {
            state.groups.push(GroupInfo {
                id: group.clone(),
                title: group.0.clone(),
            });
        }
        match state.create(&group, name, &fields) {
            Ok(item) => item,
            Err(err) => unreachable!("seeding into an existing group cannot fail: {err}"),
        }
    }

    /// Change an item as if someone edited it on the board directly.
    pub fn edit_item(&self, id: &RemoteId, fields: FieldMap) -> Option<RemoteItem> {
        self.lock().update(id, &fields).ok()
    }

    /// Delete an item behind the reconciler's back.
    pub fn drop_item(&self, id: &RemoteId) -> Option<RemoteItem> {
        self.lock().items.remove(id)
    }

    pub fn item(&self, id: &RemoteId) -> Option<RemoteItem> {
        self.lock().items.get(id).cloned()
    }

    pub fn items(&self) -> Vec<RemoteItem> {
        self.lock().items.values().cloned().collect()
    }

    pub fn notes_for(&self, id: &RemoteId) -> Vec<String> {
        self.lock()
            .notes
            .iter()
            .filter(|(item, _, _)| item == id)
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    /// Number of calls made to `op` (a [`RemoteClient`] method name or
    /// [`BATCH_OP`]).
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Calls to any mutating operation, batched or not.
    pub fn mutation_calls(&self) -> usize {
        ["create_item", "update_item", "delete_item", "post_note", BATCH_OP]
            .iter()
            .map(|op| self.calls(op))
            .sum()
    }

    /// Make the next call to `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    fn check_board(&self, board: &BoardRef) -> Result<(), RemoteError> {
        if board == &self.board {
            Ok(())
        } else {
            Err(RemoteError::NotFound(format!("board {board}")))
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryBoard {
    async fn fetch_items(
        &self,
        board: &BoardRef,
        group: Option<&GroupRef>,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        self.check_board(board)?;
        let mut state = self.lock();
        state.enter("fetch_items")?;
        Ok(state
            .items
            .values()
            .filter(|item| group.is_none() || item.group.as_ref() == group)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &RemoteId) -> Result<Option<RemoteItem>, RemoteError> {
        let mut state = self.lock();
        state.enter("get_item")?;
        Ok(state.items.get(id).cloned())
    }

    async fn create_item(
        &self,
        board: &BoardRef,
        group: &GroupRef,
        name: &str,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        self.check_board(board)?;
        let mut state = self.lock();
        state.enter("create_item")?;
        state.create(group, name, fields)
    }

    async fn update_item(
        &self,
        board: &BoardRef,
        id: &RemoteId,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        self.check_board(board)?;
        let mut state = self.lock();
        state.enter("update_item")?;
        state.update(id, fields)
    }

    async fn delete_item(&self, id: &RemoteId) -> Result<bool, RemoteError> {
        let mut state = self.lock();
        state.enter("delete_item")?;
        Ok(state.items.remove(id).is_some())
    }

    async fn list_groups(&self, board: &BoardRef) -> Result<Vec<GroupInfo>, RemoteError> {
        self.check_board(board)?;
        let mut state = self.lock();
        state.enter("list_groups")?;
        Ok(state.groups.clone())
    }

    async fn post_note(&self, id: &RemoteId, body: &str) -> Result<String, RemoteError> {
        let mut state = self.lock();
        state.enter("post_note")?;
        if !state.items.contains_key(id) {
            return Err(RemoteError::NotFound(format!("item {id}")));
        }
        let note_id = format!("note-{}", state.notes.len() + 1);
        state.notes.push((id.clone(), note_id.clone(), body.to_owned()));
        Ok(note_id)
    }
}

#[async_trait]
impl BatchTransport for MemoryBoard {
    async fn send(&self, batch: &CombinedMutation) -> Result<Map<String, Value>, RemoteError> {
        let mut state = self.lock();
        state.enter(BATCH_OP)?;
        let mut response = Map::new();
        for (alias, mutation) in &batch.operations {
            let result = match mutation {
                Mutation::CreateItem {
                    board,
                    group,
                    name,
                    fields,
                } => self
                    .check_board(board)
                    .and_then(|()| state.create(group, name, fields)),
                Mutation::UpdateItem { board, id, fields } => self
                    .check_board(board)
                    .and_then(|()| state.update(id, fields)),
            };
            // A failed field comes back as null, like a partial GraphQL error.
            let value = match result {
                Ok(item) => serde_json::to_value(item).map_err(|e| RemoteError::Decode(e.to_string()))?,
                Err(_) => Value::Null,
            };
            response.insert(alias.clone(), value);
        }
        Ok(response)
    }
}
