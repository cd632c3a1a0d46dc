//! Remote board client interface.
//!
//! The reconcilers only see this trait; the HTTP implementation lives in the
//! CLI crate and [`crate::memory::MemoryBoard`] serves tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use boardsync_core::{BoardRef, FieldMap, GroupRef, RemoteId, RemoteItem};

use crate::error::RemoteError;

/// Column key that renames an item when present in an update.
pub const NAME_FIELD: &str = "name";

/// A group as listed by the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: GroupRef,
    pub title: String,
}

/// Query/mutate access to the remote board service.
///
/// Every call may fail with [`RemoteError::RateLimited`] or
/// [`RemoteError::Transient`]; wrap clients in
/// [`crate::retry::RetryingClient`] to retry those.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// All items on `board`, optionally restricted to one group.
    async fn fetch_items(
        &self,
        board: &BoardRef,
        group: Option<&GroupRef>,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    /// One item, or `None` when it no longer exists.
    async fn get_item(&self, id: &RemoteId) -> Result<Option<RemoteItem>, RemoteError>;

    async fn item_exists(&self, id: &RemoteId) -> Result<bool, RemoteError> {
        Ok(self.get_item(id).await?.is_some())
    }

    async fn create_item(
        &self,
        board: &BoardRef,
        group: &GroupRef,
        name: &str,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError>;

    /// Set column values on an item. A [`NAME_FIELD`] key renames it.
    async fn update_item(
        &self,
        board: &BoardRef,
        id: &RemoteId,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError>;

    /// Returns `false` when the item was already gone.
    async fn delete_item(&self, id: &RemoteId) -> Result<bool, RemoteError>;

    async fn list_groups(&self, board: &BoardRef) -> Result<Vec<GroupInfo>, RemoteError>;

    /// Post a text annotation on an item; returns the note id.
    async fn post_note(&self, id: &RemoteId, body: &str) -> Result<String, RemoteError>;
}
