//! # boardsync-sync
//!
//! Reconciliation between a local task collection and a remote board.
//!
//! Build an [`Engine`] with the local store, a [`MappingStore`], a
//! [`RemoteClient`] and a [`ColumnMapper`], then call [`Engine::push`] or
//! [`Engine::pull`]. Both return a structured report; only run-level
//! failures (local store unreadable, mapping lock timeout, initial remote
//! fetch) come back as [`SyncError`].

pub mod batcher;
pub mod columns;
pub mod error;
pub mod mapping;
pub mod memory;
pub mod pipeline;
pub mod pull;
pub mod push;
pub mod remote;
pub mod retry;

pub use batcher::{BatchTransport, CombinedMutation, Mutation, MutationBatcher, MutationHandle};
pub use columns::{ColumnMap, ColumnMapper, SyncedField};
pub use error::{RemoteError, SyncError};
pub use mapping::{MappingEntry, MappingSession, MappingState, MappingStore};
pub use memory::MemoryBoard;
pub use pipeline::{Engine, StatusReport, Target};
pub use pull::{ConflictRecord, FieldDiff, PullPolicy, PullReport, PulledItem};
pub use push::{PushPolicy, PushReport, RecordError};
pub use remote::{GroupInfo, RemoteClient};
pub use retry::{RetryPolicy, RetryingClient};
