//! boardsync core library: domain types, local record store, file locks.
//!
//! - [`types`]: newtypes, records, remote items
//! - [`local_store`]: [`LocalStore`] trait and the JSON task file
//! - [`lock`]: named, timeout-bound lock files
//! - [`error`]: [`StoreError`]

pub mod error;
pub mod local_store;
pub mod lock;
pub mod types;

pub use error::StoreError;
pub use local_store::{JsonTaskFile, LocalStore};
pub use lock::{FileLock, LockOptions};
pub use types::{
    BoardRef, FieldMap, GroupRef, LocalId, Priority, Record, RecordPatch, RemoteId, RemoteItem,
    SubRecord, TaskStatus,
};
