//! Persistent store abstraction for task snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::TaskId;
use crate::core::AppResult;

/// Storage semantics a collection must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSemantics {
    /// Ids are assigned serially by the store.
    Serial,
    /// Records form an append-only log; nothing is deleted.
    Log,
}

/// Persistent store receiving task snapshots.
pub trait Datastore: Send + Sync {
    /// Declare that `collection` must exist with the given semantics.
    fn require_collection(&self, collection: &str, semantics: &[StorageSemantics])
        -> AppResult<()>;

    /// Insert a new document and return its assigned id.
    fn insert(&self, collection: &str, document: Value) -> AppResult<TaskId>;

    /// Replace the document stored under `id`.
    fn update(&self, collection: &str, id: TaskId, document: Value) -> AppResult<()>;
}
