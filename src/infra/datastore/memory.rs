//! In-memory datastore backend.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use serde_json::Value;

use crate::core::{AppResult, Datastore, StorageSemantics, TaskId};

struct Collection {
    semantics: Vec<StorageSemantics>,
    next_id: TaskId,
    /// Revisions per document, oldest first. Non-log collections keep one.
    documents: BTreeMap<TaskId, Vec<Value>>,
}

impl Collection {
    fn is_log(&self) -> bool {
        self.semantics.contains(&StorageSemantics::Log)
    }
}

/// Simple in-memory store for development/testing.
///
/// Collections must be declared with [`Datastore::require_collection`] before
/// use. Ids are assigned serially from 1. Collections declared with
/// [`StorageSemantics::Log`] keep every revision of a document.
#[derive(Default)]
pub struct InMemoryDatastore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl InMemoryDatastore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest revision of a document.
    #[must_use]
    pub fn get(&self, collection: &str, id: TaskId) -> Option<Value> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.documents.get(&id))
            .and_then(|revs| revs.last().cloned())
    }

    /// Every stored revision of a document, oldest first.
    #[must_use]
    pub fn history(&self, collection: &str, id: TaskId) -> Vec<Value> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.documents.get(&id).cloned())
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// Declared semantics of a collection.
    #[must_use]
    pub fn semantics(&self, collection: &str) -> Option<Vec<StorageSemantics>> {
        self.collections
            .lock()
            .get(collection)
            .map(|c| c.semantics.clone())
    }
}

impl Datastore for InMemoryDatastore {
    fn require_collection(&self, collection: &str, semantics: &[StorageSemantics]) -> AppResult<()> {
        let mut collections = self.collections.lock();
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                semantics: Vec::new(),
                next_id: 1,
                documents: BTreeMap::new(),
            });
        for s in semantics {
            if !entry.semantics.contains(s) {
                entry.semantics.push(*s);
            }
        }
        Ok(())
    }

    fn insert(&self, collection: &str, mut document: Value) -> AppResult<TaskId> {
        let mut collections = self.collections.lock();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection `{collection}` was never declared"))?;
        let id = coll.next_id;
        coll.next_id += 1;
        if let Value::Object(map) = &mut document {
            map.insert("id".into(), Value::from(id));
        }
        coll.documents.insert(id, vec![document]);
        Ok(id)
    }

    fn update(&self, collection: &str, id: TaskId, mut document: Value) -> AppResult<()> {
        let mut collections = self.collections.lock();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection `{collection}` was never declared"))?;
        let is_log = coll.is_log();
        let Some(revisions) = coll.documents.get_mut(&id) else {
            bail!("document {id} not found in `{collection}`");
        };
        if let Value::Object(map) = &mut document {
            map.insert("id".into(), Value::from(id));
        }
        if is_log {
            revisions.push(document);
        } else {
            *revisions = vec![document];
        }
        Ok(())
    }
}
