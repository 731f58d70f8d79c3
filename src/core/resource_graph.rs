//! Exclusive resource tracking for admission control.
//!
//! The graph is the only structure shared by the distribution loop and every
//! finishing task. All reads and writes go through [`ResourceGraphGuard`], so a
//! resource can only be inspected, acquired, or released while the graph's
//! lock is held.

use std::collections::HashMap;
use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;

/// Named entity a task holds exclusively for its whole execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(String);

impl Resource {
    /// Create a resource identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Resource {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Resource {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Map of resource to current holder, guarded by a single mutex.
#[derive(Default)]
pub struct ResourceGraph {
    holders: Mutex<HashMap<Resource, Option<TaskId>>>,
}

impl ResourceGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the graph lock. Every operation on resources requires the guard.
    pub fn lock(&self) -> ResourceGraphGuard<'_> {
        ResourceGraphGuard {
            holders: self.holders.lock(),
        }
    }
}

impl fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGraph").finish_non_exhaustive()
    }
}

/// Held lock on a [`ResourceGraph`]. Dropping it unlocks the graph.
pub struct ResourceGraphGuard<'a> {
    holders: MutexGuard<'a, HashMap<Resource, Option<TaskId>>>,
}

impl ResourceGraphGuard<'_> {
    /// Register a resource as free. Existing resources keep their holder.
    pub fn add_resource(&mut self, resource: Resource) {
        self.holders.entry(resource).or_insert(None);
    }

    /// Whether every resource in `resources` is currently free.
    ///
    /// Resources the graph has never seen count as free.
    #[must_use]
    pub fn can_acquire_all(&self, resources: &[Resource]) -> bool {
        resources
            .iter()
            .all(|r| self.holders.get(r).is_none_or(Option::is_none))
    }

    /// Mark `resource` as held by `holder`.
    ///
    /// Returns `false` and leaves the graph unchanged if another task holds it.
    pub fn acquire(&mut self, resource: &Resource, holder: TaskId) -> bool {
        let slot = self.holders.entry(resource.clone()).or_insert(None);
        match slot {
            Some(current) if *current != holder => false,
            _ => {
                *slot = Some(holder);
                true
            }
        }
    }

    /// Mark `resource` as free. Returns the previous holder, if any.
    pub fn release(&mut self, resource: &Resource) -> Option<TaskId> {
        self.holders.get_mut(resource).and_then(Option::take)
    }

    /// Task currently holding `resource`.
    #[must_use]
    pub fn holder(&self, resource: &Resource) -> Option<TaskId> {
        self.holders.get(resource).copied().flatten()
    }

    /// Number of resources currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.holders.values().filter(|h| h.is_some()).count()
    }

    /// Whether the graph knows about `resource`.
    #[must_use]
    pub fn contains(&self, resource: &Resource) -> bool {
        self.holders.contains_key(resource)
    }
}
