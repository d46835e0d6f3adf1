//! The once-only registry: process-wide mapping from once-key to the
//! winning [`Task`] (spec §3, §4.C, invariant P2).
//!
//! Per the design note on avoiding ambient mutable state, this is an
//! explicitly owned, non-static structure: callers construct one (typically
//! one per [`ExecutorGroup`](crate::group::ExecutorGroup)) and pass it down
//! into every [`Task`] created with a once-only key, rather than reaching
//! for a global. Tests can build a fresh registry per case and get complete
//! isolation.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use super::Task;

/// A once-only key → winning task map (spec P2: "at most one Task with key
/// k runs to completion across all admissions until it completes and clears
/// the registry").
#[derive(Default)]
pub struct OnceRegistry {
    entries: Mutex<HashMap<String, Arc<Task>>>,
}

impl OnceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically inserts `task` under `key` if absent. Returns `Ok(())` if
    /// this task won the key, `Err(winner)` otherwise.
    pub(crate) fn put_if_absent(&self, key: &str, task: &Arc<Task>) -> Result<(), Arc<Task>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(task));
                Ok(())
            }
            Entry::Occupied(slot) => Err(Arc::clone(slot.get())),
        }
    }

    /// Removes `key`'s entry, but only if `task` is still the registered
    /// winner (a stale removal from an already-superseded task is a no-op).
    pub(crate) fn remove(&self, key: &str, task: &Arc<Task>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(winner) = entries.get(key) {
            if Arc::ptr_eq(winner, task) {
                entries.remove(key);
            }
        }
    }

    /// Explicit teardown: drops every entry, for test isolation between
    /// cases that otherwise share a registry instance.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of once-only tasks currently in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
