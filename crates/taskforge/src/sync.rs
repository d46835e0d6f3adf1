//! A keyed mutex/condvar registry.
//!
//! Spec §6 names a "keyed mutex registry" external collaborator with the
//! contract `getMutex(id) -> object`, `execute(id, fn)`, `removeMutex(id)`,
//! guaranteeing a stable shared object per id until removed. Spec §9's
//! design notes add: "In languages without monitor-per-object, implement as
//! a concurrent map from string id to a mutex object, with reference
//! counting or explicit remove to bound memory." This module is exactly
//! that, since nothing external supplies it here.
//!
//! Every named monitor the rest of the crate needs — the resume mutex,
//! suspension mutex, queue-fill mutex, drain-complete mutex (spec §5), and
//! the per-slot sleeping-array mutexes (spec §4.B) — is obtained from one
//! [`KeyedMutexRegistry`] instance per [`QueuedTaskExecutor`] /
//! [`ThreadSupplier`].
//!
//! [`QueuedTaskExecutor`]: crate::executor::QueuedTaskExecutor
//! [`ThreadSupplier`]: crate::supplier::ThreadSupplier

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// A monitor: a `Mutex<()>` paired with a `Condvar`, standing in for the
/// per-object monitor that the original design assumes every object has.
pub type Monitor = Arc<(Mutex<()>, Condvar)>;

/// A concurrent map from string id to a shared [`Monitor`], reference
/// counted so entries with no remaining holder are evicted rather than
/// accumulating forever.
#[derive(Debug, Default)]
pub struct KeyedMutexRegistry {
    entries: Mutex<HashMap<String, Monitor>>,
}

impl KeyedMutexRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the monitor for `id`, creating it if this is the first
    /// request. The returned `Arc` keeps the entry alive even if a
    /// concurrent caller reaches zero holders and triggers eviction before
    /// this caller is done with it.
    pub fn get_mutex(&self, id: &str) -> Monitor {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(id.to_owned()).or_insert_with(Self::new_monitor).clone()
    }

    /// Runs `f` while holding `id`'s monitor lock, then evicts the entry if
    /// no one else still holds a reference to it.
    pub fn execute<R>(&self, id: &str, f: impl FnOnce() -> R) -> R {
        let monitor = self.get_mutex(id);
        let result = {
            let _guard = monitor.0.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        self.remove_if_unreferenced(id, &monitor);
        result
    }

    /// Explicitly drops `id`'s entry if this caller's handle is the only
    /// remaining reference (the registry's own map entry plus this one).
    pub fn remove_mutex(&self, id: &str, handle: &Monitor) {
        self.remove_if_unreferenced(id, handle);
    }

    fn remove_if_unreferenced(&self, id: &str, handle: &Monitor) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stored) = entries.get(id) {
            // Two references: the map's own, plus `handle`. Anything more
            // means another caller is still using it.
            if Arc::ptr_eq(stored, handle) && Arc::strong_count(stored) <= 2 {
                entries.remove(id);
            }
        }
    }

    fn new_monitor() -> Monitor {
        Arc::new((Mutex::new(()), Condvar::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mutex_returns_stable_object_per_id() {
        let registry = KeyedMutexRegistry::new();
        let a = registry.get_mutex("resume");
        let b = registry.get_mutex("resume");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_ids_get_different_monitors() {
        let registry = KeyedMutexRegistry::new();
        let a = registry.get_mutex("resume");
        let b = registry.get_mutex("suspend");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn execute_runs_under_the_named_lock() {
        let registry = KeyedMutexRegistry::new();
        let value = registry.execute("counter", || 1 + 1);
        assert_eq!(value, 2);
    }

    #[test]
    fn remove_mutex_evicts_when_unreferenced() {
        let registry = KeyedMutexRegistry::new();
        let handle = registry.get_mutex("slot-0");
        registry.remove_mutex("slot-0", &handle);
        drop(handle);
        let fresh = registry.get_mutex("slot-0");
        assert_eq!(Arc::strong_count(&fresh), 2);
    }
}
