//! Per-priority task queue (spec §3 "Task Queue", §5: "copy-on-write
//! sequence; iteration yields a stable snapshot and removal is by identity").

use std::sync::{Arc, Mutex};

use crate::task::{Priority, Task};

/// A FIFO sequence of tasks admitted to one priority tier.
pub(crate) struct TaskQueue {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, task: Arc<Task>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A stable point-in-time copy for the drain loop to iterate; cloning
    /// `Arc<Task>` is cheap, so snapshotting the whole queue per drain pass
    /// is the simplest way to give iteration copy-on-write semantics.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Removes `task` by identity. Returns whether it was still present.
    pub(crate) fn remove(&self, task: &Arc<Task>) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = tasks.iter().position(|t| Arc::ptr_eq(t, task)) {
            tasks.remove(pos);
            true
        } else {
            false
        }
    }

    /// Raises the priority of every task strictly preceding `task` in FIFO
    /// order (spec §3's "positional priority rewrite", §4.D `waitFor`). A
    /// no-op if `task` isn't currently enqueued.
    pub(crate) fn raise_priority_of_predecessors(&self, task: &Arc<Task>, new_priority: Priority) {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for t in tasks.iter() {
            if Arc::ptr_eq(t, task) {
                break;
            }
            t.set_priority_field(new_priority);
        }
    }

    /// Empties the queue, used by `shutDown` (spec §4.D): enqueued tasks are
    /// cleared without execution.
    pub(crate) fn clear(&self) -> Vec<Arc<Task>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Mode, Priority, Task};

    fn task(id: u64) -> Arc<Task> {
        Task::new(id, Box::new(|| Box::new(()) as Box<dyn std::any::Any + Send>), Priority::Norm, Mode::Sync, false)
    }

    #[test]
    fn fifo_snapshot_preserves_insertion_order() {
        let queue = TaskQueue::new();
        queue.push(task(1));
        queue.push(task(2));
        let snap = queue.snapshot();
        assert_eq!(snap.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn remove_by_identity() {
        let queue = TaskQueue::new();
        let a = task(1);
        let b = task(2);
        queue.push(Arc::clone(&a));
        queue.push(Arc::clone(&b));
        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn raise_priority_stops_at_named_task() {
        let queue = TaskQueue::new();
        let a = task(1);
        let b = task(2);
        let c = task(3);
        queue.push(Arc::clone(&a));
        queue.push(Arc::clone(&b));
        queue.push(Arc::clone(&c));
        queue.raise_priority_of_predecessors(&b, Priority::Max);
        assert_eq!(a.priority(), Priority::Max);
        assert_eq!(b.priority(), Priority::Norm);
        assert_eq!(c.priority(), Priority::Norm);
    }
}
