//! Worker: a single OS thread that runs task executables (spec §3, §4.A).
//!
//! A [`Worker`] doesn't know how it was acquired or where it lives — the
//! [`ThreadSupplier`](crate::supplier::ThreadSupplier) owns the sleeping-slot
//! array, the running set, and both run loops (`run_poolable`/`run_detached`
//! in `supplier.rs`). This module only holds the per-worker state those
//! loops read and mutate: identity, name, priority hint, the assigned job
//! slot, and the alive/parked bookkeeping the freshness rule depends on.

use std::sync::{Arc, Mutex, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::task::{Priority, Task};

/// Which lifecycle a [`Worker`] follows (spec §3: "Variant ∈ {Poolable, Detached}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    /// Reusable: parks in a sleeping slot between jobs.
    Poolable,
    /// Single-use: exits once its job completes.
    Detached,
}

/// A worker's observed state, used by the retrieval freshness rule (spec
/// §4.B): a worker pulled from a sleeping slot must be `Parked`, or it is
/// treated as defective and interrupted instead of handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Parked,
    Running,
}

/// One unit of dispatch: the task a worker is to run.
pub(crate) struct Job {
    pub task: Arc<Task>,
}

pub struct Worker {
    id: u64,
    kind: WorkerKind,
    daemon: bool,
    alive: AtomicBool,
    state: Mutex<WorkerState>,
    base_name: String,
    name: Mutex<String>,
    priority: Mutex<Priority>,
    job: Mutex<Option<Job>>,
    thread: OnceLock<std::thread::Thread>,
}

impl Worker {
    pub(crate) fn new(id: u64, kind: WorkerKind, daemon: bool, base_name: String, initial_job: Option<Job>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            daemon,
            alive: AtomicBool::new(true),
            state: Mutex::new(WorkerState::Running),
            name: Mutex::new(base_name.clone()),
            base_name,
            priority: Mutex::new(Priority::Norm),
            job: Mutex::new(initial_job),
            thread: OnceLock::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn rename_for_task(&self, task_id: u64) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = format!("{}:task-{task_id}", self.base_name);
    }

    pub(crate) fn reset_name(&self) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = self.base_name.clone();
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Best-effort OS-thread priority hint (spec §4.D `waitFor` escalation);
    /// not a correctness property.
    pub(crate) fn set_priority_hint(&self, p: Priority) {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner()) = p;
    }

    pub(crate) fn set_thread_handle(&self, thread: std::thread::Thread) {
        let _ = self.thread.set(thread);
    }

    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Interrupts a parked worker: marks it dead and wakes it so its run
    /// loop observes `!is_alive()` and exits.
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::Release);
        self.unpark();
    }

    /// Marks a currently-running worker for exit after its current job,
    /// without waking it (it isn't parked).
    pub(crate) fn mark_not_alive(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn assign(&self, job: Job, priority: Priority) {
        let task_id = job.task.id;
        *self.job.lock().unwrap_or_else(|e| e.into_inner()) = Some(job);
        self.set_priority_hint(priority);
        self.rename_for_task(task_id);
    }

    pub(crate) fn take_job(&self) -> Option<Job> {
        self.job.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Blocks the calling (worker) thread until a job is assigned or the
    /// worker is killed, using `thread::park` as the per-worker monitor
    /// (spec §4.A step 6: "park on own monitor awaiting reassignment").
    pub(crate) fn wait_for_job(self: &Arc<Self>) -> Option<Job> {
        loop {
            if let Some(job) = self.take_job() {
                return Some(job);
            }
            if !self.is_alive() {
                return None;
            }
            std::thread::park();
        }
    }
}
