//! Task: an executable plus its priority, mode, and completion state.
//!
//! # Overview
//!
//! The original design splits this into an abstract base with `Runnable` and
//! `Producer` subclasses. Per the design note on replacing inheritance with
//! tagged variants, [`Task`] is a single concrete, type-erased struct that
//! carries every shared capability (priority, mode, lifecycle, once-only
//! key), and the public handles [`RunnableTask`] and [`ProducerTask<T>`] are
//! thin typed wrappers around `Arc<Task>` that add `join()` where a result
//! type is known.
//!
//! Every [`Task`] is created already bound to an owner — a
//! [`QueuedTaskExecutor`](crate::executor::QueuedTaskExecutor) or an
//! [`ExecutorGroup`](crate::group::ExecutorGroup) — through the [`TaskOwner`]
//! trait, so `changePriority`/mode mutations can be routed to "just update a
//! field" or "move across queues" without the task needing to know which.

pub(crate) mod once_registry;

use std::any::Any;
use std::backtrace::Backtrace;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{AdmissionError, Error, TaskPanic};

pub use once_registry::OnceRegistry;

/// Execution priority tier (spec §3, §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Min,
    #[default]
    Norm,
    Max,
}

impl Priority {
    /// Clamps an arbitrary integer priority to the nearest legal tier: values
    /// below [`NORM_VALUE`](Priority::NORM_VALUE) go to `Min`, values at or
    /// above [`MAX_VALUE`](Priority::MAX_VALUE) go to `Max`, everything else
    /// is `Norm` (spec §4.E).
    pub fn clamp(value: i32) -> Self {
        if value < Self::NORM_VALUE {
            Priority::Min
        } else if value < Self::MAX_VALUE {
            Priority::Norm
        } else {
            Priority::Max
        }
    }

    pub const MIN_VALUE: i32 = 1;
    pub const NORM_VALUE: i32 = 5;
    pub const MAX_VALUE: i32 = 10;

    /// The representative integer value of this tier, used as an OS thread
    /// priority hint.
    pub fn value(self) -> i32 {
        match self {
            Priority::Min => Self::MIN_VALUE,
            Priority::Norm => Self::NORM_VALUE,
            Priority::Max => Self::MAX_VALUE,
        }
    }
}

/// Execution mode (spec §3, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Runs inline on the drain thread.
    Sync,
    /// Queued; a dedicated worker is started when drained.
    Async,
    /// Bypasses the queue; a worker is obtained and started at admission.
    PureAsync,
}

/// The drain-order lifecycle a [`Task`] moves through (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Submitted,
    Queued,
    Running,
    Finished,
    Aborted,
}

/// What a task produced, once it has a result (spec §3: "optional exception,
/// optional producer result").
pub(crate) enum Outcome {
    Pending,
    Success(Box<dyn Any + Send>),
    Panicked(TaskPanic),
}

/// Routes priority/mode mutations to whatever owns a [`Task`]'s queue slot.
///
/// A bare [`QueuedTaskExecutor`](crate::executor::QueuedTaskExecutor) has a
/// single queue, so `change_priority` only ever updates the task's field. An
/// [`ExecutorGroup`](crate::group::ExecutorGroup) owns three, so it can
/// actually move the task between them (spec §4.C, §4.E).
pub(crate) trait TaskOwner: Send + Sync {
    /// Admits a freshly submitted task: enqueues it, or for `PureAsync`,
    /// dispatches it immediately.
    fn admit(&self, task: Arc<Task>) -> Result<(), Error>;

    /// The task's priority field changed from `old_priority`. If currently
    /// queued under this owner, move it to reflect the new priority (Group
    /// moves it to a different tier's executor) or leave it in place (a
    /// bare executor has only one queue to begin with).
    fn change_priority(&self, task: &Arc<Task>, old_priority: Priority, new_priority: Priority);

    /// The task's mode field changed. If currently queued, rebind its
    /// worker assignment to match.
    fn rebind_mode(&self, task: &Arc<Task>, new_mode: Mode);
}

pub(crate) type Executable = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;

/// The type-erased, queue-and-worker-visible task entity (spec §3's Task).
pub struct Task {
    pub(crate) id: u64,
    priority: Mutex<Priority>,
    mode: Mutex<Mode>,
    lifecycle: Mutex<Lifecycle>,
    finished: Condvar,
    exec: Mutex<Option<Executable>>,
    outcome: Mutex<Outcome>,
    once_key: Option<String>,
    once_registry: Option<Arc<OnceRegistry>>,
    /// Set if this task lost the once-only race; all observers delegate to
    /// the winner instead (spec §4.C).
    collapsed_onto: Mutex<Option<Arc<Task>>>,
    owner: Mutex<Option<Arc<dyn TaskOwner>>>,
    owning_worker: Mutex<Option<std::thread::ThreadId>>,
    creation_site: Option<Backtrace>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &*self.priority.lock().unwrap_or_else(|e| e.into_inner()))
            .field("mode", &*self.mode.lock().unwrap_or_else(|e| e.into_inner()))
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        id: u64,
        exec: Executable,
        priority: Priority,
        mode: Mode,
        track_creation: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            priority: Mutex::new(priority),
            mode: Mutex::new(mode),
            lifecycle: Mutex::new(Lifecycle::Created),
            finished: Condvar::new(),
            exec: Mutex::new(Some(exec)),
            outcome: Mutex::new(Outcome::Pending),
            once_key: None,
            once_registry: None,
            collapsed_onto: Mutex::new(None),
            owner: Mutex::new(None),
            owning_worker: Mutex::new(None),
            creation_site: track_creation.then(Backtrace::force_capture),
        })
    }

    pub(crate) fn with_once_key(mut self: Arc<Self>, key: String, registry: Arc<OnceRegistry>) -> Arc<Self> {
        // `self` is freshly created and not yet shared: safe to mutate through
        // `Arc::get_mut`.
        let this = Arc::get_mut(&mut self).expect("task not yet shared at construction");
        this.once_key = Some(key);
        this.once_registry = Some(registry);
        self
    }

    pub(crate) fn bind_owner(self: &Arc<Self>, owner: Arc<dyn TaskOwner>) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = Some(owner);
    }

    pub(crate) fn priority(&self) -> Priority {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_priority_field(&self, p: Priority) {
        *self.priority.lock().unwrap_or_else(|e| e.into_inner()) = p;
    }

    pub(crate) fn mode(&self) -> Mode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn creation_backtrace(&self) -> Option<&Backtrace> {
        self.creation_site.as_ref()
    }

    /// The task actually tracking completion state: itself, unless it
    /// collapsed onto a once-only winner.
    fn effective(self: &Arc<Self>) -> Arc<Task> {
        match self.collapsed_onto.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(winner) => Arc::clone(winner),
            None => Arc::clone(self),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_submitted(self: &Arc<Self>) -> bool {
        !matches!(self.effective().lifecycle(), Lifecycle::Created)
    }

    pub fn has_started(self: &Arc<Self>) -> bool {
        matches!(
            self.effective().lifecycle(),
            Lifecycle::Running | Lifecycle::Finished | Lifecycle::Aborted
        )
    }

    pub fn has_finished(self: &Arc<Self>) -> bool {
        matches!(self.effective().lifecycle(), Lifecycle::Finished | Lifecycle::Aborted)
    }

    pub fn ended_with_errors(self: &Arc<Self>) -> bool {
        matches!(
            *self.effective().outcome.lock().unwrap_or_else(|e| e.into_inner()),
            Outcome::Panicked(_)
        )
    }

    pub fn get_exception(self: &Arc<Self>) -> Option<TaskPanic> {
        match &*self.effective().outcome.lock().unwrap_or_else(|e| e.into_inner()) {
            Outcome::Panicked(panic) => Some(panic.clone()),
            _ => None,
        }
    }

    /// Submits the task for execution (spec §4.C). Monotonic: fails if
    /// already submitted (P6). If a once-only key is set and another task
    /// already holds it, this submission collapses onto the winner and
    /// returns successfully without enqueuing anything of its own.
    pub fn submit(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*lifecycle, Lifecycle::Created) {
                return Err(AdmissionError::AlreadySubmitted.into());
            }
            *lifecycle = Lifecycle::Submitted;
        }

        if let (Some(key), Some(registry)) = (&self.once_key, &self.once_registry) {
            match registry.put_if_absent(key, self) {
                Ok(()) => {}
                Err(winner) => {
                    log::debug!(
                        "task {} collapsed onto once-only winner for key {:?}",
                        self.id,
                        key
                    );
                    *self.collapsed_onto.lock().unwrap_or_else(|e| e.into_inner()) = Some(winner);
                    *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::Queued;
                    return Ok(());
                }
            }
        }

        let owner = self
            .owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AdmissionError::ExecutorShutDown)?;
        owner.admit(Arc::clone(self))
    }

    /// Blocks until finished (spec P5, P8). Refuses to block (returns
    /// immediately) when called from the task's own worker thread unless
    /// `ignore_thread_check` is set, preventing a self-wait deadlock.
    pub fn wait_for_finish(self: &Arc<Self>, ignore_thread_check: bool) -> Result<(), Error> {
        let effective = self.effective();
        if !ignore_thread_check {
            let owning = *effective.owning_worker.lock().unwrap_or_else(|e| e.into_inner());
            if owning == Some(std::thread::current().id()) {
                return Err(Error::SelfWaitDeadlock);
            }
        }
        let lifecycle = effective.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let _finished = effective
            .finished
            .wait_while(lifecycle, |l| !matches!(l, Lifecycle::Finished | Lifecycle::Aborted))
            .unwrap_or_else(|e| e.into_inner());
        Ok(())
    }

    /// Like [`Task::wait_for_finish`] but bounded, used by
    /// [`ExecutorGroup::wait_for_tasks_ending`](crate::group::ExecutorGroup::wait_for_tasks_ending)
    /// style callers that must not block forever.
    pub(crate) fn wait_for_finish_timeout(self: &Arc<Self>, timeout: Duration) -> bool {
        let effective = self.effective();
        let lifecycle = effective.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, result) = effective
            .finished
            .wait_timeout_while(lifecycle, timeout, |l| {
                !matches!(l, Lifecycle::Finished | Lifecycle::Aborted)
            })
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }

    /// Changes priority (spec §4.C): if currently queued under a Group, the
    /// Group moves the task across tiers; otherwise this just updates the
    /// field for future dispatch.
    pub fn change_priority(self: &Arc<Self>, new_priority: Priority) {
        let old_priority = self.priority();
        self.set_priority_field(new_priority);
        if let Some(owner) = self.owner.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            owner.change_priority(self, old_priority, new_priority);
        }
    }

    fn set_mode(self: &Arc<Self>, new_mode: Mode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = new_mode;
        if let Some(owner) = self.owner.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            owner.rebind_mode(self, new_mode);
        }
    }

    pub fn sync(self: &Arc<Self>) {
        self.set_mode(Mode::Sync);
    }

    pub fn async_(self: &Arc<Self>) {
        self.set_mode(Mode::Async);
    }

    pub fn pure_async(self: &Arc<Self>) {
        self.set_mode(Mode::PureAsync);
    }

    /// Marks the owning worker thread, used by [`Task::wait_for_finish`]'s
    /// self-wait check.
    pub(crate) fn mark_running_on(self: &Arc<Self>, thread: std::thread::ThreadId) {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::Running;
        *self.owning_worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread);
    }

    pub(crate) fn mark_queued(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*lifecycle, Lifecycle::Submitted) {
            *lifecycle = Lifecycle::Queued;
        }
    }

    /// Runs the task's executable and records the outcome. Invoked by a
    /// worker (async/pure-async) or inline by the drain thread (sync).
    /// Finished ⇒ the executable reference is released: this always takes
    /// the closure out of its slot.
    pub(crate) fn execute(self: &Arc<Self>) {
        let exec = self.exec.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(exec) = exec else { return };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(exec));
        let (outcome, aborted) = match result {
            Ok(value) => (Outcome::Success(value), false),
            Err(payload) => {
                let panic = TaskPanic::from_payload(payload.as_ref());
                log::error!("task {} panicked: {}", self.id, panic.message());
                (Outcome::Panicked(panic), true)
            }
        };

        // Kept rather than taken: a ProducerTask::join may observe it more
        // than once (scenario 2 — result is cached, not consumed).
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) =
            if aborted { Lifecycle::Aborted } else { Lifecycle::Finished };
        *self.owning_worker.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.finished.notify_all();

        if let (Some(key), Some(registry)) = (&self.once_key, &self.once_registry) {
            registry.remove(key, self);
        }
    }

    /// Aborts the task without running its executable, recording `err` as
    /// the failure reason. Used when a task never reaches [`Task::execute`]
    /// because dispatch to a worker failed — without this, the task would
    /// stay `Queued`/`Running` forever and any caller in
    /// [`Task::wait_for_finish`] would hang.
    pub(crate) fn fail(self: &Arc<Self>, err: &Error) {
        self.exec.lock().unwrap_or_else(|e| e.into_inner()).take();
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Outcome::Panicked(TaskPanic::from_dispatch_failure(err));
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::Aborted;
        *self.owning_worker.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.finished.notify_all();

        if let (Some(key), Some(registry)) = (&self.once_key, &self.once_registry) {
            registry.remove(key, self);
        }
    }
}

/// A task whose executable returns nothing meaningful to the caller.
#[derive(Clone)]
pub struct RunnableTask(pub(crate) Arc<Task>);

impl RunnableTask {
    pub fn submit(&self) -> Result<(), Error> {
        self.0.submit()
    }

    pub fn wait_for_finish(&self, ignore_thread_check: bool) -> Result<(), Error> {
        self.0.wait_for_finish(ignore_thread_check)
    }

    pub fn priority(&self) -> Priority {
        self.0.priority()
    }

    pub fn change_priority(&self, priority: Priority) {
        self.0.change_priority(priority);
    }

    pub fn sync(&self) {
        self.0.sync();
    }

    pub fn async_(&self) {
        self.0.async_();
    }

    pub fn pure_async(&self) {
        self.0.pure_async();
    }

    pub fn get_exception(&self) -> Option<TaskPanic> {
        self.0.get_exception()
    }

    pub fn ended_with_errors(&self) -> bool {
        self.0.ended_with_errors()
    }

    pub fn is_submitted(&self) -> bool {
        self.0.is_submitted()
    }

    pub fn has_started(&self) -> bool {
        self.0.has_started()
    }

    pub fn has_finished(&self) -> bool {
        self.0.has_finished()
    }

    /// The stack at the point this task was created, if creation tracking
    /// was enabled on its owning executor at the time.
    pub fn creation_backtrace(&self) -> Option<String> {
        self.0.creation_backtrace().map(ToString::to_string)
    }

    pub(crate) fn inner(&self) -> &Arc<Task> {
        &self.0
    }
}

/// A task whose executable produces a `T`, retrievable via [`ProducerTask::join`].
#[derive(Clone)]
pub struct ProducerTask<T> {
    pub(crate) task: Arc<Task>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> ProducerTask<T> {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn submit(&self) -> Result<(), Error> {
        self.task.submit()
    }

    pub fn wait_for_finish(&self, ignore_thread_check: bool) -> Result<(), Error> {
        self.task.wait_for_finish(ignore_thread_check)
    }

    pub fn priority(&self) -> Priority {
        self.task.priority()
    }

    pub fn change_priority(&self, priority: Priority) {
        self.task.change_priority(priority);
    }

    pub fn sync(&self) {
        self.task.sync();
    }

    pub fn async_(&self) {
        self.task.async_();
    }

    pub fn pure_async(&self) {
        self.task.pure_async();
    }

    pub fn get_exception(&self) -> Option<TaskPanic> {
        self.task.get_exception()
    }

    pub fn ended_with_errors(&self) -> bool {
        self.task.ended_with_errors()
    }

    pub fn is_submitted(&self) -> bool {
        self.task.is_submitted()
    }

    pub fn has_started(&self) -> bool {
        self.task.has_started()
    }

    pub fn has_finished(&self) -> bool {
        self.task.has_finished()
    }

    /// The stack at the point this task was created, if creation tracking
    /// was enabled on its owning executor at the time.
    pub fn creation_backtrace(&self) -> Option<String> {
        self.task.creation_backtrace().map(ToString::to_string)
    }

    /// Waits for completion and returns the produced value. Repeated calls
    /// after the first return the cached result (scenario 2).
    pub fn join(&self) -> Result<T, Error> {
        self.task.wait_for_finish(false)?;
        let effective = self.task.effective();
        let outcome = effective.outcome.lock().unwrap_or_else(|e| e.into_inner());
        match &*outcome {
            Outcome::Success(value) => Ok(value
                .downcast_ref::<T>()
                .expect("producer task outcome type mismatch")
                .clone()),
            Outcome::Panicked(panic) => Err(Error::TaskFailed(panic.clone())),
            Outcome::Pending => unreachable!("wait_for_finish guarantees a recorded outcome"),
        }
    }
}
