//! Queued Task Executor: one priority tier's drain thread, queue, and
//! suspend/resume/shutdown machinery (spec §3, §4.D).
//!
//! # Overview
//!
//! A single background "drain thread" repeatedly snapshots the queue and
//! dispatches each task: SYNC tasks run inline on the drain thread itself;
//! ASYNC tasks move to an in-flight set and get a worker from the
//! [`ThreadSupplier`]; PURE_ASYNC tasks never touch the queue at all —
//! they're dispatched immediately at admission (spec design note (c): "the
//! in-flight set, not the queue, is authoritative" for PURE_ASYNC).
//!
//! An [`ExecutorGroup`](crate::group::ExecutorGroup) builds three of these
//! sharing one [`ThreadSupplier`]; a bare [`QueuedTaskExecutor`] built
//! through [`QueuedTaskExecutorBuilder`] owns its supplier outright.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AdmissionError, Error};
use crate::sync::{KeyedMutexRegistry, Monitor};
use crate::supplier::{ThreadSupplier, ThreadSupplierBuilder};
use crate::task::once_registry::OnceRegistry;
use crate::task::{Executable, Mode, Priority, ProducerTask, RunnableTask, Task, TaskOwner};

const RESUME_KEY: &str = "resume";
const SUSPENSION_KEY: &str = "suspension";
const QUEUE_FILL_KEY: &str = "queue-fill";
const DRAIN_COMPLETE_KEY: &str = "drain-complete";

pub struct QueuedTaskExecutor {
    name: String,
    daemon: bool,
    undestroyable_owner: Option<String>,

    supplier: Arc<ThreadSupplier>,
    owns_supplier: bool,

    queue: crate::queue::TaskQueue,
    in_flight: Mutex<HashMap<u64, Arc<Task>>>,

    mutexes: KeyedMutexRegistry,
    resume_monitor: Monitor,
    suspension_monitor: Monitor,
    queue_fill_monitor: Monitor,
    drain_complete_monitor: Monitor,

    suspended: AtomicBool,
    terminated: AtomicBool,

    once_registry: Arc<OnceRegistry>,
    next_task_id: AtomicU64,
    track_creation: AtomicBool,

    drain_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

pub struct QueuedTaskExecutorBuilder {
    name: String,
    daemon: bool,
    undestroyable_owner: Option<String>,
    supplier: Option<Arc<ThreadSupplier>>,
    once_registry: Option<Arc<OnceRegistry>>,
}

impl QueuedTaskExecutorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daemon: true,
            undestroyable_owner: None,
            supplier: None,
            once_registry: None,
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Makes the executor "undestroyable": `shut_down` becomes a no-op
    /// unless invoked through [`QueuedTaskExecutor::shut_down_as`] with a
    /// matching `owner` token (spec §4.D "undestroyable variant").
    pub fn undestroyable(mut self, owner: impl Into<String>) -> Self {
        self.undestroyable_owner = Some(owner.into());
        self
    }

    /// Shares an externally owned supplier (used by
    /// [`ExecutorGroup`](crate::group::ExecutorGroup), whose three
    /// executors all draw from one pool) instead of creating a private one.
    pub(crate) fn supplier(mut self, supplier: Arc<ThreadSupplier>) -> Self {
        self.supplier = Some(supplier);
        self
    }

    pub(crate) fn once_registry(mut self, registry: Arc<OnceRegistry>) -> Self {
        self.once_registry = Some(registry);
        self
    }

    pub fn build(self) -> Arc<QueuedTaskExecutor> {
        let owns_supplier = self.supplier.is_none();
        let supplier = self
            .supplier
            .unwrap_or_else(|| ThreadSupplierBuilder::new(format!("{}-supplier", self.name)).build());
        let mutexes = KeyedMutexRegistry::new();
        let resume_monitor = mutexes.get_mutex(RESUME_KEY);
        let suspension_monitor = mutexes.get_mutex(SUSPENSION_KEY);
        let queue_fill_monitor = mutexes.get_mutex(QUEUE_FILL_KEY);
        let drain_complete_monitor = mutexes.get_mutex(DRAIN_COMPLETE_KEY);

        let executor = Arc::new(QueuedTaskExecutor {
            name: self.name,
            daemon: self.daemon,
            undestroyable_owner: self.undestroyable_owner,
            supplier,
            owns_supplier,
            queue: crate::queue::TaskQueue::new(),
            in_flight: Mutex::new(HashMap::new()),
            mutexes,
            resume_monitor,
            suspension_monitor,
            queue_fill_monitor,
            drain_complete_monitor,
            suspended: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            once_registry: self.once_registry.unwrap_or_else(|| Arc::new(OnceRegistry::new())),
            next_task_id: AtomicU64::new(0),
            track_creation: AtomicBool::new(false),
            drain_thread: Mutex::new(None),
        });

        let drain_executor = Arc::clone(&executor);
        let handle = std::thread::Builder::new()
            .name(format!("{}-drain", executor.name))
            .spawn(move || drain_executor.drain_loop())
            .expect("failed to spawn drain thread");
        *executor.drain_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        executor
    }
}

impl QueuedTaskExecutor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn set_tasks_creation_tracking(&self, enabled: bool) {
        self.track_creation.store(enabled, Ordering::Release);
    }

    /// How many tasks are currently enqueued, awaiting drain.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds a task bound to this executor's id sequence, once-registry,
    /// and creation-tracking flag, but does not bind an owner or enqueue
    /// it — used by [`ExecutorGroup`](crate::group::ExecutorGroup) so a
    /// group-created task can bind the group itself as owner instead.
    pub(crate) fn new_unbound_task(&self, exec: Executable, priority: Priority, mode: Mode) -> Arc<Task> {
        Task::new(self.next_id(), exec, priority, mode, self.track_creation.load(Ordering::Acquire))
    }

    pub(crate) fn new_unbound_once_task(
        &self,
        key: String,
        exec: Executable,
        priority: Priority,
        mode: Mode,
    ) -> Arc<Task> {
        self.new_unbound_task(exec, priority, mode)
            .with_once_key(key, Arc::clone(&self.once_registry))
    }

    pub fn create_runnable(
        self: &Arc<Self>,
        priority: Priority,
        mode: Mode,
        f: impl FnOnce() + Send + 'static,
    ) -> RunnableTask {
        let exec: Executable = Box::new(move || {
            f();
            Box::new(()) as Box<dyn Any + Send>
        });
        let task = Task::new(self.next_id(), exec, priority, mode, self.track_creation.load(Ordering::Acquire));
        task.bind_owner(Arc::clone(self) as Arc<dyn TaskOwner>);
        RunnableTask(task)
    }

    pub fn create_producer<T: Clone + Send + 'static>(
        self: &Arc<Self>,
        priority: Priority,
        mode: Mode,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> ProducerTask<T> {
        let exec: Executable = Box::new(move || Box::new(f()) as Box<dyn Any + Send>);
        let task = Task::new(self.next_id(), exec, priority, mode, self.track_creation.load(Ordering::Acquire));
        task.bind_owner(Arc::clone(self) as Arc<dyn TaskOwner>);
        ProducerTask::new(task)
    }

    pub fn create_once_only_runnable(
        self: &Arc<Self>,
        key: impl Into<String>,
        priority: Priority,
        mode: Mode,
        f: impl FnOnce() + Send + 'static,
    ) -> RunnableTask {
        let exec: Executable = Box::new(move || {
            f();
            Box::new(()) as Box<dyn Any + Send>
        });
        let task = Task::new(self.next_id(), exec, priority, mode, self.track_creation.load(Ordering::Acquire))
            .with_once_key(key.into(), Arc::clone(&self.once_registry));
        task.bind_owner(Arc::clone(self) as Arc<dyn TaskOwner>);
        RunnableTask(task)
    }

    fn notify_queue_fill(&self) {
        let (lock, cvar) = &*self.queue_fill_monitor;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        cvar.notify_all();
    }

    fn notify_drain_complete(&self) {
        let (lock, cvar) = &*self.drain_complete_monitor;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        cvar.notify_all();
    }

    fn notify_suspension_waiters(&self) {
        let (lock, cvar) = &*self.suspension_monitor;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        cvar.notify_all();
    }

    pub(crate) fn admit_task(&self, task: Arc<Task>) -> Result<(), Error> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(AdmissionError::ExecutorShutDown.into());
        }
        task.mark_queued();
        if task.mode() == Mode::PureAsync {
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.id, Arc::clone(&task));
            if let Err(err) = self.supplier.dispatch(Arc::clone(&task), task.priority()) {
                self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&task.id);
                task.fail(&err);
                return Err(err);
            }
            return Ok(());
        }
        self.queue.push(task);
        self.notify_queue_fill();
        Ok(())
    }

    /// Pushes an already-admitted task directly onto this executor's queue,
    /// bypassing admission checks — used by
    /// [`ExecutorGroup`](crate::group::ExecutorGroup) to move a task here
    /// from a different tier's executor.
    pub(crate) fn requeue(&self, task: Arc<Task>) {
        self.queue.push(task);
        self.notify_queue_fill();
    }

    pub(crate) fn queue_remove(&self, task: &Arc<Task>) -> bool {
        self.queue.remove(task)
    }

    pub(crate) fn rebind_mode_inner(&self, task: &Arc<Task>, new_mode: Mode) {
        if new_mode == Mode::PureAsync && self.queue.remove(task) {
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.id, Arc::clone(task));
            if let Err(err) = self.supplier.dispatch(Arc::clone(task), task.priority()) {
                log::error!("{}: failed to rebind task {} to pure-async: {err}", self.name, task.id);
                self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&task.id);
                task.fail(&err);
            }
        }
    }

    fn prune_finished_in_flight(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| !t.has_finished());
    }

    fn join_in_flight(&self) {
        loop {
            self.prune_finished_in_flight();
            let pending: Vec<Arc<Task>> = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .cloned()
                .collect();
            if pending.is_empty() {
                return;
            }
            for task in pending {
                let _ = task.wait_for_finish_timeout(Duration::from_millis(200));
            }
        }
    }

    /// Raises the priority of every task preceding `task` in this queue, and
    /// of any currently in-flight (already dispatched) tasks, then blocks
    /// until `task` finishes (spec §4.D `waitFor`, scenario 5).
    pub(crate) fn wait_for(self: &Arc<Self>, task: &Arc<Task>, priority: Priority) -> Result<(), Error> {
        self.queue.raise_priority_of_predecessors(task, priority);
        for (_, in_flight_task) in self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            if !Arc::ptr_eq(in_flight_task, task) {
                in_flight_task.set_priority_field(priority);
            }
        }
        self.notify_suspension_waiters();
        task.wait_for_finish(false)
    }

    /// Immediate suspension (spec §4.D): sets the suspended flag, waits for
    /// in-flight async tasks to join, and for the drain loop to observe the
    /// flag if a SYNC task is currently running inline.
    pub fn suspend_immediate(&self) {
        self.suspended.store(true, Ordering::Release);
        self.join_in_flight();
        let (lock, cvar) = &*self.suspension_monitor;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let _ = cvar.wait_timeout(guard, Duration::from_millis(500));
        log::debug!("{}: immediate suspension in effect", self.name);
    }

    /// Graceful suspension (spec §4.D): enqueues a zero-body once-only
    /// sentinel task that flips the suspended flag, escalates every
    /// currently-queued task's priority to the caller's, and awaits the
    /// sentinel's completion.
    pub fn suspend_graceful(self: &Arc<Self>, caller_priority: Priority) -> Result<(), Error> {
        for task in self.queue.snapshot() {
            task.set_priority_field(caller_priority);
        }
        let executor = Arc::clone(self);
        let exec: Executable = Box::new(move || {
            executor.suspended.store(true, Ordering::Release);
            Box::new(()) as Box<dyn Any + Send>
        });
        let task = Task::new(self.next_id(), exec, caller_priority, Mode::Sync, false)
            .with_once_key(format!("{}::__suspend__", self.name), Arc::clone(&self.once_registry));
        task.bind_owner(Arc::clone(self) as Arc<dyn TaskOwner>);
        task.submit()?;
        task.wait_for_finish(true)?;
        log::info!("{}: graceful suspension complete", self.name);
        Ok(())
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        let (lock, cvar) = &*self.resume_monitor;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        cvar.notify_all();
        log::debug!("{}: resumed", self.name);
    }

    /// Blocks until the queue (and in-flight async tasks) drain. If
    /// `wait_for_new_added`, repeats until a full pass observes the queue
    /// still empty (new admissions during the wait are swept up too).
    pub fn wait_until_drained(&self, wait_for_new_added: bool) {
        loop {
            {
                let (lock, cvar) = &*self.drain_complete_monitor;
                let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let _g = cvar
                    .wait_timeout_while(guard, Duration::from_millis(200), |_| {
                        !self.queue.is_empty() && !self.terminated.load(Ordering::Acquire)
                    })
                    .unwrap_or_else(|e| e.into_inner());
            }
            self.join_in_flight();
            if !wait_for_new_added || self.queue.is_empty() {
                return;
            }
        }
    }

    /// Shuts down. No-op if the executor is undestroyable and `caller`
    /// doesn't match the owner token recorded at creation.
    pub fn shut_down_as(self: &Arc<Self>, caller: &str, wait_for_tasks_termination: bool) -> Result<(), Error> {
        if let Some(owner) = &self.undestroyable_owner {
            if owner != caller {
                log::debug!("{}: shutdown rejected, caller identity mismatch", self.name);
                return Ok(());
            }
        }
        self.shut_down_inner(wait_for_tasks_termination)
    }

    /// Shuts down. No-op if the executor was built
    /// [`undestroyable`](QueuedTaskExecutorBuilder::undestroyable); use
    /// [`shut_down_as`](Self::shut_down_as) with the matching owner token
    /// instead.
    pub fn shut_down(self: &Arc<Self>, wait_for_tasks_termination: bool) -> Result<(), Error> {
        if self.undestroyable_owner.is_some() {
            log::debug!("{}: shutdown rejected, executor is undestroyable", self.name);
            return Ok(());
        }
        self.shut_down_inner(wait_for_tasks_termination)
    }

    fn shut_down_inner(self: &Arc<Self>, wait_for_tasks_termination: bool) -> Result<(), Error> {
        if wait_for_tasks_termination {
            self.suspend_graceful(Priority::Max)?;
        } else {
            self.suspend_immediate();
        }
        self.terminated.store(true, Ordering::Release);
        self.queue.clear();
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.resume();
        self.notify_queue_fill();

        if let Some(handle) = self.drain_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        if self.owns_supplier {
            self.supplier.shut_down_all();
        }
        self.mutexes.remove_mutex(RESUME_KEY, &self.resume_monitor);
        self.mutexes.remove_mutex(SUSPENSION_KEY, &self.suspension_monitor);
        self.mutexes.remove_mutex(QUEUE_FILL_KEY, &self.queue_fill_monitor);
        self.mutexes.remove_mutex(DRAIN_COMPLETE_KEY, &self.drain_complete_monitor);
        log::info!("{}: executor shut down", self.name);
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The drain loop (spec §4.D pseudocode).
    fn drain_loop(self: Arc<Self>) {
        loop {
            if self.terminated.load(Ordering::Acquire) {
                break;
            }
            if !self.queue.is_empty() {
                for task in self.queue.snapshot() {
                    if self.suspended.load(Ordering::Acquire) {
                        let (lock, cvar) = &*self.resume_monitor;
                        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                        let _g = cvar
                            .wait_while(guard, |_| self.suspended.load(Ordering::Acquire))
                            .unwrap_or_else(|e| e.into_inner());
                        break;
                    }
                    if !self.queue.remove(&task) {
                        continue;
                    }
                    match task.mode() {
                        Mode::Sync => {
                            task.mark_running_on(std::thread::current().id());
                            task.execute();
                        }
                        Mode::Async | Mode::PureAsync => {
                            self.in_flight
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(task.id, Arc::clone(&task));
                            if let Err(err) = self.supplier.dispatch(Arc::clone(&task), task.priority()) {
                                log::error!("{}: failed to dispatch task {}: {err}", self.name, task.id);
                                self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&task.id);
                                task.fail(&err);
                            }
                        }
                    }
                    self.notify_suspension_waiters();
                    if self.terminated.load(Ordering::Acquire) {
                        break;
                    }
                }
            } else {
                self.notify_drain_complete();
                let (lock, cvar) = &*self.queue_fill_monitor;
                let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let _g = cvar
                    .wait_timeout_while(guard, Duration::from_millis(200), |_| {
                        self.queue.is_empty() && !self.terminated.load(Ordering::Acquire)
                    })
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        log::info!("{}: drain thread terminated", self.name);
    }
}

impl TaskOwner for QueuedTaskExecutor {
    fn admit(&self, task: Arc<Task>) -> Result<(), Error> {
        self.admit_task(task)
    }

    fn change_priority(&self, _task: &Arc<Task>, _old_priority: Priority, _new_priority: Priority) {
        // A bare executor has a single queue: the field update performed by
        // `Task::change_priority` is the whole story.
    }

    fn rebind_mode(&self, task: &Arc<Task>, new_mode: Mode) {
        self.rebind_mode_inner(task, new_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn sync_tasks_run_in_fifo_order() {
        let executor = QueuedTaskExecutorBuilder::new("test").build();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..50 {
            let order = Arc::clone(&order);
            let task = executor.create_runnable(Priority::Norm, Mode::Sync, move || {
                order.lock().unwrap().push(i);
            });
            task.submit().unwrap();
            tasks.push(task);
        }
        executor.wait_until_drained(false);
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
        executor.shut_down(true).unwrap();
    }

    #[test]
    fn producer_task_join_returns_cached_result() {
        let executor = QueuedTaskExecutorBuilder::new("test").build();
        let task = executor.create_producer(Priority::Norm, Mode::Async, || 42);
        task.submit().unwrap();
        assert_eq!(task.join().unwrap(), 42);
        assert_eq!(task.join().unwrap(), 42);
        executor.shut_down(true).unwrap();
    }

    #[test]
    fn double_submit_fails() {
        let executor = QueuedTaskExecutorBuilder::new("test").build();
        let task = executor.create_runnable(Priority::Norm, Mode::Sync, || {});
        task.submit().unwrap();
        let err = task.submit().unwrap_err();
        assert!(matches!(err, Error::Admission(AdmissionError::AlreadySubmitted)));
        executor.shut_down(true).unwrap();
    }

    #[test]
    fn undestroyable_executor_ignores_plain_shutdown() {
        let executor = QueuedTaskExecutorBuilder::new("test").undestroyable("owner-token").build();
        executor.shut_down(true).unwrap();
        assert!(!executor.is_terminated());
        executor.shut_down_as("owner-token", true).unwrap();
        assert!(executor.is_terminated());
    }

    #[test]
    fn suspend_immediate_blocks_new_starts_until_resumed() {
        let executor = QueuedTaskExecutorBuilder::new("test").build();
        executor.suspend_immediate();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let task = executor.create_runnable(Priority::Norm, Mode::Sync, move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        task.submit().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
        executor.resume();
        task.wait_for_finish(true).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        executor.shut_down(true).unwrap();
    }

    #[test]
    fn dispatch_failure_aborts_the_task_instead_of_hanging_waiters() {
        use crate::config::{RawCount, SupplierConfig};

        // A pool that can never grow past one poolable worker and never
        // spawns a detached one: with that worker occupied, the next
        // dispatch saturates and exhausts its growth-retry budget into
        // `Error::SupplierSaturated`.
        let config = SupplierConfig {
            max_poolable_thread_count: RawCount::Fixed(1),
            max_detached_thread_count: Some(0),
            poolable_thread_request_timeout_ms: 1,
            increasing_step: 0,
            ..SupplierConfig::default()
        };
        let supplier = ThreadSupplierBuilder::new("test-saturated").config(config).build();
        let executor = QueuedTaskExecutorBuilder::new("test").supplier(supplier).build();

        let hold = Arc::new(AtomicBool::new(true));
        let hold_clone = Arc::clone(&hold);
        let occupying = executor.create_runnable(Priority::Norm, Mode::Async, move || {
            while hold_clone.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        occupying.submit().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let stuck = executor.create_runnable(Priority::Norm, Mode::Async, || {});
        stuck.submit().unwrap();

        // Before the fix, a dispatch failure dropped the task from
        // `in_flight` without ever reaching a terminal lifecycle state, so
        // this would hang forever instead of returning here.
        stuck.wait_for_finish(false).unwrap();
        assert!(stuck.has_finished());
        assert!(stuck.ended_with_errors());
        assert!(stuck.get_exception().is_some());

        hold.store(false, Ordering::SeqCst);
        occupying.wait_for_finish(false).unwrap();
        executor.shut_down(true).unwrap();
    }
}
