//! Thread Supplier: the hybrid worker pool (spec §3, §4.B).
//!
//! # Overview
//!
//! Multiplexes a fixed-size pool of reusable ("poolable") workers with an
//! elastically bounded set of single-use ("detached") workers. Acquisition
//! tries, in order: a parked poolable worker, a fresh poolable worker (if
//! under the poolable cap), a fresh detached worker (if under the current
//! total cap), or a bounded wait that adaptively grows the total cap on
//! timeout and decays it back down after a quiescent period.
//!
//! The sleeping-slot array and the per-slot keyed mutexes that guard it
//! implement spec §4.B's parking/retrieval protocol directly; the
//! notifier is a single daemon thread that decouples worker completion
//! from contention on the supplier's own wait monitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::SupplierConfig;
use crate::error::Error;
use crate::sync::{KeyedMutexRegistry, Monitor};
use crate::task::{Priority, Task};
use crate::worker::{Job, Worker, WorkerKind, WorkerState};

/// How many growth/retry cycles a single dispatch will attempt before
/// reporting [`Error::SupplierSaturated`] (spec §4.B step 4: "bounded
/// recursion serves as adaptive backpressure relief"). Generous: ordinary
/// contention resolves within one or two cycles.
const GROWTH_RETRY_BUDGET: u32 = 256;

const SLEEPING_ARRAY_KEY: &str = "sleeping-array";

pub struct ThreadSupplier {
    name: String,
    max_poolable: usize,
    initial_max_total: usize,
    increasing_step: u32,
    request_timeout: Duration,
    decay_threshold: Duration,
    daemon_default: bool,

    poolable_count: AtomicUsize,
    total_count: AtomicUsize,
    current_max_total: AtomicUsize,
    next_worker_id: AtomicU64,
    scan_forward: AtomicBool,
    last_growth: Mutex<Instant>,

    slots: Mutex<Vec<Option<Arc<Worker>>>>,
    running: Mutex<HashMap<u64, Arc<Worker>>>,
    mutexes: KeyedMutexRegistry,
    wait_monitor: Monitor,
    notifier: Mutex<Option<Arc<NotifierHandle>>>,
    alive: AtomicBool,
}

struct NotifierHandle {
    thread: std::thread::Thread,
    alive: AtomicBool,
}

pub struct ThreadSupplierBuilder {
    name: String,
    config: SupplierConfig,
}

impl ThreadSupplierBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SupplierConfig::default(),
        }
    }

    pub fn config(mut self, config: SupplierConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<ThreadSupplier> {
        let max_poolable = self.config.resolve_max_poolable().max(1);
        let initial_max_total = match self.config.max_detached() {
            Some(detached) => max_poolable.saturating_add(detached),
            None => usize::MAX,
        };
        let mutexes = KeyedMutexRegistry::new();
        let wait_monitor = mutexes.get_mutex(SLEEPING_ARRAY_KEY);
        Arc::new(ThreadSupplier {
            name: self.name,
            max_poolable,
            initial_max_total,
            increasing_step: self.config.increasing_step,
            request_timeout: self.config.request_timeout(),
            decay_threshold: self.config.decay_threshold(),
            daemon_default: self.config.default_daemon_flag_value,
            poolable_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
            current_max_total: AtomicUsize::new(initial_max_total),
            next_worker_id: AtomicU64::new(0),
            scan_forward: AtomicBool::new(true),
            last_growth: Mutex::new(Instant::now()),
            slots: Mutex::new((0..max_poolable).map(|_| None).collect()),
            running: Mutex::new(HashMap::new()),
            mutexes,
            wait_monitor,
            notifier: Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }
}

impl ThreadSupplier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poolable_count(&self) -> usize {
        self.poolable_count.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> usize {
        self.total_count.load(Ordering::Acquire)
    }

    pub fn current_max_total(&self) -> usize {
        self.current_max_total.load(Ordering::Acquire)
    }

    /// Runs `task` on a worker obtained via `getOrCreate` (spec §4.B). Loops
    /// through the five-step acquisition algorithm; on saturation, waits
    /// with adaptive cap growth/decay and retries, bounded by
    /// [`GROWTH_RETRY_BUDGET`].
    pub(crate) fn dispatch(self: &Arc<Self>, task: Arc<Task>, priority: Priority) -> Result<(), Error> {
        let mut attempts = 0u32;
        loop {
            if let Some(worker) = self.try_take_parked() {
                worker.assign(Job { task }, priority);
                worker.set_state(WorkerState::Running);
                worker.unpark();
                return Ok(());
            }

            if self.poolable_count.load(Ordering::Acquire) < self.max_poolable {
                self.spawn_poolable(task, priority)?;
                return Ok(());
            }

            if self.total_count.load(Ordering::Acquire) < self.current_max_total.load(Ordering::Acquire) {
                self.spawn_detached(task, priority)?;
                return Ok(());
            }

            let (lock, cvar) = &*self.wait_monitor;
            let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            // Re-check under the wait monitor before actually waiting, so a
            // worker freed between the unlocked checks above and here isn't
            // missed.
            if let Some(worker) = self.try_take_parked() {
                drop(guard);
                worker.assign(Job { task }, priority);
                worker.set_state(WorkerState::Running);
                worker.unpark();
                return Ok(());
            }
            if self.poolable_count.load(Ordering::Acquire) < self.max_poolable {
                drop(guard);
                self.spawn_poolable(task, priority)?;
                return Ok(());
            }
            if self.total_count.load(Ordering::Acquire) < self.current_max_total.load(Ordering::Acquire) {
                drop(guard);
                self.spawn_detached(task, priority)?;
                return Ok(());
            }

            let (_guard, timeout_result) = cvar
                .wait_timeout(guard, self.request_timeout)
                .unwrap_or_else(|e| e.into_inner());

            attempts += 1;
            if timeout_result.timed_out() {
                self.grow();
            } else {
                self.maybe_decay();
            }
            if attempts >= GROWTH_RETRY_BUDGET {
                return Err(Error::SupplierSaturated { attempts });
            }
        }
    }

    fn grow(&self) {
        if self.increasing_step == 0 {
            // Spec §4.B step 5: growth disabled degenerates to a polling retry.
            log::debug!("{}: supplier saturated, growth disabled, polling", self.name);
            return;
        }
        self.current_max_total
            .fetch_add(self.increasing_step as usize, Ordering::AcqRel);
        *self.last_growth.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        log::info!(
            "{}: grew detached cap to {} after request timeout",
            self.name,
            self.current_max_total.load(Ordering::Acquire)
        );
    }

    fn maybe_decay(&self) {
        let current = self.current_max_total.load(Ordering::Acquire);
        if current <= self.initial_max_total {
            return;
        }
        let mut last_growth = self.last_growth.lock().unwrap_or_else(|e| e.into_inner());
        if last_growth.elapsed() < self.decay_threshold {
            return;
        }
        let decrement = (self.increasing_step / 2) as usize;
        let floor = self.initial_max_total;
        let new_total = current.saturating_sub(decrement).max(floor);
        self.current_max_total.store(new_total, Ordering::Release);
        *last_growth = Instant::now();
        log::info!("{}: decayed detached cap to {new_total} after quiescence", self.name);
    }

    fn next_base_name(&self, kind: WorkerKind) -> (u64, String) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let label = match kind {
            WorkerKind::Poolable => "poolable",
            WorkerKind::Detached => "detached",
        };
        (id, format!("{}-{label}-{id}", self.name))
    }

    fn spawn_poolable(self: &Arc<Self>, task: Arc<Task>, priority: Priority) -> Result<(), Error> {
        let (id, base_name) = self.next_base_name(WorkerKind::Poolable);
        let worker = Worker::new(id, WorkerKind::Poolable, self.daemon_default, base_name.clone(), Some(Job { task }));
        worker.set_priority_hint(priority);

        let supplier = Arc::clone(self);
        let thread_worker = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(base_name.clone())
            .spawn(move || supplier.run_poolable(thread_worker))
            .map_err(|source| Error::ThreadSpawn { name: base_name, source })?;
        worker.set_thread_handle(handle.thread().clone());

        self.poolable_count.fetch_add(1, Ordering::AcqRel);
        self.total_count.fetch_add(1, Ordering::AcqRel);
        log::debug!("{}: spawned poolable worker {id}", self.name);
        Ok(())
    }

    fn spawn_detached(self: &Arc<Self>, task: Arc<Task>, priority: Priority) -> Result<(), Error> {
        let (id, base_name) = self.next_base_name(WorkerKind::Detached);
        let worker = Worker::new(id, WorkerKind::Detached, self.daemon_default, base_name.clone(), Some(Job { task }));
        worker.set_priority_hint(priority);

        let supplier = Arc::clone(self);
        let thread_worker = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(base_name.clone())
            .spawn(move || supplier.run_detached(thread_worker))
            .map_err(|source| Error::ThreadSpawn { name: base_name, source })?;
        worker.set_thread_handle(handle.thread().clone());

        self.total_count.fetch_add(1, Ordering::AcqRel);
        log::debug!("{}: spawned detached worker {id}", self.name);
        Ok(())
    }

    /// Poolable run loop (spec §4.A).
    fn run_poolable(self: Arc<Self>, worker: Arc<Worker>) {
        loop {
            let Some(job) = worker.wait_for_job() else {
                break;
            };
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(worker.id(), Arc::clone(&worker));

            job.task.mark_running_on(std::thread::current().id());
            job.task.execute();

            self.running.lock().unwrap_or_else(|e| e.into_inner()).remove(&worker.id());
            worker.reset_name();

            if !worker.is_alive() {
                break;
            }
            if !self.park_worker(Arc::clone(&worker)) {
                log::error!("{}: worker {} failed to find a sleeping slot, self-terminating", self.name, worker.id());
                worker.kill();
                break;
            }
            self.notify_waiter();
        }
        self.retire_poolable(&worker);
    }

    /// Detached run loop (spec §4.A): no reuse path.
    fn run_detached(self: Arc<Self>, worker: Arc<Worker>) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker.id(), Arc::clone(&worker));
        if let Some(job) = worker.take_job() {
            job.task.mark_running_on(std::thread::current().id());
            job.task.execute();
        }
        self.running.lock().unwrap_or_else(|e| e.into_inner()).remove(&worker.id());
        self.total_count.fetch_sub(1, Ordering::AcqRel);
        self.notify_waiter();
        log::debug!("{}: detached worker {} finished", self.name, worker.id());
    }

    fn retire_poolable(self: &Arc<Self>, worker: &Arc<Worker>) {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).remove(&worker.id());
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|w| w.id() == worker.id()) {
                *slot = None;
            }
        }
        drop(slots);
        self.poolable_count.fetch_sub(1, Ordering::AcqRel);
        self.total_count.fetch_sub(1, Ordering::AcqRel);
        self.notify_waiter();
        debug_assert_eq!(worker.kind(), WorkerKind::Poolable);
        log::debug!("{}: poolable worker {} retired", self.name, worker.id());
    }

    fn scan_order(&self) -> Vec<usize> {
        let n = self.max_poolable;
        let forward = !self.scan_forward.fetch_xor(true, Ordering::Relaxed);
        if forward { (0..n).collect() } else { (0..n).rev().collect() }
    }

    /// Acquisition step 1: scan the sleeping-slot array, alternating
    /// direction each call. A worker found not actually parked is defective
    /// (the retrieval freshness rule) and is interrupted instead of handed
    /// out.
    fn try_take_parked(&self) -> Option<Arc<Worker>> {
        for i in self.scan_order() {
            let key = format!("slot-{i}");
            let taken = self.mutexes.execute(&key, || {
                self.slots.lock().unwrap_or_else(|e| e.into_inner())[i].take()
            });
            let Some(worker) = taken else { continue };
            if worker.state() == WorkerState::Parked {
                return Some(worker);
            }
            log::error!(
                "{}: worker {} ({}, priority {:?}) in slot {i} was not parked, interrupting as defective",
                self.name,
                worker.name(),
                if worker.is_daemon() { "daemon" } else { "non-daemon" },
                worker.priority()
            );
            worker.kill();
        }
        None
    }

    /// Parking protocol (spec §4.B `addPoolableSleepingThread`): alternating
    /// scan for a NULL slot, guarded per-slot so two workers never publish
    /// into the same slot.
    fn park_worker(&self, worker: Arc<Worker>) -> bool {
        for i in self.scan_order() {
            let key = format!("slot-{i}");
            let published = self.mutexes.execute(&key, || {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                if slots[i].is_none() {
                    worker.set_state(WorkerState::Parked);
                    slots[i] = Some(Arc::clone(&worker));
                    true
                } else {
                    false
                }
            });
            if published {
                return true;
            }
        }
        false
    }

    /// Lazily spawns the notifier daemon on first use, then wakes it.
    pub(crate) fn notify_waiter(self: &Arc<Self>) {
        match self.ensure_notifier() {
            Ok(handle) => handle.thread.unpark(),
            Err(_) => {
                // Degraded fallback: notify inline rather than drop the wakeup.
                let (_lock, cvar) = &*self.wait_monitor;
                cvar.notify_all();
            }
        }
    }

    fn ensure_notifier(self: &Arc<Self>) -> Result<Arc<NotifierHandle>, Error> {
        let mut slot = self.notifier.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let supplier = Arc::clone(self);
        let name = format!("{}-notifier", self.name);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || supplier.run_notifier())
            .map_err(|source| Error::ThreadSpawn { name, source })?;
        let notifier = Arc::new(NotifierHandle {
            thread: handle.thread().clone(),
            alive: AtomicBool::new(true),
        });
        *slot = Some(Arc::clone(&notifier));
        Ok(notifier)
    }

    fn run_notifier(self: Arc<Self>) {
        loop {
            std::thread::park();
            let alive = self
                .notifier
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .is_some_and(|h| h.alive.load(Ordering::Acquire));
            if !alive {
                break;
            }
            let (_lock, cvar) = &*self.wait_monitor;
            cvar.notify_all();
        }
        log::debug!("{}: notifier retired", self.name);
    }

    /// Shuts down every worker (spec §4.B `shutDownAll`): parked workers are
    /// marked not-alive and woken so they exit; running workers are marked
    /// not-alive so they exit after their current job; the notifier is
    /// retired last.
    pub fn shut_down_all(self: &Arc<Self>) {
        self.alive.store(false, Ordering::Release);

        let parked: Vec<Arc<Worker>> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.iter_mut().filter_map(|s| s.take()).collect()
        };
        for worker in &parked {
            worker.kill();
        }

        let running: Vec<Arc<Worker>> = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for worker in &running {
            worker.mark_not_alive();
        }

        if let Some(handle) = self.notifier.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.alive.store(false, Ordering::Release);
            handle.thread.unpark();
        }
        log::info!("{}: thread supplier shut down", self.name);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Mode, Task};
    use std::sync::atomic::AtomicU32;

    fn runnable(counter: Arc<AtomicU32>) -> Arc<Task> {
        Task::new(
            0,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(()) as Box<dyn std::any::Any + Send>
            }),
            Priority::Norm,
            Mode::Async,
            false,
        )
    }

    #[test]
    fn dispatch_creates_a_poolable_worker_and_runs_the_task() {
        let mut config = SupplierConfig::default();
        config.max_poolable_thread_count = crate::config::RawCount::Fixed(2);
        let supplier = ThreadSupplierBuilder::new("test").config(config).build();
        let counter = Arc::new(AtomicU32::new(0));
        let task = runnable(Arc::clone(&counter));
        supplier.dispatch(Arc::clone(&task), Priority::Norm).unwrap();
        task.wait_for_finish(true).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(supplier.poolable_count(), 1);
    }

    #[test]
    fn poolable_worker_is_reused_after_parking() {
        let mut config = SupplierConfig::default();
        config.max_poolable_thread_count = crate::config::RawCount::Fixed(1);
        let supplier = ThreadSupplierBuilder::new("test").config(config).build();
        let counter = Arc::new(AtomicU32::new(0));

        let first = runnable(Arc::clone(&counter));
        supplier.dispatch(Arc::clone(&first), Priority::Norm).unwrap();
        first.wait_for_finish(true).unwrap();

        // Give the worker a moment to publish itself back into its slot.
        std::thread::sleep(Duration::from_millis(50));

        let second = runnable(Arc::clone(&counter));
        supplier.dispatch(Arc::clone(&second), Priority::Norm).unwrap();
        second.wait_for_finish(true).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(supplier.poolable_count(), 1);
        assert_eq!(supplier.total_count(), 1);
    }

    #[test]
    fn detached_worker_spawns_once_poolable_cap_is_reached() {
        let mut config = SupplierConfig::default();
        config.max_poolable_thread_count = crate::config::RawCount::Fixed(1);
        config.max_detached_thread_count = Some(2);
        let supplier = ThreadSupplierBuilder::new("test").config(config).build();

        let blocker_started = Arc::new(std::sync::Barrier::new(2));
        let release = Arc::new(AtomicBool::new(false));
        let blocker_started_clone = Arc::clone(&blocker_started);
        let release_clone = Arc::clone(&release);
        let blocking_task = Task::new(
            1,
            Box::new(move || {
                blocker_started_clone.wait();
                while !release_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Box::new(()) as Box<dyn std::any::Any + Send>
            }),
            Priority::Norm,
            Mode::Async,
            false,
        );
        supplier.dispatch(Arc::clone(&blocking_task), Priority::Norm).unwrap();
        blocker_started.wait();

        let counter = Arc::new(AtomicU32::new(0));
        let second = runnable(Arc::clone(&counter));
        supplier.dispatch(Arc::clone(&second), Priority::Norm).unwrap();
        // `dispatch` spawns the detached worker synchronously before
        // returning, so the counters are deterministic right here.
        assert_eq!(supplier.poolable_count(), 1);
        assert_eq!(supplier.total_count(), 2);

        second.wait_for_finish(true).unwrap();
        // The detached worker decrements its counters just after notifying
        // task completion; give it a moment to finish housekeeping.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(supplier.total_count(), 1);

        release.store(true, Ordering::SeqCst);
        blocking_task.wait_for_finish(true).unwrap();
    }

    #[test]
    fn shut_down_all_retires_parked_workers() {
        let mut config = SupplierConfig::default();
        config.max_poolable_thread_count = crate::config::RawCount::Fixed(1);
        let supplier = ThreadSupplierBuilder::new("test").config(config).build();
        let counter = Arc::new(AtomicU32::new(0));
        let task = runnable(Arc::clone(&counter));
        supplier.dispatch(Arc::clone(&task), Priority::Norm).unwrap();
        task.wait_for_finish(true).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        supplier.shut_down_all();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(supplier.poolable_count(), 0);
    }
}
