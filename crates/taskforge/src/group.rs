//! Executor Group: three priority-tiered executors sharing one thread
//! supplier (spec §3, §4.E).
//!
//! A caller submits tasks through the group without ever choosing a tier
//! directly — the task's own priority, clamped to `Min`/`Norm`/`Max` via
//! [`Priority::clamp`], selects which of the three [`QueuedTaskExecutor`]s
//! holds it. Priority changes move a queued task from one tier's queue to
//! another's; mode changes and suspend/resume/shutdown still act per-tier
//! the way a bare executor does, just fanned out across all three.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SupplierConfig;
use crate::error::Error;
use crate::executor::{QueuedTaskExecutor, QueuedTaskExecutorBuilder};
use crate::supplier::ThreadSupplierBuilder;
use crate::task::{Executable, Mode, Priority, ProducerTask, RunnableTask, Task, TaskOwner};

pub struct ExecutorGroup {
    name: String,
    undestroyable_owner: Option<String>,
    tiers: HashMap<Priority, Arc<QueuedTaskExecutor>>,
    supplier: Arc<crate::supplier::ThreadSupplier>,
}

pub struct ExecutorGroupBuilder {
    name: String,
    daemon: bool,
    undestroyable_owner: Option<String>,
    config: SupplierConfig,
}

impl ExecutorGroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daemon: true,
            undestroyable_owner: None,
            config: SupplierConfig::default(),
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Makes every tier of the group undestroyable: see
    /// [`QueuedTaskExecutorBuilder::undestroyable`].
    pub fn undestroyable(mut self, owner: impl Into<String>) -> Self {
        self.undestroyable_owner = Some(owner.into());
        self
    }

    pub fn config(mut self, config: SupplierConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<ExecutorGroup> {
        let supplier = ThreadSupplierBuilder::new(format!("{}-supplier", self.name))
            .config(self.config)
            .build();
        // Once-only de-duplication is a property of the group as a whole,
        // not of any one tier: two submissions sharing a key may arrive at
        // different priorities and must still collapse onto one winner.
        let once_registry = Arc::new(crate::task::OnceRegistry::new());

        let mut tiers = HashMap::new();
        for priority in [Priority::Min, Priority::Norm, Priority::Max] {
            let tier_name = format!("{}-{:?}", self.name, priority);
            let mut builder = QueuedTaskExecutorBuilder::new(tier_name)
                .daemon(self.daemon)
                .supplier(Arc::clone(&supplier))
                .once_registry(Arc::clone(&once_registry));
            if let Some(owner) = &self.undestroyable_owner {
                builder = builder.undestroyable(owner.clone());
            }
            tiers.insert(priority, builder.build());
        }

        Arc::new(ExecutorGroup {
            name: self.name,
            undestroyable_owner: self.undestroyable_owner,
            tiers,
            supplier,
        })
    }
}

impl ExecutorGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(poolable_count, total_count, current_max_total)` of the shared
    /// worker pool backing all three tiers (spec §4.B growth/decay).
    pub fn supplier_stats(&self) -> (usize, usize, usize) {
        (
            self.supplier.poolable_count(),
            self.supplier.total_count(),
            self.supplier.current_max_total(),
        )
    }

    fn tier(&self, priority: Priority) -> &Arc<QueuedTaskExecutor> {
        self.tiers
            .get(&Priority::clamp(priority.value()))
            .expect("all three priority tiers are always present")
    }

    pub fn set_tasks_creation_tracking(&self, enabled: bool) {
        for executor in self.tiers.values() {
            executor.set_tasks_creation_tracking(enabled);
        }
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
        let task = self.tier(priority).new_unbound_task(exec, priority, mode);
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
        let task = self.tier(priority).new_unbound_task(exec, priority, mode);
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
        let task = self.tier(priority).new_unbound_once_task(key.into(), exec, priority, mode);
        task.bind_owner(Arc::clone(self) as Arc<dyn TaskOwner>);
        RunnableTask(task)
    }

    /// Raises the priority of `task`'s predecessors (within its current
    /// tier) and in-flight siblings, then blocks until it finishes (spec
    /// §4.E, scenario 5).
    pub fn wait_for(self: &Arc<Self>, task: &RunnableTask, priority: Priority) -> Result<(), Error> {
        let inner = task.inner();
        self.tier(inner.priority()).wait_for(inner, priority)
    }

    /// Blocks until the tier matching `priority` has drained (spec §4.E
    /// `waitForTasksEnding`).
    pub fn wait_for_tasks_ending(&self, priority: Priority, wait_for_new_added_tasks: bool) {
        self.tier(priority).wait_until_drained(wait_for_new_added_tasks);
    }

    pub fn suspend_immediate(&self) {
        for executor in self.tiers.values() {
            executor.suspend_immediate();
        }
    }

    pub fn suspend_graceful(self: &Arc<Self>, caller_priority: Priority) -> Result<(), Error> {
        for executor in self.tiers.values() {
            executor.suspend_graceful(caller_priority)?;
        }
        Ok(())
    }

    pub fn resume(&self) {
        for executor in self.tiers.values() {
            executor.resume();
        }
    }

    pub fn shut_down_as(self: &Arc<Self>, caller: &str, wait_for_tasks_termination: bool) -> Result<(), Error> {
        if let Some(owner) = &self.undestroyable_owner {
            if owner != caller {
                log::debug!("{}: shutdown rejected, caller identity mismatch", self.name);
                return Ok(());
            }
        }
        self.shut_down_inner(wait_for_tasks_termination)
    }

    pub fn shut_down(self: &Arc<Self>, wait_for_tasks_termination: bool) -> Result<(), Error> {
        if self.undestroyable_owner.is_some() {
            log::debug!("{}: shutdown rejected, group is undestroyable", self.name);
            return Ok(());
        }
        self.shut_down_inner(wait_for_tasks_termination)
    }

    fn shut_down_inner(self: &Arc<Self>, wait_for_tasks_termination: bool) -> Result<(), Error> {
        // Each tier's `shut_down` joins its own drain thread but does not
        // touch the supplier (`owns_supplier` is false for group tiers); the
        // group retires it once, after every tier has stopped submitting.
        for executor in self.tiers.values() {
            executor.shut_down(wait_for_tasks_termination)?;
        }
        self.supplier.shut_down_all();
        log::info!("{}: executor group shut down", self.name);
        Ok(())
    }
}

impl TaskOwner for ExecutorGroup {
    fn admit(&self, task: Arc<Task>) -> Result<(), Error> {
        self.tier(task.priority()).admit_task(task)
    }

    fn change_priority(&self, task: &Arc<Task>, old_priority: Priority, new_priority: Priority) {
        let old_tier = Priority::clamp(old_priority.value());
        let new_tier = Priority::clamp(new_priority.value());
        if old_tier == new_tier {
            return;
        }
        let Some(from) = self.tiers.get(&old_tier) else { return };
        let Some(to) = self.tiers.get(&new_tier) else { return };
        if from.queue_remove(task) {
            to.requeue(Arc::clone(task));
        }
    }

    fn rebind_mode(&self, task: &Arc<Task>, new_mode: Mode) {
        self.tier(task.priority()).rebind_mode_inner(task, new_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn tasks_run_through_their_priority_tier() {
        let group = ExecutorGroupBuilder::new("test").build();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let task = group.create_runnable(Priority::Norm, Mode::Sync, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        task.submit().unwrap();
        task.wait_for_finish(false).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        group.shut_down(true).unwrap();
    }

    #[test]
    fn change_priority_moves_a_queued_task_across_tiers() {
        let group = ExecutorGroupBuilder::new("test").build();
        group.suspend_immediate();

        let task = group.create_runnable(Priority::Min, Mode::Sync, || {});
        task.submit().unwrap();
        task.change_priority(Priority::Max);

        assert!(!group.tier(Priority::Min).queue_remove(task.inner()));
        assert!(group.tier(Priority::Max).queue_remove(task.inner()));

        group.resume();
        group.shut_down(true).unwrap();
    }

    #[test]
    fn once_only_submission_collapses_onto_the_first_winner() {
        let group = ExecutorGroupBuilder::new("test").build();
        let runs = Arc::new(AtomicU32::new(0));
        let make = || {
            let runs = Arc::clone(&runs);
            group.create_once_only_runnable("dedup-key", Priority::Norm, Mode::Sync, move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        let a = make();
        let b = make();
        a.submit().unwrap();
        b.submit().unwrap();
        a.wait_for_finish(false).unwrap();
        b.wait_for_finish(false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        group.shut_down(true).unwrap();
    }
}
