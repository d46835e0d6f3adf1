//! A priority-aware, pool-backed task execution core with elastic
//! detached workers.
//!
//! Tasks are submitted to a [`group::ExecutorGroup`] (three priority
//! tiers sharing one worker pool) or directly to a bare
//! [`executor::QueuedTaskExecutor`]. Each tier drains its queue on its
//! own thread: `Sync` tasks run inline on the drain thread, `Async`
//! tasks are handed to the [`supplier::ThreadSupplier`] pool once
//! drained, and `PureAsync` tasks bypass the queue and dispatch
//! immediately on submission.
//!
//! ```
//! use taskforge::{ExecutorGroupBuilder, Mode, Priority};
//!
//! let group = ExecutorGroupBuilder::new("demo").build();
//! let task = group.create_producer(Priority::Norm, Mode::Async, || 21 * 2);
//! task.submit().unwrap();
//! assert_eq!(task.join().unwrap(), 42);
//! group.shut_down(true).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod group;
mod queue;
mod sync;
pub mod supplier;
pub mod task;
mod worker;

pub use config::SupplierConfig;
pub use error::{AdmissionError, ConfigError, Error, TaskPanic};
pub use executor::{QueuedTaskExecutor, QueuedTaskExecutorBuilder};
pub use group::{ExecutorGroup, ExecutorGroupBuilder};
pub use supplier::{ThreadSupplier, ThreadSupplierBuilder};
pub use task::{Mode, Priority, ProducerTask, RunnableTask};
