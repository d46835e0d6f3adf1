//! Error types surfaced by the task-execution core.
//!
//! See spec §7 (Error Handling Design): admission failures are reported
//! distinctly from executable exceptions, which are captured on the [`Task`]
//! itself rather than propagated; everything else collapses into a single
//! runtime [`Error`] with a cause, matching the corpus' `thiserror`
//! convention (`vc_ecs`, `vc_ecs2`).
//!
//! [`Task`]: crate::task::Task

use std::fmt;

/// A [`Task::submit`](crate::task::Task::submit) failed before the task ever
/// reached a queue.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// `submit()` was called a second time on the same task (spec P6).
    #[error("task was already submitted")]
    AlreadySubmitted,

    /// The owning executor (or its group) has shut down and no longer
    /// accepts new work.
    #[error("executor has shut down")]
    ExecutorShutDown,

    /// A once-only task lost the race to an already-admitted task sharing
    /// its key. This is not really a failure: the caller's task collapses
    /// onto the winner and observes it through `waitForFinish`/`join`.
    #[error("a task with once-only key {0:?} is already running")]
    DuplicateOnceKey(String),
}

/// The panic payload captured from a user-supplied executable.
///
/// Spec §7: "Executable exceptions ... captured on the Task, logged, task
/// transitions to finished with `endedWithErrors=true`; do not propagate out
/// of the drain thread."
#[derive(Debug, Clone)]
pub struct TaskPanic {
    message: String,
}

impl TaskPanic {
    /// Synthesizes a panic record for a task whose executable never ran at
    /// all — e.g. dispatch to a worker failed — so callers blocked in
    /// `wait_for_finish`/`join` still observe a terminal state instead of
    /// hanging forever.
    pub(crate) fn from_dispatch_failure(err: &Error) -> Self {
        Self {
            message: format!("task never ran: {err}"),
        }
    }

    pub(crate) fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "executable panicked with a non-string payload".to_owned()
        };
        Self { message }
    }

    /// The panic message, best-effort downcast from the payload.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task executable panicked: {}", self.message)
    }
}

impl std::error::Error for TaskPanic {}

/// Configuration could not be resolved into a valid [`SupplierConfig`].
///
/// [`SupplierConfig`]: crate::config::SupplierConfig
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A `${KEY}` placeholder has no entry in the resolution source.
    #[error("unresolved placeholder `{0}` in config value")]
    UnresolvedPlaceholder(String),

    /// A placeholder resolves back to itself, directly or transitively.
    #[error("cyclic placeholder resolution starting at `{0}`")]
    CyclicPlaceholder(String),

    /// A value that must parse as an integer (or `"autodetect"`) did not.
    #[error("invalid value for `{key}`: {value:?}")]
    InvalidValue {
        /// The dotted config key, e.g. `thread-supplier.max-poolable-thread-count`.
        key: &'static str,
        /// The raw string that failed to parse.
        value: String,
    },

    /// TOML parsing of the configuration document failed.
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] TomlErrorShim),
}

/// Newtype so `ConfigError` doesn't leak `toml`'s error type through a
/// non-optional dependency edge when the `config` feature is disabled.
#[derive(Debug)]
pub struct TomlErrorShim(pub(crate) String);

impl fmt::Display for TomlErrorShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TomlErrorShim {}

/// A single internal runtime error kind with a cause, per spec §7:
/// "Library-internal surfaces convert checked conditions to a single
/// runtime error kind with a cause."
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task admission was rejected.
    #[error("admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// Configuration failed to resolve.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A blocking wait was interrupted by the caller's own worker thread,
    /// which would otherwise deadlock (spec P5).
    #[error("cannot wait on a task from its own worker thread")]
    SelfWaitDeadlock,

    /// `ProducerTask::join` was called on a task whose executable panicked.
    #[error("producer task failed: {0}")]
    TaskFailed(#[from] TaskPanic),

    /// A background thread (worker, drain thread, or notifier) could not be
    /// spawned by the OS.
    #[error("failed to spawn thread {name:?}: {source}")]
    ThreadSpawn {
        /// The name the thread was given.
        name: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The thread supplier exhausted its adaptive-growth retry budget
    /// without finding or creating a worker (spec §4.B step 4, §7
    /// "Saturation"). Ordinary contention resolves within one or two
    /// growth/retry cycles; this only fires when the pool is pathologically
    /// saturated (e.g. growth disabled and every worker permanently busy).
    #[error("thread supplier saturated after {attempts} growth attempts")]
    SupplierSaturated {
        /// How many growth/retry cycles were attempted before giving up.
        attempts: u32,
    },
}
