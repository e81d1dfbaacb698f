//! Runtime errors.

use tessera_core::{Arch, CoreError, TaskId};
use tessera_data::DataError;
use tessera_perf::PerfError;
use tessera_sched::SchedError;

/// Runtime result type
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Invalid configuration value
    #[error("Invalid configuration {field}: {reason}")]
    InvalidConfig {
        /// Configuration key or environment variable
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Task submitted with the wrong number of buffers
    #[error("Codelet {codelet} takes {expected} buffers, got {got}")]
    BufferCount {
        /// Codelet name
        codelet: String,
        /// Buffers the codelet declares
        expected: usize,
        /// Buffers supplied
        got: usize,
    },

    /// Codelet has no implementation at all
    #[error("Codelet {codelet} has no implementation")]
    NoImplementation {
        /// Codelet name
        codelet: String,
    },

    /// A worker popped a task its architecture cannot run
    #[error("Codelet {codelet} has no {arch} implementation")]
    MissingImplementation {
        /// Codelet name
        codelet: String,
        /// Worker architecture
        arch: Arch,
    },

    /// Explicit dependency on a task the runtime never saw
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// A task depends on itself
    #[error("Task {0} depends on itself")]
    DependencyCycle(TaskId),

    /// A kernel panicked
    #[error("Codelet {codelet} panicked: {message}")]
    KernelPanicked {
        /// Codelet name
        codelet: String,
        /// Panic payload, when it is a string
        message: String,
    },

    /// A task did not run to completion
    #[error("Task {task} failed: {reason}")]
    TaskFailed {
        /// Task that failed
        task: TaskId,
        /// What went wrong
        reason: String,
    },

    /// The runtime is shutting down
    #[error("Runtime is shut down")]
    ShutDown,

    /// Core error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Performance model error
    #[error(transparent)]
    Perf(#[from] PerfError),

    /// Data management error
    #[error(transparent)]
    Data(#[from] DataError),

    /// Scheduling error
    #[error(transparent)]
    Sched(#[from] SchedError),
}

impl RuntimeError {
    /// Configuration error for `field`
    pub(crate) fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
