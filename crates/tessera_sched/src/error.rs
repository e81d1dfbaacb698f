//! Scheduling errors.

use tessera_core::{ArchSet, CoreError, TaskId};

/// Scheduling result type
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduling errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// No worker can run any of the task's implementations
    #[error("No eligible worker for {task}: requires one of {required}")]
    NoEligibleWorker {
        /// Task being placed
        task: TaskId,
        /// Architectures the task has implementations for
        required: ArchSet,
    },

    /// Unrecognised policy name
    #[error("Unknown scheduling policy: {name}")]
    UnknownPolicy {
        /// Name that failed to parse
        name: String,
    },

    /// The scheduler no longer accepts tasks
    #[error("Scheduler is shut down")]
    ShutDown,
}

impl From<SchedError> for CoreError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::UnknownPolicy { name } => CoreError::InvalidConfig {
                field: "policy".to_string(),
                reason: format!("unknown policy {name}"),
            },
            other => CoreError::InvalidState {
                reason: other.to_string(),
            },
        }
    }
}
