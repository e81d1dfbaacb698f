//! Performance model errors.

use tessera_core::{CoreError, TaskKind};

/// Performance model result type
pub type PerfResult<T> = Result<T, PerfError>;

/// Performance model errors
#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    /// Sampling directory I/O failed
    #[error("Sampling I/O error at {path}: {source}")]
    Io {
        /// File or directory involved
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A saved model could not be decoded
    #[error("Invalid model file {path}: {reason}")]
    InvalidModel {
        /// File involved
        path: String,
        /// Decoder message
        reason: String,
    },

    /// No model registered for the task kind
    #[error("No performance model for {0}")]
    UnknownKind(TaskKind),
}

impl From<PerfError> for CoreError {
    fn from(err: PerfError) -> Self {
        CoreError::InvalidState {
            reason: err.to_string(),
        }
    }
}
