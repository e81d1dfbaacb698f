//! Core error types for TESSERA.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Unknown architecture name
    InvalidArch {
        /// The name that failed to parse
        name: String,
    },

    /// Invalid configuration value
    InvalidConfig {
        /// Configuration key
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Not found
    NotFound {
        /// Entity kind
        kind: String,
        /// Entity identifier
        id: String,
    },

    /// Operation not valid in the current state
    InvalidState {
        /// Description of the violated precondition
        reason: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArch { name } => write!(f, "Invalid architecture: {}", name),
            Self::InvalidConfig { field, reason } => {
                write!(f, "Invalid configuration for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::InvalidState { reason } => write!(f, "Invalid state: {}", reason),
        }
    }
}

impl std::error::Error for CoreError {}
