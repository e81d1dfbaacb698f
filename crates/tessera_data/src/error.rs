//! Data management errors.

use tessera_core::{CoreError, HandleId, MemoryNode};

/// Data management result type
pub type DataResult<T> = Result<T, DataError>;

/// Data management errors
///
/// Errors are `Clone` because one transfer outcome is delivered to every
/// consumer coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
    /// No valid replica anywhere and no home node to read from
    #[error("Consistency violation: {handle} has no valid copy to bring to {node}")]
    ConsistencyViolation {
        /// Handle being fetched
        handle: HandleId,
        /// Destination node
        node: MemoryNode,
    },

    /// A transfer kept failing past the retry limit
    #[error("Transfer of {handle} from {src} to {dst} failed after {attempts} attempts: {reason}")]
    TransferFailed {
        /// Handle being moved
        handle: HandleId,
        /// Source node
        src: MemoryNode,
        /// Destination node
        dst: MemoryNode,
        /// Attempts made
        attempts: u32,
        /// Last failure reported by the backend
        reason: String,
    },

    /// Node-local allocation failed
    #[error("Out of memory on {node}: requested {requested} bytes")]
    OutOfMemory {
        /// Node that ran out
        node: MemoryNode,
        /// Bytes requested
        requested: usize,
    },

    /// Handle does not exist (never registered or already unregistered)
    #[error("Unknown data handle: {0}")]
    UnknownHandle(HandleId),

    /// Memory node outside the machine
    #[error("Unknown memory node: {0}")]
    UnknownNode(MemoryNode),

    /// Operation is not allowed while the handle is partitioned
    #[error("Handle {0} is partitioned")]
    Partitioned(HandleId),

    /// Operation not valid in the current state
    #[error("Invalid state for {handle}: {reason}")]
    InvalidState {
        /// Handle involved
        handle: HandleId,
        /// Violated precondition
        reason: String,
    },

    /// A completion was dropped before delivering a result
    #[error("Completion for {0} was dropped")]
    CompletionDropped(HandleId),
}

impl From<DataError> for CoreError {
    fn from(err: DataError) -> Self {
        CoreError::InvalidState {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataError::ConsistencyViolation {
            handle: HandleId::from_index(2),
            node: MemoryNode::from_index(1),
        };
        let s = err.to_string();
        assert!(s.contains("h2"));
        assert!(s.contains("node1"));
    }

    #[test]
    fn test_transfer_failed_display() {
        let err = DataError::TransferFailed {
            handle: HandleId::from_index(0),
            src: MemoryNode::HOST,
            dst: MemoryNode::from_index(1),
            attempts: 3,
            reason: "bus error".to_string(),
        };
        assert!(err.to_string().contains("after 3 attempts: bus error"));
    }
}
