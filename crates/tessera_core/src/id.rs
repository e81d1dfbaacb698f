//! Identifiers for TESSERA entities.
//!
//! Arena-backed entities (handles, tasks, workers, memory nodes) are
//! addressed by dense indices. Task kinds are name-derived UUIDs so that
//! performance models keep the same key across processes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task kind identifier - identifies the computation a task performs
///
/// Performance models are keyed by task kind, so the same symbol must map
/// to the same kind in every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKind(Uuid);

impl TaskKind {
    /// Create a new random TaskKind
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a symbol (stable across runs)
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, symbol.as_bytes()))
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kind_{}", self.0)
    }
}

/// Data handle identifier - slot in the handle registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u32);

impl HandleId {
    /// Create from a registry slot index
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Registry slot index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Task identifier - slot in the task arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Create from a raw sequence number
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Worker identifier - index into the worker registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Create from a worker index
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Worker index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Memory node identifier - an addressable memory domain
///
/// Node 0 is always host RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryNode(u32);

impl MemoryNode {
    /// Host RAM
    pub const HOST: MemoryNode = MemoryNode(0);

    /// Create from a node index
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Node index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Scheduling context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ContextId(u32);

impl ContextId {
    /// The context every task lands in unless told otherwise
    pub const DEFAULT: ContextId = ContextId(0);

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Data request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_from_symbol() {
        let k1 = TaskKind::from_symbol("gemm");
        let k2 = TaskKind::from_symbol("gemm");
        assert_eq!(k1, k2);

        let k3 = TaskKind::from_symbol("potrf");
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_task_kind_random() {
        assert_ne!(TaskKind::new(), TaskKind::new());
    }

    #[test]
    fn test_index_roundtrip() {
        assert_eq!(HandleId::from_index(7).index(), 7);
        assert_eq!(WorkerId::from_index(3).index(), 3);
        assert_eq!(MemoryNode::from_index(2).index(), 2);
        assert_eq!(MemoryNode::HOST.index(), 0);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", HandleId::from_index(4)), "h4");
        assert_eq!(format!("{}", TaskId::from_raw(9)), "t9");
        assert_eq!(format!("{}", WorkerId::from_index(1)), "w1");
        assert_eq!(format!("{}", MemoryNode::HOST), "node0");
        assert!(format!("{}", TaskKind::from_symbol("x")).starts_with("kind_"));
    }

    #[test]
    fn test_context_default() {
        assert_eq!(ContextId::default(), ContextId::DEFAULT);
    }
}
