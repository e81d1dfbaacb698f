//! Per-node and per-worker copies of a data handle.

use crate::backend::NodeBuffer;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use tessera_core::{MemoryNode, RequestId};

/// MSI state of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// Only valid copy; may be written
    Owner,
    /// Valid copy, possibly one of several
    Shared,
    /// Contents are stale
    Invalid,
}

impl CacheState {
    /// Whether the contents may be read
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "OWNER"),
            Self::Shared => write!(f, "SHARED"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Access counters for one replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStats {
    /// Fetches served by an already valid copy
    pub direct_access: u64,
    /// Transfers that landed as SHARED
    pub loaded_shared: u64,
    /// Transfers that landed as OWNER
    pub loaded_owner: u64,
    /// Write accesses upgrading a SHARED copy in place
    pub shared_to_owner: u64,
    /// Times a valid copy was invalidated
    pub invalidated: u64,
}

impl AccessStats {
    /// Add another set of counters into this one
    pub fn merge(&mut self, other: &AccessStats) {
        self.direct_access += other.direct_access;
        self.loaded_shared += other.loaded_shared;
        self.loaded_owner += other.loaded_owner;
        self.shared_to_owner += other.shared_to_owner;
        self.invalidated += other.invalidated;
    }
}

/// One copy of a handle on a memory node, or private to a worker
#[derive(Debug, Clone)]
pub struct Replica {
    pub(crate) node: MemoryNode,
    pub(crate) state: CacheState,
    pub(crate) allocated: bool,
    pub(crate) automatically_allocated: bool,
    pub(crate) initialized: bool,
    pub(crate) relaxed: bool,
    pub(crate) refcnt: u32,
    pub(crate) buffer: Option<NodeBuffer>,
    /// Bit `s` is set while a transfer from node `s` into this replica is in flight
    pub(crate) requested: BitVec,
    /// Request currently filling this replica
    pub(crate) pending: Option<RequestId>,
}

impl Replica {
    pub(crate) fn new(node: MemoryNode, nnodes: usize) -> Self {
        Self {
            node,
            state: CacheState::Invalid,
            allocated: false,
            automatically_allocated: false,
            initialized: false,
            relaxed: false,
            refcnt: 0,
            buffer: None,
            requested: bitvec![0; nnodes],
            pending: None,
        }
    }

    /// Node holding the replica
    #[must_use]
    pub const fn node(&self) -> MemoryNode {
        self.node
    }

    /// MSI state
    #[must_use]
    pub const fn state(&self) -> CacheState {
        self.state
    }

    /// Whether node-local storage exists
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Whether the contents may be read
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// Whether any transfer into this replica is in flight
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.any()
    }

    /// Pins against deallocation
    #[must_use]
    pub const fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Whether the replica exempts itself from single-owner coherency
    #[must_use]
    pub const fn is_relaxed(&self) -> bool {
        self.relaxed
    }

    /// Node-local storage, if allocated
    #[must_use]
    pub fn buffer(&self) -> Option<&NodeBuffer> {
        self.buffer.as_ref()
    }

    pub(crate) fn attach(&mut self, buffer: NodeBuffer, automatic: bool) {
        self.buffer = Some(buffer);
        self.allocated = true;
        self.automatically_allocated = automatic;
    }

    /// Detach storage the runtime allocated itself, if nothing holds it
    pub(crate) fn take_reclaimable(&mut self) -> Option<NodeBuffer> {
        if !self.automatically_allocated || self.refcnt > 0 || self.pending.is_some() {
            return None;
        }
        self.allocated = false;
        self.automatically_allocated = false;
        self.initialized = false;
        self.buffer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replica_is_invalid() {
        let r = Replica::new(MemoryNode::from_index(1), 3);
        assert_eq!(r.state(), CacheState::Invalid);
        assert!(!r.is_allocated());
        assert!(!r.is_requested());
        assert_eq!(r.requested.len(), 3);
    }

    #[test]
    fn test_reclaim_respects_pins() {
        let node = MemoryNode::from_index(1);
        let mut r = Replica::new(node, 2);
        r.attach(NodeBuffer::zeroed(node, 8), true);
        r.refcnt = 1;
        assert!(r.take_reclaimable().is_none());

        r.refcnt = 0;
        assert!(r.take_reclaimable().is_some());
        assert!(!r.is_allocated());
    }

    #[test]
    fn test_application_storage_never_reclaimed() {
        let mut r = Replica::new(MemoryNode::HOST, 1);
        r.attach(NodeBuffer::zeroed(MemoryNode::HOST, 8), false);
        assert!(r.take_reclaimable().is_none());
        assert!(r.is_allocated());
    }

    #[test]
    fn test_stats_merge() {
        let mut a = AccessStats {
            direct_access: 1,
            ..AccessStats::default()
        };
        let b = AccessStats {
            direct_access: 2,
            invalidated: 3,
            ..AccessStats::default()
        };
        a.merge(&b);
        assert_eq!(a.direct_access, 3);
        assert_eq!(a.invalidated, 3);
    }
}
