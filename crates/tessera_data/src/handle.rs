//! Logical data objects.
//!
//! A [`DataHandle`] owns one replica per memory node and, for scratch and
//! reduction accesses, one private replica per worker. Everything mutable
//! sits behind the handle's own lock so unrelated handles never contend.
//! Partition links are handle ids resolved through the registry.

use crate::replica::{AccessStats, CacheState, Replica};
use bitvec::prelude::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use tessera_core::{AccessMode, HandleId, MemoryNode, TaskId};

/// Identity initialiser for a reduction accumulator
pub type InitFn = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Commutative combine: fold `src` into `dst`
pub type ReduxFn = Arc<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Operators used by reduction-mode accesses
#[derive(Clone)]
pub struct ReductionOps {
    /// Writes the identity element into a fresh accumulator
    pub init: InitFn,
    /// Folds one accumulator into another
    pub redux: ReduxFn,
}

impl ReductionOps {
    /// Bundle an initialiser and a combine operator
    #[must_use]
    pub fn new(init: InitFn, redux: ReduxFn) -> Self {
        Self { init, redux }
    }
}

impl std::fmt::Debug for ReductionOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReductionOps")
    }
}

/// A fetch held back until the running reduction is committed
pub(crate) struct FrozenFetch {
    pub node: MemoryNode,
    pub mode: AccessMode,
    pub prefetch: bool,
    pub completion: crate::request::Completion,
}

/// Mutable state of a handle, guarded by [`DataHandle`]'s lock
pub(crate) struct HandleState {
    pub size: usize,
    pub footprint: u32,
    pub home: Option<MemoryNode>,
    pub wt_mask: BitVec,
    pub sequential_consistency: bool,

    // Implicit ordering
    pub last_writers: Vec<TaskId>,
    pub group: Vec<TaskId>,
    pub group_mode: Option<AccessMode>,

    // Reductions
    pub reduction: Option<ReductionOps>,
    pub reduction_refcnt: u32,
    pub frozen: Vec<FrozenFetch>,

    // Partition tree
    pub parent: Option<HandleId>,
    pub root: HandleId,
    pub children: Vec<HandleId>,
    pub sibling_index: usize,
    pub depth: u32,

    pub per_node: Vec<Replica>,
    pub per_worker: Vec<Replica>,
    pub stats: Vec<AccessStats>,

    /// Consumer pins plus in-flight requests
    pub refcnt: u32,
    /// Bumped by every invalidation
    pub epoch: u64,
    /// Bumped by every change that makes in-flight transfers stale
    pub version: u64,
    pub lazy_unregister: bool,
    pub unregistered: bool,
}

impl HandleState {
    pub(crate) fn new(
        id: HandleId,
        size: usize,
        footprint: u32,
        nnodes: usize,
        worker_nodes: &[MemoryNode],
    ) -> Self {
        Self {
            size,
            footprint,
            home: None,
            wt_mask: bitvec![0; nnodes],
            sequential_consistency: true,
            last_writers: Vec::new(),
            group: Vec::new(),
            group_mode: None,
            reduction: None,
            reduction_refcnt: 0,
            frozen: Vec::new(),
            parent: None,
            root: id,
            children: Vec::new(),
            sibling_index: 0,
            depth: 0,
            per_node: (0..nnodes)
                .map(|n| Replica::new(MemoryNode::from_index(n), nnodes))
                .collect(),
            per_worker: worker_nodes
                .iter()
                .map(|&node| Replica::new(node, nnodes))
                .collect(),
            stats: vec![AccessStats::default(); nnodes],
            refcnt: 0,
            epoch: 0,
            version: 0,
            lazy_unregister: false,
            unregistered: false,
        }
    }

    pub(crate) fn replica(&self, node: MemoryNode) -> Option<&Replica> {
        self.per_node.get(node.index())
    }

    pub(crate) fn is_partitioned(&self) -> bool {
        !self.children.is_empty()
    }

    /// Tasks the next access in `mode` by `task` must wait for
    ///
    /// Consecutive reads form a group, as do consecutive reductions; a
    /// group ends when an access of another kind arrives, and its members
    /// become the predecessors of everything after.
    pub(crate) fn implicit_dependencies(&mut self, task: TaskId, mode: AccessMode) -> Vec<TaskId> {
        if !self.sequential_consistency {
            return Vec::new();
        }
        match mode {
            AccessMode::Scratch => Vec::new(),
            AccessMode::Write | AccessMode::ReadWrite => {
                let deps = if self.group.is_empty() {
                    std::mem::take(&mut self.last_writers)
                } else {
                    std::mem::take(&mut self.group)
                };
                self.group_mode = None;
                self.last_writers = vec![task];
                deps
            }
            AccessMode::Read | AccessMode::Redux => {
                if self.group_mode != Some(mode) && !self.group.is_empty() {
                    self.last_writers = std::mem::take(&mut self.group);
                }
                self.group_mode = Some(mode);
                self.group.push(task);
                self.last_writers.clone()
            }
        }
    }
}

/// A logical data object
pub struct DataHandle {
    id: HandleId,
    pub(crate) state: Mutex<HandleState>,
    pub(crate) drained: Condvar,
}

impl DataHandle {
    pub(crate) fn new(id: HandleId, state: HandleState) -> Self {
        Self {
            id,
            state: Mutex::new(state),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    /// Handle identifier
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Layout footprint
    #[must_use]
    pub fn footprint(&self) -> u32 {
        self.lock().footprint
    }

    /// Home node, if the handle wraps application storage
    #[must_use]
    pub fn home(&self) -> Option<MemoryNode> {
        self.lock().home
    }

    /// Parent handle, for partition children
    #[must_use]
    pub fn parent(&self) -> Option<HandleId> {
        self.lock().parent
    }

    /// Root of the partition tree
    #[must_use]
    pub fn root(&self) -> HandleId {
        self.lock().root
    }

    /// Children, while partitioned
    #[must_use]
    pub fn children(&self) -> Vec<HandleId> {
        self.lock().children.clone()
    }

    /// Position among siblings
    #[must_use]
    pub fn sibling_index(&self) -> usize {
        self.lock().sibling_index
    }

    /// Depth in the partition tree (root is 0)
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.lock().depth
    }

    /// Pins plus in-flight requests
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.lock().refcnt
    }

    /// State of the replica on `node`
    #[must_use]
    pub fn state_on(&self, node: MemoryNode) -> Option<CacheState> {
        self.lock().replica(node).map(Replica::state)
    }

    /// Whether `node` holds a valid copy
    #[must_use]
    pub fn is_valid_on(&self, node: MemoryNode) -> bool {
        self.state_on(node).is_some_and(CacheState::is_valid)
    }

    /// Snapshot of every per-node replica
    #[must_use]
    pub fn replicas(&self) -> Vec<Replica> {
        self.lock().per_node.clone()
    }

    /// Number of per-node replicas in OWNER state
    #[must_use]
    pub fn owner_count(&self) -> usize {
        crate::coherency::owner_count(&self.lock().per_node)
    }

    /// Enable or disable implicit ordering of accesses
    pub fn set_sequential_consistency(&self, enabled: bool) {
        self.lock().sequential_consistency = enabled;
    }

    /// Whether implicit ordering is enabled
    #[must_use]
    pub fn sequential_consistency(&self) -> bool {
        self.lock().sequential_consistency
    }

    /// Nodes that receive a copy after every write
    pub fn set_write_through(&self, nodes: &[MemoryNode]) {
        let mut state = self.lock();
        state.wt_mask.fill(false);
        for node in nodes {
            if node.index() < state.wt_mask.len() {
                state.wt_mask.set(node.index(), true);
            }
        }
    }

    /// Install reduction operators
    pub fn set_reduction_ops(&self, ops: ReductionOps) {
        self.lock().reduction = Some(ops);
    }

    /// Whether private accumulators are waiting to be committed
    #[must_use]
    pub fn reduction_pending(&self) -> bool {
        self.lock().reduction_refcnt > 0
    }

    /// Per-node access counters
    #[must_use]
    pub fn stats(&self) -> Vec<AccessStats> {
        self.lock().stats.clone()
    }

    /// Record an access by `task` and return the tasks it must follow
    pub fn implicit_dependencies(&self, task: TaskId, mode: AccessMode) -> Vec<TaskId> {
        self.lock().implicit_dependencies(task, mode)
    }
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle").field("id", &self.id).finish()
    }
}
