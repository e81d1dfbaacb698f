//! Data manager: the entry point for every data operation.
//!
//! Lock order is handle, then request queue, then registry. A queue lock is
//! never held while a handle lock is taken, and completions fire only after
//! every lock is released, so a callback may re-enter the manager.

use crate::backend::{MemoryBackend, NodeBuffer};
use crate::coherency;
use crate::error::{DataError, DataResult};
use crate::filter::PartitionFilter;
use crate::footprint::layout_footprint;
use crate::handle::{DataHandle, FrozenFetch, HandleState, ReductionOps};
use crate::registry::HandleRegistry;
use crate::replica::{AccessStats, CacheState};
use crate::request::{
    Completion, DataRequest, Phase, QueueStats, RequestOutcome, RequestQueue, Waiter,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{AccessMode, HandleId, MemoryNode, RequestId, TaskId, WorkerId};
use tessera_perf::BusModel;
use tokio::sync::oneshot;

/// Data manager configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Attempts per transfer before it is reported as failed
    pub max_transfer_retries: u32,
    /// Transfers in flight per destination node
    pub max_in_flight: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_transfer_retries: 3,
            max_in_flight: 8,
        }
    }
}

impl DataConfig {
    /// Set the retry limit
    #[must_use]
    pub fn with_max_transfer_retries(mut self, retries: u32) -> Self {
        self.max_transfer_retries = retries;
        self
    }

    /// Set the per-node in-flight limit
    #[must_use]
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }
}

/// Immediate result of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Replica already valid; the completion has fired
    Ready,
    /// A transfer is filling the replica
    Pending(RequestId),
    /// Held back until the running reduction is committed
    Frozen,
}

/// Replica status as seen by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Node-local storage exists
    pub allocated: bool,
    /// Contents are valid
    pub valid: bool,
    /// A transfer into the replica is in flight
    pub requested: bool,
    /// MSI state
    pub state: CacheState,
    /// Pins held
    pub refcnt: u32,
}

/// Aggregate coherency counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiStats {
    /// Live handles
    pub handles: usize,
    /// Per-replica access counters summed over handles and nodes
    pub access: AccessStats,
    /// Request queue counters summed over nodes
    pub queues: QueueStats,
}

/// A fetch whose completion is delivered through a channel
#[derive(Debug)]
pub struct FetchTicket {
    handle: HandleId,
    status: FetchStatus,
    rx: oneshot::Receiver<DataResult<RequestOutcome>>,
}

impl FetchTicket {
    /// Handle being fetched
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        self.handle
    }

    /// Status returned when the fetch was issued
    #[must_use]
    pub const fn status(&self) -> FetchStatus {
        self.status
    }

    /// The result, if it has been delivered
    pub fn try_result(&mut self) -> Option<DataResult<RequestOutcome>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(DataError::CompletionDropped(self.handle)))
            }
        }
    }

    /// Drive transfers until the result is delivered
    ///
    /// # Errors
    ///
    /// Returns the transfer error, or `CompletionDropped` if the request
    /// vanished without reporting
    pub fn wait(mut self, manager: &DataManager) -> DataResult<RequestOutcome> {
        loop {
            if let Some(result) = self.try_result() {
                return result;
            }
            if manager.progress_all() == 0 {
                std::thread::yield_now();
            }
        }
    }
}

type FetchError = (DataError, Completion);

/// Owns every data handle and drives their coherency
pub struct DataManager {
    backend: Arc<dyn MemoryBackend>,
    bus: BusModel,
    handles: HandleRegistry,
    queues: Vec<Mutex<RequestQueue>>,
    worker_nodes: Vec<MemoryNode>,
    next_request: AtomicU64,
}

impl DataManager {
    /// Create a manager over `backend`
    ///
    /// `worker_nodes[w]` is the memory node of worker `w`; private replicas
    /// for scratch and reduction accesses live there.
    #[must_use]
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        bus: BusModel,
        worker_nodes: Vec<MemoryNode>,
        config: DataConfig,
    ) -> Self {
        let nnodes = backend.nnodes();
        let queues = (0..nnodes)
            .map(|n| {
                Mutex::new(RequestQueue::new(
                    MemoryNode::from_index(n),
                    config.max_in_flight,
                    config.max_transfer_retries,
                ))
            })
            .collect();
        Self {
            backend,
            bus,
            handles: HandleRegistry::new(),
            queues,
            worker_nodes,
            next_request: AtomicU64::new(0),
        }
    }

    /// Number of memory nodes
    #[must_use]
    pub fn nnodes(&self) -> usize {
        self.queues.len()
    }

    /// Transfer cost model
    #[must_use]
    pub const fn bus(&self) -> &BusModel {
        &self.bus
    }

    /// Handle arena
    #[must_use]
    pub const fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    /// Look up a live handle
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the handle does not exist
    pub fn handle(&self, id: HandleId) -> DataResult<Arc<DataHandle>> {
        self.handles.get(id)
    }

    fn check_node(&self, node: MemoryNode) -> DataResult<()> {
        if node.index() < self.nnodes() {
            Ok(())
        } else {
            Err(DataError::UnknownNode(node))
        }
    }

    fn new_state(&self, id: HandleId, size: usize) -> HandleState {
        HandleState::new(
            id,
            size,
            layout_footprint(size, 0),
            self.nnodes(),
            &self.worker_nodes,
        )
    }

    /// Register application contents living on `home`
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if `home` is outside the machine
    pub fn register(&self, home: MemoryNode, data: Vec<u8>) -> DataResult<HandleId> {
        self.check_node(home)?;
        let size = data.len();
        let handle = self.handles.insert(|id| {
            let mut state = self.new_state(id, size);
            state.home = Some(home);
            let replica = &mut state.per_node[home.index()];
            replica.attach(NodeBuffer::wrap(home, data), false);
            replica.state = CacheState::Owner;
            replica.initialized = true;
            DataHandle::new(id, state)
        });
        tracing::info!(handle = %handle.id(), %home, size, "registered data handle");
        Ok(handle.id())
    }

    /// Register a handle with no contents yet
    ///
    /// Its first access must be write-only.
    #[must_use]
    pub fn register_uninitialized(&self, size: usize) -> HandleId {
        let handle = self
            .handles
            .insert(|id| DataHandle::new(id, self.new_state(id, size)));
        tracing::info!(handle = %handle.id(), size, "registered uninitialized data handle");
        handle.id()
    }

    fn ensure_allocated(&self, state: &mut HandleState, node: MemoryNode) -> DataResult<()> {
        let replica = &mut state.per_node[node.index()];
        if !replica.allocated {
            let buffer = self.backend.allocate(node, state.size)?;
            replica.attach(buffer, true);
        }
        Ok(())
    }

    fn pin(state: &mut HandleState, node: MemoryNode) {
        state.per_node[node.index()].refcnt += 1;
        state.refcnt += 1;
    }

    fn unpin(state: &mut HandleState, node: MemoryNode) {
        let replica = &mut state.per_node[node.index()];
        replica.refcnt = replica.refcnt.saturating_sub(1);
        state.refcnt = state.refcnt.saturating_sub(1);
    }

    /// Wake drain waiters; true when a lazy unregistration is now due
    fn note_unpinned(handle: &DataHandle, state: &HandleState) -> bool {
        if state.refcnt > 0 {
            return false;
        }
        handle.drained.notify_all();
        state.lazy_unregister && !state.unregistered
    }

    /// Bring the replica of `handle` on `node` up to date for `mode`
    ///
    /// `completion` fires exactly once when the replica is usable, or with
    /// `Discarded` if the handle is invalidated first. Unless `prefetch` is
    /// set the replica is pinned until [`DataManager::release`].
    ///
    /// # Errors
    ///
    /// Returns `ConsistencyViolation` when no copy exists anywhere; the
    /// completion is dropped without firing
    pub fn fetch(
        &self,
        handle: HandleId,
        node: MemoryNode,
        mode: AccessMode,
        prefetch: bool,
        completion: Completion,
    ) -> DataResult<FetchStatus> {
        let h = self.handles.get(handle)?;
        self.fetch_on(&h, node, mode, prefetch, completion, false)
            .map_err(|(e, _)| e)
    }

    fn fetch_on(
        &self,
        h: &Arc<DataHandle>,
        node: MemoryNode,
        mode: AccessMode,
        prefetch: bool,
        mut completion: Completion,
        bypass_freeze: bool,
    ) -> Result<FetchStatus, FetchError> {
        let id = h.id();
        if let Err(e) = self.check_node(node) {
            return Err((e, completion));
        }
        if mode.is_relaxed() {
            let e = DataError::InvalidState {
                handle: id,
                reason: format!("{mode} accesses use private replicas"),
            };
            return Err((e, completion));
        }

        let mut guard = h.lock();
        let state = &mut *guard;
        if state.unregistered {
            return Err((DataError::UnknownHandle(id), completion));
        }
        if state.is_partitioned() {
            return Err((DataError::Partitioned(id), completion));
        }
        if state.reduction_refcnt > 0 && !bypass_freeze {
            tracing::debug!(handle = %id, %node, %mode, "fetch frozen behind reduction");
            state.frozen.push(FrozenFetch {
                node,
                mode,
                prefetch,
                completion,
            });
            return Ok(FetchStatus::Frozen);
        }

        let n = node.index();
        let epoch = state.epoch;

        if let Some(request) = state.per_node[n].pending {
            let waiter = Waiter {
                mode,
                prefetch,
                epoch,
                completion,
            };
            match self.queues[n].lock().attach(request, waiter) {
                Ok(()) => {
                    if !prefetch {
                        Self::pin(state, node);
                    }
                    tracing::debug!(handle = %id, %node, %mode, %request, "fetch coalesced");
                    return Ok(FetchStatus::Pending(request));
                }
                Err(waiter) => {
                    state.per_node[n].pending = None;
                    completion = waiter.completion;
                }
            }
        }

        if mode.reads() && !coherency::has_valid_copy(&state.per_node) {
            match state
                .home
                .filter(|home| state.per_node[home.index()].allocated)
            {
                Some(home) => {
                    tracing::warn!(handle = %id, %home, "no valid copy, reading home storage");
                    state.per_node[home.index()].state = CacheState::Owner;
                }
                None => {
                    tracing::error!(handle = %id, %node, "fetch with no valid copy and no home");
                    return Err((DataError::ConsistencyViolation { handle: id, node }, completion));
                }
            }
        }

        let dst_valid = state.per_node[n].state.is_valid();
        if !mode.reads() || dst_valid {
            if let Err(e) = self.ensure_allocated(state, node) {
                return Err((e, completion));
            }
            if dst_valid {
                state.stats[n].direct_access += 1;
            }
            if mode.writes() {
                if state.per_node[n].state == CacheState::Shared {
                    state.stats[n].shared_to_owner += 1;
                }
                coherency::grant_write(&mut state.per_node, &mut state.stats, node);
                state.version += 1;
            }
            if !prefetch {
                Self::pin(state, node);
            }
            drop(guard);
            tracing::trace!(handle = %id, %node, %mode, "replica ready");
            completion.fire(Ok(RequestOutcome::Completed));
            return Ok(FetchStatus::Ready);
        }

        let Some(src) = coherency::select_source(&state.per_node, node, state.size, &self.bus)
        else {
            return Err((DataError::ConsistencyViolation { handle: id, node }, completion));
        };
        if let Err(e) = self.ensure_allocated(state, node) {
            return Err((e, completion));
        }
        let (Some(src_buffer), Some(dst_buffer)) = (
            state.per_node[src.index()].buffer.clone(),
            state.per_node[n].buffer.clone(),
        ) else {
            let e = DataError::InvalidState {
                handle: id,
                reason: "replica marked allocated without storage".to_string(),
            };
            return Err((e, completion));
        };

        let request = RequestId::from_raw(self.next_request.fetch_add(1, Ordering::Relaxed));
        state.per_node[src.index()].refcnt += 1;
        state.per_node[n].requested.set(src.index(), true);
        state.per_node[n].pending = Some(request);
        state.refcnt += 1;
        if !prefetch {
            Self::pin(state, node);
        }

        self.queues[n].lock().submit(DataRequest {
            id: request,
            handle: id,
            src,
            dst: node,
            src_buffer,
            dst_buffer,
            version: state.version,
            prefetch,
            attempts: 0,
            phase: Phase::Queued,
            waiters: vec![Waiter {
                mode,
                prefetch,
                epoch,
                completion,
            }],
        });
        tracing::debug!(handle = %id, %src, dst = %node, %mode, prefetch, %request, "transfer requested");
        Ok(FetchStatus::Pending(request))
    }

    /// Fetch with a channel completion
    ///
    /// # Errors
    ///
    /// Same as [`DataManager::fetch`]
    pub fn fetch_async(
        &self,
        handle: HandleId,
        node: MemoryNode,
        mode: AccessMode,
        prefetch: bool,
    ) -> DataResult<FetchTicket> {
        let (completion, rx) = Completion::channel();
        let status = self.fetch(handle, node, mode, prefetch, completion)?;
        Ok(FetchTicket { handle, status, rx })
    }

    fn fetch_blocking(
        &self,
        h: &Arc<DataHandle>,
        node: MemoryNode,
        mode: AccessMode,
        bypass_freeze: bool,
    ) -> DataResult<()> {
        loop {
            let (completion, rx) = Completion::channel();
            let status = self
                .fetch_on(h, node, mode, false, completion, bypass_freeze)
                .map_err(|(e, _)| e)?;
            let ticket = FetchTicket {
                handle: h.id(),
                status,
                rx,
            };
            match ticket.wait(self)? {
                RequestOutcome::Completed => return Ok(()),
                RequestOutcome::Discarded => {
                    tracing::debug!(handle = %h.id(), %node, "fetch discarded, retrying");
                }
            }
        }
    }

    /// Synchronously make `node` hold a usable replica and pin it
    ///
    /// Acquiring a handle the caller already holds in an incompatible mode
    /// is a contract violation and may never return.
    ///
    /// # Errors
    ///
    /// Returns the fetch or transfer error
    pub fn acquire(&self, handle: HandleId, node: MemoryNode, mode: AccessMode) -> DataResult<NodeBuffer> {
        let h = self.handles.get(handle)?;
        self.fetch_blocking(&h, node, mode, false)?;
        self.buffer(handle, node)
    }

    /// Drop the pin taken by a non-prefetch fetch
    ///
    /// After a writing access, every node in the write-through mask
    /// receives a copy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the replica is not pinned
    pub fn release(&self, handle: HandleId, node: MemoryNode, mode: AccessMode) -> DataResult<()> {
        self.check_node(node)?;
        let h = self.handles.get(handle)?;
        let mut write_through = Vec::new();
        let destroy = {
            let mut guard = h.lock();
            let state = &mut *guard;
            if state.per_node[node.index()].refcnt == 0 {
                return Err(DataError::InvalidState {
                    handle,
                    reason: format!("release on {node} without a pinned replica"),
                });
            }
            Self::unpin(state, node);
            if mode.writes() {
                write_through.extend(
                    state
                        .wt_mask
                        .iter_ones()
                        .filter(|n| *n != node.index())
                        .map(MemoryNode::from_index),
                );
            }
            Self::note_unpinned(&h, state)
        };

        for dst in write_through {
            if let Err((e, _)) = self.fetch_on(&h, dst, AccessMode::Read, true, Completion::None, false) {
                tracing::warn!(%handle, %dst, error = %e, "write-through fetch failed");
            }
        }
        if destroy {
            self.destroy(&h);
        }
        Ok(())
    }

    /// Issue a background read fetch without pinning
    ///
    /// # Errors
    ///
    /// Same as [`DataManager::fetch`]
    pub fn prefetch(&self, handle: HandleId, node: MemoryNode) -> DataResult<FetchStatus> {
        self.fetch(handle, node, AccessMode::Read, true, Completion::None)
    }

    /// Advance the transfers targeting `node`
    ///
    /// Returns the number of requests that finished.
    pub fn progress(&self, node: MemoryNode) -> usize {
        let Some(queue) = self.queues.get(node.index()) else {
            return 0;
        };
        let finished = queue.lock().pump(self.backend.as_ref());
        for request in &finished {
            self.finish_request(node, *request);
        }
        finished.len()
    }

    /// Advance transfers on every node
    pub fn progress_all(&self) -> usize {
        (0..self.nnodes())
            .map(|n| self.progress(MemoryNode::from_index(n)))
            .sum()
    }

    fn finish_request(&self, node: MemoryNode, id: RequestId) {
        let Some(handle) = self.queues[node.index()].lock().handle_of(id) else {
            return;
        };
        let h = match self.handles.get(handle) {
            Ok(h) => h,
            Err(_) => {
                if let Some(request) = self.queues[node.index()].lock().take(id) {
                    for waiter in request.waiters {
                        waiter.completion.fire(Ok(RequestOutcome::Discarded));
                    }
                }
                return;
            }
        };

        let mut fire = Vec::new();
        let mut reissue = Vec::new();
        let destroy = {
            let mut guard = h.lock();
            let state = &mut *guard;
            let Some(request) = self.queues[node.index()].lock().take(id) else {
                return;
            };
            let n = node.index();
            let src = request.src.index();
            state.per_node[src].refcnt = state.per_node[src].refcnt.saturating_sub(1);
            state.per_node[n].requested.set(src, false);
            if state.per_node[n].pending == Some(id) {
                state.per_node[n].pending = None;
            }
            state.refcnt = state.refcnt.saturating_sub(1);

            match &request.phase {
                Phase::Landed if request.version == state.version && !state.unregistered => {
                    let mode = request.effective_mode(state.epoch);
                    if mode.writes() {
                        coherency::grant_write(&mut state.per_node, &mut state.stats, node);
                        state.version += 1;
                        state.stats[n].loaded_owner += 1;
                    } else {
                        coherency::grant_read(&mut state.per_node, node);
                        state.stats[n].loaded_shared += 1;
                    }
                    tracing::debug!(%handle, src = %request.src, dst = %node, %mode, "transfer landed");
                    for waiter in request.waiters {
                        if waiter.epoch == state.epoch {
                            fire.push((waiter.completion, Ok(RequestOutcome::Completed)));
                        } else {
                            if !waiter.prefetch {
                                Self::unpin(state, node);
                            }
                            fire.push((waiter.completion, Ok(RequestOutcome::Discarded)));
                        }
                    }
                }
                Phase::Landed => {
                    tracing::debug!(%handle, dst = %node, "discarding stale transfer");
                    for waiter in request.waiters {
                        if !waiter.prefetch {
                            Self::unpin(state, node);
                        }
                        if waiter.epoch == state.epoch && !state.unregistered {
                            reissue.push(waiter);
                        } else {
                            fire.push((waiter.completion, Ok(RequestOutcome::Discarded)));
                        }
                    }
                }
                Phase::Failed(reason) => {
                    let err = request.failure(reason);
                    tracing::error!(%handle, src = %request.src, dst = %node, attempts = request.attempts, %reason, "transfer failed");
                    for waiter in request.waiters {
                        if !waiter.prefetch {
                            Self::unpin(state, node);
                        }
                        fire.push((waiter.completion, Err(err.clone())));
                    }
                }
                Phase::Queued | Phase::InFlight(_) => {
                    debug_assert!(false, "took a request that had not finished");
                }
            }
            Self::note_unpinned(&h, state)
        };

        for (completion, result) in fire {
            completion.fire(result);
        }
        for waiter in reissue {
            if let Err((e, completion)) =
                self.fetch_on(&h, node, waiter.mode, waiter.prefetch, waiter.completion, false)
            {
                completion.fire(Err(e));
            }
        }
        if destroy {
            self.destroy(&h);
        }
    }

    /// Mark every replica stale
    ///
    /// Transfers in flight keep running but their results are discarded
    /// when they land. Unpinned storage the manager allocated is freed.
    ///
    /// # Errors
    ///
    /// Returns `Partitioned` if the handle has children
    pub fn invalidate(&self, handle: HandleId) -> DataResult<()> {
        let h = self.handles.get(handle)?;
        let freed: Vec<NodeBuffer> = {
            let mut guard = h.lock();
            let state = &mut *guard;
            if state.is_partitioned() {
                return Err(DataError::Partitioned(handle));
            }
            state.epoch += 1;
            state.version += 1;
            coherency::invalidate_all(&mut state.per_node, &mut state.stats);
            state
                .per_node
                .iter_mut()
                .filter_map(crate::replica::Replica::take_reclaimable)
                .collect()
        };
        tracing::debug!(%handle, freed = freed.len(), "invalidated data handle");
        for buffer in freed {
            self.backend.free(buffer);
        }
        Ok(())
    }

    fn wait_drained(&self, h: &DataHandle) {
        loop {
            {
                let mut state = h.lock();
                if state.refcnt == 0 {
                    return;
                }
                h.drained.wait_for(&mut state, Duration::from_millis(1));
                if state.refcnt == 0 {
                    return;
                }
            }
            self.progress_all();
        }
    }

    /// Tear the handle down if nothing holds it; true when it is gone
    fn destroy(&self, h: &DataHandle) -> bool {
        let freed: Vec<NodeBuffer> = {
            let mut guard = h.lock();
            let state = &mut *guard;
            if state.unregistered {
                return true;
            }
            if state.refcnt > 0 {
                return false;
            }
            state.unregistered = true;
            state
                .per_node
                .iter_mut()
                .chain(state.per_worker.iter_mut())
                .filter_map(crate::replica::Replica::take_reclaimable)
                .collect()
        };
        for buffer in freed {
            self.backend.free(buffer);
        }
        self.handles.remove(h.id());
        tracing::info!(handle = %h.id(), "unregistered data handle");
        true
    }

    /// Wait for every pin to drain, write a valid copy back home, and remove the handle
    ///
    /// Returns the home contents, if the handle has a home.
    ///
    /// # Errors
    ///
    /// Returns `Partitioned` if the handle has children, or the error of
    /// the write-back transfer
    pub fn unregister(&self, handle: HandleId) -> DataResult<Option<Vec<u8>>> {
        self.unregister_inner(handle, true)
    }

    /// Remove the handle without writing anything back
    ///
    /// # Errors
    ///
    /// Returns `Partitioned` if the handle has children
    pub fn unregister_no_coherency(&self, handle: HandleId) -> DataResult<()> {
        self.unregister_inner(handle, false).map(|_| ())
    }

    fn unregister_inner(&self, handle: HandleId, coherent: bool) -> DataResult<Option<Vec<u8>>> {
        let h = self.handles.get(handle)?;
        if h.lock().is_partitioned() {
            return Err(DataError::Partitioned(handle));
        }

        let home = h.home();
        if coherent {
            if let Some(home) = home {
                if h.reduction_pending() {
                    self.end_reduction(handle, home)?;
                }
                self.wait_drained(&h);
                let needs_write_back = {
                    let state = h.lock();
                    !state.per_node[home.index()].state.is_valid()
                        && coherency::has_valid_copy(&state.per_node)
                };
                if needs_write_back {
                    self.fetch_blocking(&h, home, AccessMode::Read, false)?;
                    self.release(handle, home, AccessMode::Read)?;
                }
            }
        }

        loop {
            self.wait_drained(&h);
            let contents = home.and_then(|home| {
                h.lock().per_node[home.index()]
                    .buffer
                    .as_ref()
                    .map(NodeBuffer::to_vec)
            });
            if self.destroy(&h) {
                return Ok(contents);
            }
        }
    }

    /// Mark the handle for removal once every pin drains
    ///
    /// Nothing is written back.
    ///
    /// # Errors
    ///
    /// Returns `Partitioned` if the handle has children
    pub fn unregister_lazy(&self, handle: HandleId) -> DataResult<()> {
        let h = self.handles.get(handle)?;
        let now = {
            let mut state = h.lock();
            if state.is_partitioned() {
                return Err(DataError::Partitioned(handle));
            }
            state.lazy_unregister = true;
            state.refcnt == 0
        };
        if now {
            self.destroy(&h);
        } else {
            tracing::debug!(%handle, "unregistration deferred until pins drain");
        }
        Ok(())
    }

    /// Split a handle into children viewing contiguous parts of it
    ///
    /// The parent is allocated on every node so each child replica is a
    /// view into its parent's storage. The parent cannot be fetched until
    /// [`DataManager::unpartition`].
    ///
    /// # Errors
    ///
    /// Returns `Partitioned` if already split, or an allocation error
    pub fn partition(&self, handle: HandleId, filter: &dyn PartitionFilter) -> DataResult<Vec<HandleId>> {
        let h = self.handles.get(handle)?;
        self.wait_drained(&h);

        let mut guard = h.lock();
        let state = &mut *guard;
        if state.is_partitioned() {
            return Err(DataError::Partitioned(handle));
        }
        if state.reduction_refcnt > 0 {
            return Err(DataError::InvalidState {
                handle,
                reason: "cannot partition during a reduction".to_string(),
            });
        }
        let nchildren = filter.nchildren(state.size);
        if nchildren == 0 {
            return Err(DataError::InvalidState {
                handle,
                reason: "filter produced no children".to_string(),
            });
        }

        for n in 0..self.nnodes() {
            self.ensure_allocated(state, MemoryNode::from_index(n))?;
        }

        let depth = state.depth + 1;
        let mut children = Vec::with_capacity(nchildren);
        for index in 0..nchildren {
            let (offset, len) = filter.child_extent(state.size, index);
            let child = self.handles.insert(|cid| {
                let mut cs = HandleState::new(
                    cid,
                    len,
                    layout_footprint(len, depth),
                    self.nnodes(),
                    &self.worker_nodes,
                );
                cs.parent = Some(handle);
                cs.root = state.root;
                cs.sibling_index = index;
                cs.depth = depth;
                cs.home = state.home;
                cs.wt_mask = state.wt_mask.clone();
                cs.sequential_consistency = state.sequential_consistency;
                cs.reduction = state.reduction.clone();
                for (replica, parent) in cs.per_node.iter_mut().zip(&state.per_node) {
                    if let Some(buffer) = &parent.buffer {
                        replica.attach(buffer.view(offset, len), false);
                    }
                    replica.state = parent.state;
                    replica.initialized = parent.initialized;
                }
                DataHandle::new(cid, cs)
            });
            children.push(child.id());
        }
        state.children.clone_from(&children);
        tracing::debug!(%handle, nchildren, "partitioned data handle");
        Ok(children)
    }

    /// Gather every child onto `node` and merge them back into the parent
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the handle is not partitioned, or the
    /// error of a gathering fetch
    pub fn unpartition(&self, handle: HandleId, node: MemoryNode) -> DataResult<()> {
        self.check_node(node)?;
        let h = self.handles.get(handle)?;
        let children = h.children();
        if children.is_empty() {
            return Err(DataError::InvalidState {
                handle,
                reason: "not partitioned".to_string(),
            });
        }

        let mut child_states = Vec::with_capacity(children.len());
        let mut child_handles = Vec::with_capacity(children.len());
        for child in &children {
            let ch = self.handles.get(*child)?;
            if ch.reduction_pending() {
                self.end_reduction(*child, node)?;
            }
            self.wait_drained(&ch);
            self.fetch_blocking(&ch, node, AccessMode::Read, false)?;
            self.release(*child, node, AccessMode::Read)?;
            self.wait_drained(&ch);
            child_states.push(ch.replicas().iter().map(|r| r.state()).collect::<Vec<_>>());
            child_handles.push(ch);
        }

        {
            let mut state = h.lock();
            coherency::gather(&mut state.per_node, &child_states);
            state.children.clear();
            state.version += 1;
        }
        for ch in child_handles {
            ch.lock().unregistered = true;
            self.handles.remove(ch.id());
        }
        tracing::debug!(%handle, gathered_on = %node, "unpartitioned data handle");
        Ok(())
    }

    /// Install the identity and combine operators of a handle
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the handle does not exist
    pub fn set_reduction_ops(&self, handle: HandleId, ops: ReductionOps) -> DataResult<()> {
        self.handles.get(handle)?.set_reduction_ops(ops);
        Ok(())
    }

    /// Pin the private replica of `worker` for a scratch or reduction access
    ///
    /// A reduction accumulator is initialised with the identity operator
    /// on first use and counts as an outstanding reduction until
    /// [`DataManager::end_reduction`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for other modes, unknown workers or a
    /// reduction without operators
    pub fn fetch_private(&self, handle: HandleId, worker: WorkerId, mode: AccessMode) -> DataResult<NodeBuffer> {
        let h = self.handles.get(handle)?;
        let invalid = |reason: String| DataError::InvalidState { handle, reason };
        let node = *self
            .worker_nodes
            .get(worker.index())
            .ok_or_else(|| invalid(format!("unknown worker {worker}")))?;
        if !mode.is_relaxed() {
            return Err(invalid(format!("{mode} is not a private access")));
        }

        let mut guard = h.lock();
        let state = &mut *guard;
        if state.unregistered {
            return Err(DataError::UnknownHandle(handle));
        }
        if state.is_partitioned() {
            return Err(DataError::Partitioned(handle));
        }
        let init = match (mode, &state.reduction) {
            (AccessMode::Redux, Some(ops)) => Some(Arc::clone(&ops.init)),
            (AccessMode::Redux, None) => {
                return Err(invalid("reduction without operators".to_string()));
            }
            _ => None,
        };

        let replica = &mut state.per_worker[worker.index()];
        if !replica.allocated {
            let buffer = self.backend.allocate(node, state.size)?;
            replica.attach(buffer, true);
        }
        replica.relaxed = true;
        if let Some(init) = init {
            if !replica.initialized {
                if let Some(buffer) = &replica.buffer {
                    buffer.with_mut(|b| init(b));
                }
                replica.initialized = true;
                replica.state = CacheState::Owner;
                state.reduction_refcnt += 1;
            }
        }
        replica.refcnt += 1;
        let buffer = replica.buffer.clone();
        state.refcnt += 1;
        buffer.ok_or_else(|| invalid("private replica without storage".to_string()))
    }

    /// Drop the pin taken by [`DataManager::fetch_private`]
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the private replica is not pinned
    pub fn release_private(&self, handle: HandleId, worker: WorkerId) -> DataResult<()> {
        let h = self.handles.get(handle)?;
        let destroy = {
            let mut guard = h.lock();
            let state = &mut *guard;
            let Some(replica) = state.per_worker.get_mut(worker.index()) else {
                return Err(DataError::InvalidState {
                    handle,
                    reason: format!("unknown worker {worker}"),
                });
            };
            if replica.refcnt == 0 {
                return Err(DataError::InvalidState {
                    handle,
                    reason: format!("private replica of {worker} is not pinned"),
                });
            }
            replica.refcnt -= 1;
            state.refcnt = state.refcnt.saturating_sub(1);
            Self::note_unpinned(&h, state)
        };
        if destroy {
            self.destroy(&h);
        }
        Ok(())
    }

    /// Fold every private accumulator into the replica on `node`
    ///
    /// Waits for accumulators still pinned, then resets the reduction and
    /// reissues the fetches frozen behind it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without operators, or the error of bringing
    /// the target replica up to date
    pub fn end_reduction(&self, handle: HandleId, node: MemoryNode) -> DataResult<()> {
        self.check_node(node)?;
        let h = self.handles.get(handle)?;

        let ops = loop {
            {
                let mut state = h.lock();
                if state.reduction_refcnt == 0 {
                    return Ok(());
                }
                if state.per_worker.iter().all(|r| r.refcnt == 0) {
                    break state.reduction.clone().ok_or(DataError::InvalidState {
                        handle,
                        reason: "reduction without operators".to_string(),
                    })?;
                }
                h.drained.wait_for(&mut state, Duration::from_millis(1));
            }
            self.progress_all();
        };

        let has_copy = coherency::has_valid_copy(&h.lock().per_node);
        if has_copy {
            self.fetch_blocking(&h, node, AccessMode::ReadWrite, true)?;
        } else {
            let mut guard = h.lock();
            let state = &mut *guard;
            self.ensure_allocated(state, node)?;
            if let Some(buffer) = &state.per_node[node.index()].buffer {
                buffer.with_mut(|b| (ops.init)(b));
            }
            coherency::grant_write(&mut state.per_node, &mut state.stats, node);
            state.version += 1;
            Self::pin(state, node);
        }

        let (frozen, destroy, folded) = {
            let mut guard = h.lock();
            let state = &mut *guard;
            let target = state.per_node[node.index()].buffer.clone();
            let mut folded = 0;
            for replica in &mut state.per_worker {
                if !replica.initialized {
                    continue;
                }
                if let (Some(target), Some(acc)) = (&target, &replica.buffer) {
                    let bytes = acc.to_vec();
                    target.with_mut(|t| (ops.redux)(t, &bytes));
                    folded += 1;
                }
                replica.initialized = false;
                replica.state = CacheState::Invalid;
            }
            state.reduction_refcnt = 0;
            Self::unpin(state, node);
            let frozen = std::mem::take(&mut state.frozen);
            (frozen, Self::note_unpinned(&h, state), folded)
        };
        tracing::debug!(%handle, %node, folded, reissued = frozen.len(), "reduction committed");

        for f in frozen {
            if let Err((e, completion)) = self.fetch_on(&h, f.node, f.mode, f.prefetch, f.completion, false) {
                completion.fire(Err(e));
            }
        }
        if destroy {
            self.destroy(&h);
        }
        Ok(())
    }

    /// Predicted cost of bringing every input of a task to `node`
    ///
    /// Replicas already valid or already being filled cost nothing; so do
    /// write-only accesses.
    #[must_use]
    pub fn expected_penalty(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> f64 {
        buffers
            .iter()
            .filter(|(_, mode)| mode.reads())
            .filter_map(|(handle, _)| self.handles.get(*handle).ok())
            .map(|h| {
                let state = h.lock();
                coherency::transfer_cost(&state.per_node, node, state.size, &self.bus)
            })
            .sum()
    }

    /// Inputs of a task that are neither valid nor being filled on `node`
    #[must_use]
    pub fn count_non_ready(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> usize {
        buffers
            .iter()
            .filter(|(_, mode)| mode.reads())
            .filter_map(|(handle, _)| self.handles.get(*handle).ok())
            .filter(|h| {
                let state = h.lock();
                state
                    .replica(node)
                    .is_some_and(|r| !r.is_valid() && !r.is_requested())
            })
            .count()
    }

    /// Status of the replica of `handle` on `node`
    ///
    /// # Errors
    ///
    /// Returns error for unknown handles or nodes
    pub fn query_status(&self, handle: HandleId, node: MemoryNode) -> DataResult<ReplicaStatus> {
        self.check_node(node)?;
        let h = self.handles.get(handle)?;
        let state = h.lock();
        let replica = &state.per_node[node.index()];
        Ok(ReplicaStatus {
            allocated: replica.is_allocated(),
            valid: replica.is_valid(),
            requested: replica.is_requested(),
            state: replica.state(),
            refcnt: replica.refcnt(),
        })
    }

    /// MSI state of the replica of `handle` on `node`
    ///
    /// # Errors
    ///
    /// Returns error for unknown handles or nodes
    pub fn state_on(&self, handle: HandleId, node: MemoryNode) -> DataResult<CacheState> {
        self.query_status(handle, node).map(|s| s.state)
    }

    /// Whether `node` holds a valid copy of `handle`
    ///
    /// # Errors
    ///
    /// Returns error for unknown handles or nodes
    pub fn is_valid_on(&self, handle: HandleId, node: MemoryNode) -> DataResult<bool> {
        self.query_status(handle, node).map(|s| s.valid)
    }

    /// Pins plus in-flight requests of `handle`
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the handle does not exist
    pub fn refcount(&self, handle: HandleId) -> DataResult<u32> {
        Ok(self.handles.get(handle)?.refcount())
    }

    /// Storage of the replica of `handle` on `node`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the replica is not allocated
    pub fn buffer(&self, handle: HandleId, node: MemoryNode) -> DataResult<NodeBuffer> {
        self.check_node(node)?;
        let h = self.handles.get(handle)?;
        let state = h.lock();
        state.per_node[node.index()]
            .buffer
            .clone()
            .ok_or_else(|| DataError::InvalidState {
                handle,
                reason: format!("no storage on {node}"),
            })
    }

    /// Record an access in the handle's implicit ordering
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` if the handle does not exist
    pub fn implicit_dependencies(
        &self,
        handle: HandleId,
        task: TaskId,
        mode: AccessMode,
    ) -> DataResult<Vec<TaskId>> {
        Ok(self.handles.get(handle)?.implicit_dependencies(task, mode))
    }

    /// Requests not yet finished on `node`
    #[must_use]
    pub fn pending_requests(&self, node: MemoryNode) -> usize {
        self.queues.get(node.index()).map_or(0, |q| q.lock().len())
    }

    /// Transfers in flight on `node`
    #[must_use]
    pub fn transfers_in_flight(&self, node: MemoryNode) -> usize {
        self.queues.get(node.index()).map_or(0, |q| q.lock().in_flight())
    }

    /// Request counters of `node`
    #[must_use]
    pub fn queue_stats(&self, node: MemoryNode) -> QueueStats {
        self.queues
            .get(node.index())
            .map(|q| q.lock().stats())
            .unwrap_or_default()
    }

    /// Coherency counters summed over every live handle and node
    #[must_use]
    pub fn msi_stats(&self) -> MsiStats {
        let mut stats = MsiStats::default();
        for h in self.handles.handles() {
            stats.handles += 1;
            for s in h.stats() {
                stats.access.merge(&s);
            }
        }
        for queue in &self.queues {
            let q = queue.lock().stats();
            stats.queues.submitted += q.submitted;
            stats.queues.coalesced += q.coalesced;
            stats.queues.completed += q.completed;
            stats.queues.failed_attempts += q.failed_attempts;
            stats.queues.promoted += q.promoted;
        }
        stats
    }
}
