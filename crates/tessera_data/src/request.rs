//! Per-node queues of transfer requests.
//!
//! Each destination node owns one [`RequestQueue`]. Requests wait in one of
//! two lanes: blocking fetches are always started before prefetches, and a
//! prefetch that a blocking fetch coalesces onto is promoted. A bounded
//! number of transfers are in flight per node at any time.

use crate::backend::{MemoryBackend, NodeBuffer, TransferStatus, TransferToken};
use crate::error::{DataError, DataResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tessera_core::{AccessMode, HandleId, MemoryNode, RequestId};
use tokio::sync::oneshot;

/// What a fetch completion reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The replica is valid for the requested mode
    Completed,
    /// The handle was invalidated while the transfer was in flight; no pin is held
    Discarded,
}

/// Single-shot delivery of a fetch result
pub enum Completion {
    /// Nobody is waiting
    None,
    /// Invoked from whichever thread completes the transfer
    Callback(Box<dyn FnOnce(DataResult<RequestOutcome>) + Send>),
    /// Sent into a oneshot channel
    Channel(oneshot::Sender<DataResult<RequestOutcome>>),
}

impl Completion {
    /// Wrap a closure
    pub fn callback(f: impl FnOnce(DataResult<RequestOutcome>) + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    /// Create a channel completion and its receiving end
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<DataResult<RequestOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Channel(tx), rx)
    }

    /// Deliver the result, consuming the completion
    pub fn fire(self, result: DataResult<RequestOutcome>) {
        match self {
            Self::None => {}
            Self::Callback(f) => f(result),
            Self::Channel(tx) => {
                // Receiver may have given up
                let _ = tx.send(result);
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "Completion::None"),
            Self::Callback(_) => write!(f, "Completion::Callback"),
            Self::Channel(_) => write!(f, "Completion::Channel"),
        }
    }
}

/// One consumer attached to a request
#[derive(Debug)]
pub(crate) struct Waiter {
    pub mode: AccessMode,
    pub prefetch: bool,
    /// Handle epoch when the consumer asked
    pub epoch: u64,
    pub completion: Completion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Queued,
    InFlight(TransferToken),
    Landed,
    Failed(String),
}

/// An asynchronous transfer of one handle into one node
#[derive(Debug)]
pub(crate) struct DataRequest {
    pub id: RequestId,
    pub handle: HandleId,
    pub src: MemoryNode,
    pub dst: MemoryNode,
    pub src_buffer: NodeBuffer,
    pub dst_buffer: NodeBuffer,
    /// Handle version when the request was created
    pub version: u64,
    pub prefetch: bool,
    pub attempts: u32,
    pub phase: Phase,
    pub waiters: Vec<Waiter>,
}

impl DataRequest {
    /// Mode the landed replica is granted: the merge of every waiter of the current epoch
    pub fn effective_mode(&self, epoch: u64) -> AccessMode {
        self.waiters
            .iter()
            .filter(|w| w.epoch == epoch)
            .map(|w| w.mode)
            .reduce(AccessMode::merge)
            .unwrap_or(AccessMode::Read)
    }

    /// Build the error delivered when retries run out
    pub fn failure(&self, reason: &str) -> DataError {
        DataError::TransferFailed {
            handle: self.handle,
            src: self.src,
            dst: self.dst,
            attempts: self.attempts,
            reason: reason.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Landed | Phase::Failed(_))
    }
}

/// Counters for one request queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests created
    pub submitted: u64,
    /// Fetches merged onto an existing request
    pub coalesced: u64,
    /// Transfers that landed
    pub completed: u64,
    /// Transfer attempts that failed
    pub failed_attempts: u64,
    /// Prefetches promoted to the blocking lane
    pub promoted: u64,
}

/// Transfer requests targeting one memory node
#[derive(Debug)]
pub(crate) struct RequestQueue {
    node: MemoryNode,
    requests: IndexMap<RequestId, DataRequest>,
    blocking: VecDeque<RequestId>,
    prefetch: VecDeque<RequestId>,
    in_flight: usize,
    max_in_flight: usize,
    max_attempts: u32,
    stats: QueueStats,
}

impl RequestQueue {
    pub fn new(node: MemoryNode, max_in_flight: usize, max_attempts: u32) -> Self {
        Self {
            node,
            requests: IndexMap::new(),
            blocking: VecDeque::new(),
            prefetch: VecDeque::new(),
            in_flight: 0,
            max_in_flight: max_in_flight.max(1),
            max_attempts: max_attempts.max(1),
            stats: QueueStats::default(),
        }
    }

    pub fn submit(&mut self, request: DataRequest) {
        debug_assert_eq!(request.dst, self.node);
        if request.prefetch {
            self.prefetch.push_back(request.id);
        } else {
            self.blocking.push_back(request.id);
        }
        self.stats.submitted += 1;
        self.requests.insert(request.id, request);
    }

    /// Coalesce a consumer onto a request still held by the queue
    ///
    /// Returns the waiter back if the request is gone.
    pub fn attach(&mut self, id: RequestId, waiter: Waiter) -> Result<(), Waiter> {
        let Some(request) = self.requests.get_mut(&id) else {
            return Err(waiter);
        };
        if request.prefetch && !waiter.prefetch {
            request.prefetch = false;
            if let Some(pos) = self.prefetch.iter().position(|r| *r == id) {
                self.prefetch.remove(pos);
                self.blocking.push_back(id);
                self.stats.promoted += 1;
            }
        }
        request.waiters.push(waiter);
        self.stats.coalesced += 1;
        Ok(())
    }

    /// Poll in-flight transfers and start queued ones
    ///
    /// Returns the requests that reached a terminal phase; they stay in the
    /// queue until [`RequestQueue::take`].
    pub fn pump(&mut self, backend: &dyn MemoryBackend) -> Vec<RequestId> {
        let mut finished = Vec::new();

        let in_flight: Vec<(RequestId, TransferToken)> = self
            .requests
            .values()
            .filter_map(|r| match r.phase {
                Phase::InFlight(token) => Some((r.id, token)),
                _ => None,
            })
            .collect();
        for (id, token) in in_flight {
            match backend.test(token) {
                TransferStatus::Pending => {}
                TransferStatus::Done => {
                    self.in_flight -= 1;
                    if let Some(r) = self.requests.get_mut(&id) {
                        r.phase = Phase::Landed;
                    }
                    finished.push(id);
                }
                TransferStatus::Failed(reason) => {
                    self.in_flight -= 1;
                    if self.record_failure(id, reason) {
                        finished.push(id);
                    }
                }
            }
        }

        while self.in_flight < self.max_in_flight {
            let Some(id) = self.blocking.pop_front().or_else(|| self.prefetch.pop_front()) else {
                break;
            };
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            match backend.copy_async(&request.src_buffer, &request.dst_buffer) {
                Ok(token) => {
                    tracing::trace!(request = %id, handle = %request.handle, src = %request.src, dst = %request.dst, "transfer started");
                    request.phase = Phase::InFlight(token);
                    self.in_flight += 1;
                }
                Err(e) => {
                    if self.record_failure(id, e.to_string()) {
                        finished.push(id);
                    }
                }
            }
        }

        finished
    }

    /// Count a failed attempt; true once the request has given up
    fn record_failure(&mut self, id: RequestId, reason: String) -> bool {
        self.stats.failed_attempts += 1;
        let Some(request) = self.requests.get_mut(&id) else {
            return false;
        };
        request.attempts += 1;
        if request.attempts >= self.max_attempts {
            request.phase = Phase::Failed(reason);
            return true;
        }
        tracing::warn!(
            request = %id,
            handle = %request.handle,
            attempts = request.attempts,
            %reason,
            "transfer failed, retrying"
        );
        request.phase = Phase::Queued;
        request.prefetch = false;
        self.blocking.push_front(id);
        false
    }

    /// Remove a request that reached a terminal phase
    pub fn take(&mut self, id: RequestId) -> Option<DataRequest> {
        if !self.requests.get(&id).is_some_and(DataRequest::is_terminal) {
            return None;
        }
        let request = self.requests.shift_remove(&id)?;
        if request.phase == Phase::Landed {
            self.stats.completed += 1;
        }
        Some(request)
    }

    /// Handle a queued request belongs to
    pub fn handle_of(&self, id: RequestId) -> Option<HandleId> {
        self.requests.get(&id).map(|r| r.handle)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    #[cfg(test)]
    fn lane_order(&self) -> (Vec<RequestId>, Vec<RequestId>) {
        (
            self.blocking.iter().copied().collect(),
            self.prefetch.iter().copied().collect(),
        )
    }
}
