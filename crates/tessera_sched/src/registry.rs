//! Worker registry.
//!
//! One slot per worker, constructed once and shared: the worker's queue
//! behind its own lock, the condition variable an idle worker sleeps on,
//! and the queue's timing estimates. Timing fields are atomics so the
//! placement search can read every worker without taking their locks;
//! those reads may be stale.

use crate::queue::WorkerQueue;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tessera_core::{Arch, ArchSet, MemoryNode, PerfArch, WorkerId};

/// Static description of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker identifier
    pub id: WorkerId,
    /// Architecture family
    pub arch: Arch,
    /// Key for performance histories
    pub perf_arch: PerfArch,
    /// Memory node the worker computes from
    pub memory_node: MemoryNode,
    /// Logical CPU the worker thread is bound to
    pub bind_id: Option<usize>,
}

impl WorkerInfo {
    /// A CPU worker computing from host memory
    #[must_use]
    pub fn cpu(id: WorkerId) -> Self {
        Self {
            id,
            arch: Arch::Cpu,
            perf_arch: PerfArch::cpu(),
            memory_node: MemoryNode::HOST,
            bind_id: None,
        }
    }

    /// An accelerator worker with its own memory node
    #[must_use]
    pub fn accelerator(id: WorkerId, arch: Arch, device: u32, memory_node: MemoryNode) -> Self {
        Self {
            id,
            arch,
            perf_arch: PerfArch::new(arch, device),
            memory_node,
            bind_id: None,
        }
    }

    /// Set the logical CPU binding
    #[must_use]
    pub fn with_bind_id(mut self, bind_id: usize) -> Self {
        self.bind_id = Some(bind_id);
        self
    }

    /// Whether the worker can run a task with these implementations
    #[must_use]
    pub const fn can_execute(&self, archs: ArchSet) -> bool {
        archs.contains(self.arch)
    }
}

/// An `f64` stored in an `AtomicU64`
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Expected timing of a worker's queue, in microseconds
#[derive(Debug, Default)]
pub struct QueueTiming {
    exp_start: AtomicF64,
    exp_len: AtomicF64,
    exp_end: AtomicF64,
    ntasks: AtomicUsize,
    processed: AtomicU64,
}

/// Copy of a queue's timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    /// When the queue is expected to start its next task
    pub exp_start: f64,
    /// Predicted work still queued
    pub exp_len: f64,
    /// When the queue is expected to drain
    pub exp_end: f64,
    /// Tasks pushed and not yet popped
    pub ntasks: usize,
}

impl QueueTiming {
    /// Read every field, correcting the start time that fell behind `now`
    #[must_use]
    pub fn snapshot(&self, now: f64) -> TimingSnapshot {
        let exp_start = self.exp_start.load().max(now);
        let exp_len = self.exp_len.load();
        TimingSnapshot {
            exp_start,
            exp_len,
            exp_end: exp_start + exp_len,
            ntasks: self.ntasks.load(Ordering::Relaxed),
        }
    }

    /// Account a task entering the queue
    pub(crate) fn on_push(&self, now: f64, length: f64) {
        let start = self.exp_start.load().max(now);
        let len = self.exp_len.load() + length;
        self.exp_start.store(start);
        self.exp_len.store(len);
        self.exp_end.store(start + len);
        self.ntasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a task leaving the queue to start running
    pub(crate) fn on_pop(&self, now: f64, length: f64, predicted: f64) {
        let len = (self.exp_len.load() - length).max(0.0);
        let start = now + predicted;
        self.exp_len.store(len);
        self.exp_start.store(start);
        self.exp_end.store(start + len);
        let _ = self
            .ntasks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Account the running task finishing at `now`
    pub(crate) fn on_done(&self, now: f64) {
        let len = self.exp_len.load();
        self.exp_start.store(now);
        self.exp_end.store(now + len);
    }

    /// Forget every queued task
    pub(crate) fn reset(&self, now: f64) {
        self.exp_start.store(now);
        self.exp_len.store(0.0);
        self.exp_end.store(now);
        self.ntasks.store(0, Ordering::Relaxed);
    }

    /// Tasks pushed and not yet popped
    #[must_use]
    pub fn ntasks(&self) -> usize {
        self.ntasks.load(Ordering::Relaxed)
    }

    /// Tasks popped so far
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Last recorded drain time, without correction
    #[must_use]
    pub fn recorded_end(&self) -> f64 {
        self.exp_end.load()
    }
}

/// Everything the scheduler keeps per worker
#[derive(Debug)]
pub struct WorkerSlot {
    /// Static description
    pub info: WorkerInfo,
    /// Queued tasks
    pub queue: Mutex<WorkerQueue>,
    /// Signalled on push and shutdown
    pub cond: Condvar,
    /// Timing estimates
    pub timing: QueueTiming,
}

/// Every worker of the machine, indexed by worker id
#[derive(Debug)]
pub struct WorkerRegistry {
    slots: Vec<WorkerSlot>,
}

impl WorkerRegistry {
    /// Build from worker descriptions; ids are reassigned to match positions
    #[must_use]
    pub fn new(infos: Vec<WorkerInfo>) -> Self {
        let slots = infos
            .into_iter()
            .enumerate()
            .map(|(i, mut info)| {
                info.id = WorkerId::from_index(i);
                WorkerSlot {
                    info,
                    queue: Mutex::new(WorkerQueue::new()),
                    cond: Condvar::new(),
                    timing: QueueTiming::default(),
                }
            })
            .collect();
        Self { slots }
    }

    /// Number of workers
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no workers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot of a worker
    ///
    /// # Panics
    ///
    /// Panics if the worker id is out of range
    #[must_use]
    pub fn slot(&self, worker: WorkerId) -> &WorkerSlot {
        &self.slots[worker.index()]
    }

    /// Slot of a worker, if it exists
    #[must_use]
    pub fn get(&self, worker: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(worker.index())
    }

    /// Every slot in id order
    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    /// Every worker description in id order
    #[must_use]
    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.slots.iter().map(|s| s.info).collect()
    }

    /// Memory node of every worker in id order
    #[must_use]
    pub fn memory_nodes(&self) -> Vec<MemoryNode> {
        self.slots.iter().map(|s| s.info.memory_node).collect()
    }

    /// Number of distinct memory nodes the workers use
    #[must_use]
    pub fn nnodes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.info.memory_node.index() + 1)
            .max()
            .unwrap_or(1)
    }

    /// Architectures present on the machine
    #[must_use]
    pub fn archs(&self) -> ArchSet {
        self.slots.iter().map(|s| s.info.arch).collect()
    }
}
