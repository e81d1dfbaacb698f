//! Deque-model scheduler.
//!
//! Every worker owns a queue with three timing estimates: when it will start
//! its next task, how much predicted work is queued, and when it will drain.
//! A pushed task goes to the eligible worker minimising
//!
//! ```text
//! alpha * (exp_end - best_exp_end) + beta * penalty + gamma * power
//! ```
//!
//! plus an idle-power term when the placement extends the makespan. While
//! some eligible worker has no calibrated model for the task, placement
//! spreads tasks over the uncalibrated workers instead so that every
//! architecture gets measured.

use crate::error::{SchedError, SchedResult};
use crate::policy::SchedPolicy;
use crate::registry::{WorkerRegistry, WorkerSlot};
use crate::task::SchedTask;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{AccessMode, Arch, Clock, ContextId, HandleId, MemoryNode, WorkerId};
use tessera_data::DataManager;
use tessera_perf::{PerfRegistry, Prediction};

/// What the scheduler needs to know about data placement
pub trait DataOracle: Send + Sync {
    /// Predicted time to bring every read input to `node`
    fn expected_penalty(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> f64;

    /// Read inputs neither valid nor in transfer on `node`
    fn count_non_ready(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> usize;

    /// Start moving `handle` to `node` in the background
    fn prefetch(&self, handle: HandleId, node: MemoryNode);
}

impl DataOracle for DataManager {
    fn expected_penalty(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> f64 {
        DataManager::expected_penalty(self, node, buffers)
    }

    fn count_non_ready(&self, node: MemoryNode, buffers: &[(HandleId, AccessMode)]) -> usize {
        DataManager::count_non_ready(self, node, buffers)
    }

    fn prefetch(&self, handle: HandleId, node: MemoryNode) {
        if let Err(e) = DataManager::prefetch(self, handle, node) {
            tracing::debug!(%handle, %node, error = %e, "prefetch not issued");
        }
    }
}

/// Coefficients of the fitness function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedWeights {
    /// Weight of the completion time
    pub alpha: f64,
    /// Weight of the transfer penalty
    pub beta: f64,
    /// Weight of the predicted power
    pub gamma: f64,
    /// Power drawn by idle workers, charged when the makespan grows
    pub idle_power: f64,
}

impl Default for SchedWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 1000.0,
            idle_power: 0.0,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Placement and dequeue strategy
    pub policy: SchedPolicy,
    /// Fitness coefficients
    pub weights: SchedWeights,
    /// Prefetch read inputs to the chosen worker's node at push time
    pub prefetch: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::default(),
            weights: SchedWeights::default(),
            prefetch: true,
        }
    }
}

impl SchedConfig {
    /// Set the policy
    #[must_use]
    pub fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the fitness coefficients
    #[must_use]
    pub fn with_weights(mut self, weights: SchedWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Enable or disable prefetching
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// Per-context task counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCounters {
    /// Context
    pub context: ContextId,
    /// Tasks pushed
    pub submitted: u64,
    /// Tasks reported finished
    pub completed: u64,
}

/// Load of one worker at introspection time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    /// Worker
    pub worker: WorkerId,
    /// Architecture
    pub arch: Arch,
    /// Memory node
    pub memory_node: MemoryNode,
    /// Expected start of the next task
    pub exp_start: f64,
    /// Predicted queued work
    pub exp_len: f64,
    /// Expected drain time
    pub exp_end: f64,
    /// Tasks pushed and not yet popped
    pub queued: usize,
    /// Tasks popped so far
    pub processed: u64,
}

/// Snapshot of the scheduler's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedIntrospection {
    /// Clock reading the snapshot was taken at
    pub now: f64,
    /// Active policy
    pub policy: SchedPolicy,
    /// Per-worker load in id order
    pub workers: Vec<WorkerLoad>,
    /// Per-context counters
    pub contexts: Vec<ContextCounters>,
}

struct Placement {
    worker: WorkerId,
    predicted: Option<f64>,
    power: Option<f64>,
    penalty: f64,
}

/// Deque-model scheduler over a fixed set of workers
pub struct DmdaScheduler {
    config: SchedConfig,
    workers: Arc<WorkerRegistry>,
    perf: Arc<PerfRegistry>,
    data: Arc<dyn DataOracle>,
    clock: Arc<dyn Clock>,
    contexts: Mutex<IndexMap<ContextId, ContextCounters>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for DmdaScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmdaScheduler")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl DmdaScheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new(
        config: SchedConfig,
        workers: Arc<WorkerRegistry>,
        perf: Arc<PerfRegistry>,
        data: Arc<dyn DataOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        tracing::info!(
            policy = %config.policy,
            workers = workers.len(),
            prefetch = config.prefetch,
            "scheduler initialised"
        );
        Self {
            config,
            workers,
            perf,
            data,
            clock,
            contexts: Mutex::new(IndexMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Active policy
    #[must_use]
    pub const fn policy(&self) -> SchedPolicy {
        self.config.policy
    }

    /// Workers scheduled over
    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Place a task on a worker queue
    ///
    /// # Errors
    ///
    /// Returns `NoEligibleWorker` when no worker has a matching
    /// architecture, `ShutDown` after [`DmdaScheduler::shutdown`]
    pub fn push(&self, mut task: SchedTask) -> SchedResult<WorkerId> {
        if self.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        let range = self.config.policy.priority_range();
        if !range.contains(task.priority) {
            let clamped = range.clamp(task.priority);
            tracing::warn!(
                task = %task.id,
                priority = task.priority,
                clamped,
                "priority outside the policy's range"
            );
            task.priority = clamped;
        }

        let placement = self.place(&task)?;
        let worker = placement.worker;
        self.enqueue(task, placement);
        Ok(worker)
    }

    fn place(&self, task: &SchedTask) -> SchedResult<Placement> {
        let eligible: Vec<&WorkerSlot> = self
            .workers
            .iter()
            .filter(|s| s.info.can_execute(task.archs))
            .collect();
        if eligible.is_empty() {
            return Err(SchedError::NoEligibleWorker {
                task: task.id,
                required: task.archs,
            });
        }

        let now = self.clock.now_us();
        let accesses = task.accesses();
        let penalty_on = |slot: &WorkerSlot| {
            if self.config.policy.uses_data_penalty() {
                self.data.expected_penalty(slot.info.memory_node, &accesses)
            } else {
                0.0
            }
        };

        let predictions: Vec<Prediction> = eligible
            .iter()
            .map(|s| {
                self.perf
                    .predict(task.kind, s.info.perf_arch, task.footprint, task.size)
            })
            .collect();

        if predictions.iter().any(|p| !p.is_calibrated()) {
            let mut best: Option<(&WorkerSlot, f64)> = None;
            for (slot, prediction) in eligible.iter().copied().zip(&predictions) {
                if prediction.is_calibrated() {
                    continue;
                }
                let load = slot.timing.ntasks() as f64 / slot.info.perf_arch.relative_speedup();
                if best.is_none_or(|(_, l)| load < l) {
                    best = Some((slot, load));
                }
            }
            if let Some((slot, _)) = best {
                return Ok(Placement {
                    worker: slot.info.id,
                    predicted: None,
                    power: None,
                    penalty: penalty_on(slot),
                });
            }
        }

        let max_exp_end = self
            .workers
            .iter()
            .map(|s| s.timing.snapshot(now).exp_end)
            .fold(now, f64::max);

        let candidates: Vec<(&WorkerSlot, f64, f64, f64)> = eligible
            .iter()
            .copied()
            .zip(&predictions)
            .map(|(slot, prediction)| {
                let length = prediction.estimate().unwrap_or(0.0);
                let exp_end = slot.timing.snapshot(now).exp_end + length;
                let power = self
                    .perf
                    .predict_power(task.kind, slot.info.perf_arch, task.footprint)
                    .unwrap_or(0.0);
                (slot, exp_end, penalty_on(slot), power)
            })
            .collect();
        let best_exp_end = candidates
            .iter()
            .map(|(_, end, _, _)| *end)
            .fold(f64::INFINITY, f64::min);

        let weights = &self.config.weights;
        let mut best: Option<(usize, f64)> = None;
        for (i, (_, exp_end, penalty, power)) in candidates.iter().enumerate() {
            let mut fitness = weights.alpha * (exp_end - best_exp_end)
                + weights.beta * penalty
                + weights.gamma * power;
            if *exp_end > max_exp_end {
                // idle_power is in W, times are in us
                fitness += weights.gamma * weights.idle_power * (exp_end - max_exp_end) / 1_000_000.0;
            }
            if best.is_none_or(|(_, f)| fitness < f) {
                best = Some((i, fitness));
            }
        }

        let (index, _) = best.ok_or(SchedError::NoEligibleWorker {
            task: task.id,
            required: task.archs,
        })?;
        let (slot, _, penalty, _) = candidates[index];
        Ok(Placement {
            worker: slot.info.id,
            predicted: predictions[index].estimate(),
            power: self
                .perf
                .predict_power(task.kind, slot.info.perf_arch, task.footprint),
            penalty,
        })
    }

    fn enqueue(&self, mut task: SchedTask, placement: Placement) {
        let slot = self.workers.slot(placement.worker);
        let node = slot.info.memory_node;
        if self.config.prefetch && self.config.policy.uses_data_penalty() {
            for buffer in task.buffers.iter().filter(|b| b.mode.reads()) {
                self.data.prefetch(buffer.handle, node);
            }
        }

        task.predicted = placement.predicted;
        task.predicted_power = placement.power;
        let context = task.context;
        let (id, priority) = (task.id, task.priority);
        {
            let mut queue = slot.queue.lock();
            let now = self.clock.now_us();
            let exp_end = slot.timing.snapshot(now).exp_end;
            // Transfers overlap with the work already queued
            task.predicted_transfer = if now + placement.penalty < exp_end {
                0.0
            } else {
                now + placement.penalty - exp_end
            };
            slot.timing.on_push(now, task.queued_length());
            if self.config.policy.sorted() {
                queue.push_sorted(task);
            } else if priority > 0 {
                queue.push_front(task);
            } else {
                queue.push_back(task);
            }
        }
        slot.cond.notify_one();

        self.contexts
            .lock()
            .entry(context)
            .or_insert_with(|| ContextCounters {
                context,
                ..ContextCounters::default()
            })
            .submitted += 1;
        tracing::debug!(
            task = %id,
            worker = %placement.worker,
            predicted = ?placement.predicted,
            penalty = placement.penalty,
            "task pushed"
        );
    }

    fn take(&self, slot: &WorkerSlot, queue: &mut crate::queue::WorkerQueue) -> Option<SchedTask> {
        let task = if self.config.policy.pops_ready() {
            let node = slot.info.memory_node;
            queue.pop_ready(|t| self.data.count_non_ready(node, &t.accesses()))
        } else {
            queue.pop_front()
        }?;
        let now = self.clock.now_us();
        slot.timing
            .on_pop(now, task.queued_length(), task.predicted.unwrap_or(0.0));
        Some(task)
    }

    fn own_slot(&self, worker: WorkerId) -> &WorkerSlot {
        assert!(
            worker.index() < self.workers.len(),
            "worker {worker} outside a registry of {}",
            self.workers.len()
        );
        self.workers.slot(worker)
    }

    /// Take the next task of `worker`, if any
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not in the registry
    #[must_use]
    pub fn pop(&self, worker: WorkerId) -> Option<SchedTask> {
        let slot = self.own_slot(worker);
        let mut queue = slot.queue.lock();
        self.take(slot, &mut queue)
    }

    /// Take the next task of `worker`, sleeping up to `timeout` for one
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the scheduler is shut down and the queue is
    /// empty
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not in the registry
    pub fn pop_blocking(&self, worker: WorkerId, timeout: Duration) -> SchedResult<Option<SchedTask>> {
        let slot = self.own_slot(worker);
        let deadline = Instant::now() + timeout;
        let mut queue = slot.queue.lock();
        loop {
            if let Some(task) = self.take(slot, &mut queue) {
                return Ok(Some(task));
            }
            if self.is_shut_down() {
                return Err(SchedError::ShutDown);
            }
            if slot.cond.wait_until(&mut queue, deadline).timed_out() {
                return Ok(self.take(slot, &mut queue));
            }
        }
    }

    /// Remove every queued task of `worker` and reset its timing
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not in the registry
    pub fn pop_every(&self, worker: WorkerId) -> Vec<SchedTask> {
        let slot = self.own_slot(worker);
        let mut queue = slot.queue.lock();
        let tasks = queue.pop_every();
        slot.timing.reset(self.clock.now_us());
        tasks
    }

    /// Record that `worker` finished `task`
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not in the registry
    pub fn task_done(&self, worker: WorkerId, task: &SchedTask) {
        let slot = self.own_slot(worker);
        {
            let _queue = slot.queue.lock();
            slot.timing.on_done(self.clock.now_us());
        }
        if let Some(counters) = self.contexts.lock().get_mut(&task.context) {
            counters.completed += 1;
        }
    }

    /// Stop accepting tasks and wake every sleeping worker
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in self.workers.iter() {
            let _queue = slot.queue.lock();
            slot.cond.notify_all();
        }
        tracing::info!("scheduler shut down");
    }

    /// Whether [`DmdaScheduler::shutdown`] was called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Expected drain time of a worker's queue
    ///
    /// # Panics
    ///
    /// Panics if `worker` is not in the registry
    #[must_use]
    pub fn expected_end(&self, worker: WorkerId) -> f64 {
        self.own_slot(worker).timing.snapshot(self.clock.now_us()).exp_end
    }

    /// Tasks queued over every worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|s| s.timing.ntasks()).sum()
    }

    /// Snapshot of every worker's load and every context's counters
    #[must_use]
    pub fn introspect(&self) -> SchedIntrospection {
        let now = self.clock.now_us();
        let workers = self
            .workers
            .iter()
            .map(|slot| {
                let snap = slot.timing.snapshot(now);
                WorkerLoad {
                    worker: slot.info.id,
                    arch: slot.info.arch,
                    memory_node: slot.info.memory_node,
                    exp_start: snap.exp_start,
                    exp_len: snap.exp_len,
                    exp_end: snap.exp_end,
                    queued: snap.ntasks,
                    processed: slot.timing.processed(),
                }
            })
            .collect();
        SchedIntrospection {
            now,
            policy: self.config.policy,
            workers,
            contexts: self.contexts.lock().values().copied().collect(),
        }
    }
}
