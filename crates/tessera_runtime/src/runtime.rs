//! The runtime: worker threads, task submission and application data access.
//!
//! Every submitted task becomes a record in the task table. Its dependencies
//! come from explicit `after` links and from the sequential-consistency
//! history of each handle it accesses. Once released, compute tasks go to
//! the scheduler; data operations submitted in task order (invalidation,
//! reduction commit) run inline on the releasing thread.
//!
//! Lock order: task table, then data handles. The table lock is never held
//! while pushing to the scheduler or running a data operation.

use crate::codelet::{copy_codelet, Codelet};
use crate::config::RuntimeConfig;
use crate::deps::DependencyTracker;
use crate::error::{RuntimeError, RuntimeResult};
use crate::worker;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tessera_core::{AccessMode, ContextId, HandleId, MemoryNode, MonotonicClock, TaskId, TaskKind, WorkerId};
use tessera_data::footprint::combine;
use tessera_data::{
    DataManager, HostMemory, MemoryBackend, MsiStats, NodeBuffer, PartitionFilter, ReductionOps,
};
use tessera_perf::{BusModel, PerfRegistry};
use tessera_sched::{
    BufferAccess, DataOracle, DmdaScheduler, SchedError, SchedIntrospection, SchedTask,
    WorkerRegistry,
};

const WAIT_POLL: Duration = Duration::from_millis(1);

/// Task argument handed to the kernel
pub type TaskArg = Arc<dyn Any + Send + Sync>;

/// Runs once after a task completes
pub type TaskCallback = Box<dyn FnOnce() + Send>;

enum TaskBody {
    Compute {
        codelet: Arc<Codelet>,
        arg: Option<TaskArg>,
        sched: SchedTask,
        callback: Option<TaskCallback>,
    },
    Invalidate(HandleId),
    CommitReduction(HandleId),
    /// Application access or barrier; completed by the application thread
    Sync,
}

struct TaskRecord {
    body: TaskBody,
    /// Failure of an upstream task
    poisoned: Option<String>,
    /// Counts towards `wait_for_all`
    counted: bool,
}

#[derive(Default)]
struct TaskTable {
    deps: DependencyTracker,
    records: IndexMap<TaskId, TaskRecord>,
    next_id: u64,
    outstanding: usize,
    failures: Vec<(TaskId, String)>,
    kinds: IndexSet<TaskKind>,
}

impl TaskTable {
    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }
}

/// State shared by the application thread and every worker
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) data: Arc<DataManager>,
    pub(crate) perf: Arc<PerfRegistry>,
    pub(crate) sched: Arc<DmdaScheduler>,
    pub(crate) workers: Arc<WorkerRegistry>,
    table: Mutex<TaskTable>,
    progress: Condvar,
    acquisitions: Mutex<IndexMap<HandleId, Vec<(TaskId, AccessMode)>>>,
}

impl Shared {
    /// Codelet and argument of a released compute task
    pub(crate) fn compute_body(&self, task: TaskId) -> Option<(Arc<Codelet>, Option<TaskArg>)> {
        match &self.table.lock().records.get(&task)?.body {
            TaskBody::Compute { codelet, arg, .. } => Some((Arc::clone(codelet), arg.clone())),
            _ => None,
        }
    }

    /// Register a task with its dependencies and release it if it is ready
    fn insert(&self, table: &mut TaskTable, id: TaskId, deps: IndexSet<TaskId>, body: TaskBody, counted: bool) -> RuntimeResult<bool> {
        let ready = table.deps.add_task(id, deps)?;
        table.records.insert(
            id,
            TaskRecord {
                body,
                poisoned: None,
                counted,
            },
        );
        if counted {
            table.outstanding += 1;
        }
        Ok(ready)
    }

    /// Record the end of a task and release whatever it unblocks
    pub(crate) fn complete(&self, task: TaskId, outcome: Result<(), String>) {
        let mut finished = vec![(task, outcome)];
        while let Some((task, outcome)) = finished.pop() {
            let (ready, callback) = {
                let mut table = self.table.lock();
                if let Err(reason) = &outcome {
                    for dependent in table.deps.dependents_of(task) {
                        if let Some(record) = table.records.get_mut(&dependent) {
                            record
                                .poisoned
                                .get_or_insert_with(|| format!("depends on failed {task}: {reason}"));
                        }
                    }
                    table.failures.push((task, reason.clone()));
                }
                let ready = table.deps.mark_complete(task);
                let record = table.records.swap_remove(&task);
                if record.as_ref().is_some_and(|r| r.counted) {
                    table.outstanding = table.outstanding.saturating_sub(1);
                }
                let callback = match record.map(|r| r.body) {
                    Some(TaskBody::Compute { callback, .. }) => callback,
                    _ => None,
                };
                (ready, callback)
            };
            if let Some(callback) = callback {
                callback();
            }
            self.progress.notify_all();
            finished.extend(ready.into_iter().filter_map(|id| self.dispatch(id)));
        }
    }

    /// Act on a released task; returns its outcome if it ran inline
    fn dispatch(&self, id: TaskId) -> Option<(TaskId, Result<(), String>)> {
        enum Action {
            Push(SchedTask),
            Fail(String),
            Invalidate(HandleId),
            Commit(HandleId),
            Wake,
        }
        let action = {
            let table = self.table.lock();
            let record = table.records.get(&id)?;
            match (&record.poisoned, &record.body) {
                (Some(reason), TaskBody::Compute { .. }) => Action::Fail(reason.clone()),
                (_, TaskBody::Compute { sched, .. }) => Action::Push(sched.clone()),
                (_, TaskBody::Invalidate(handle)) => Action::Invalidate(*handle),
                (_, TaskBody::CommitReduction(handle)) => Action::Commit(*handle),
                (_, TaskBody::Sync) => Action::Wake,
            }
        };
        match action {
            Action::Push(task) => match self.sched.push(task) {
                Ok(_) => None,
                Err(e) => Some((id, Err(e.to_string()))),
            },
            Action::Fail(reason) => Some((id, Err(reason))),
            Action::Invalidate(handle) => {
                Some((id, self.data.invalidate(handle).map_err(|e| e.to_string())))
            }
            Action::Commit(handle) => {
                let node = self.data.handle(handle).ok().and_then(|h| h.home()).unwrap_or(MemoryNode::HOST);
                Some((id, self.data.end_reduction(handle, node).map_err(|e| e.to_string())))
            }
            Action::Wake => {
                self.progress.notify_all();
                None
            }
        }
    }

    /// Sequence a data operation after every task accessing `handle` in `mode`
    fn submit_data_op(&self, handle: HandleId, mode: AccessMode, body: TaskBody, counted: bool) -> RuntimeResult<TaskId> {
        let h = self.data.handle(handle)?;
        let (id, ready) = {
            let mut table = self.table.lock();
            let id = table.allocate_id();
            let deps = h.implicit_dependencies(id, mode).into_iter().collect();
            let ready = self.insert(&mut table, id, deps, body, counted)?;
            (id, ready)
        };
        if ready {
            if let Some(done) = self.dispatch(id) {
                self.complete(done.0, done.1);
            }
        }
        Ok(id)
    }

    /// Block until the sync task `id` is released
    fn wait_released(&self, id: TaskId) {
        loop {
            {
                let mut table = self.table.lock();
                if table.deps.is_released(id) {
                    return;
                }
                self.progress.wait_for(&mut table, WAIT_POLL);
            }
            self.data.progress_all();
        }
    }
}

/// A task being assembled
#[must_use = "a task does nothing until submitted"]
pub struct TaskBuilder<'r> {
    runtime: &'r Runtime,
    codelet: Arc<Codelet>,
    handles: Vec<HandleId>,
    priority: i32,
    context: ContextId,
    after: Vec<TaskId>,
    arg: Option<TaskArg>,
    callback: Option<TaskCallback>,
}

impl TaskBuilder<'_> {
    /// Append a buffer; its mode comes from the codelet
    pub fn buffer(mut self, handle: HandleId) -> Self {
        self.handles.push(handle);
        self
    }

    /// Append several buffers
    pub fn buffers(mut self, handles: &[HandleId]) -> Self {
        self.handles.extend_from_slice(handles);
        self
    }

    /// Set the priority; larger is more urgent
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the scheduling context
    pub fn context(mut self, context: ContextId) -> Self {
        self.context = context;
        self
    }

    /// Run only after `task` completed
    pub fn after(mut self, task: TaskId) -> Self {
        self.after.push(task);
        self
    }

    /// Value the kernel reads through [`crate::KernelContext::arg`]
    pub fn arg<T: Any + Send + Sync>(mut self, arg: T) -> Self {
        self.arg = Some(Arc::new(arg));
        self
    }

    /// Run `f` once the task completed
    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Submit the task
    ///
    /// # Errors
    ///
    /// Returns `BufferCount` or `NoImplementation` for malformed tasks,
    /// `NoEligibleWorker` when no worker can run the codelet, and
    /// `UnknownTask` or `UnknownHandle` for dangling references
    pub fn submit(self) -> RuntimeResult<TaskId> {
        self.runtime.submit(self)
    }
}

/// A running TESSERA instance
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    copy: Arc<Codelet>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.workers.len())
            .field("policy", &self.shared.config.policy)
            .finish()
    }
}

impl Runtime {
    /// Start on a simulated machine where every memory node is host RAM
    ///
    /// # Errors
    ///
    /// Returns configuration, model-loading or thread-spawn errors
    pub fn start(config: RuntimeConfig) -> RuntimeResult<Self> {
        let backend = Arc::new(HostMemory::new(config.nnodes()));
        Self::start_with_backend(config, backend)
    }

    /// Start over the given memory backend
    ///
    /// # Errors
    ///
    /// Returns configuration, model-loading or thread-spawn errors
    pub fn start_with_backend(config: RuntimeConfig, backend: Arc<dyn MemoryBackend>) -> RuntimeResult<Self> {
        config.validate()?;
        if backend.nnodes() < config.nnodes() {
            return Err(RuntimeError::config(
                "accelerators",
                format!(
                    "{} memory nodes needed, backend has {}",
                    config.nnodes(),
                    backend.nnodes()
                ),
            ));
        }

        let workers = Arc::new(WorkerRegistry::new(config.worker_infos()));
        let perf = Arc::new(PerfRegistry::new(config.calibrate_min_samples));
        if let Some(dir) = &config.sampling_dir {
            perf.load(dir)?;
        }
        let nnodes = backend.nnodes();
        let data = Arc::new(DataManager::new(
            backend,
            BusModel::pcie(nnodes),
            workers.memory_nodes(),
            config.data_config(),
        ));
        let oracle: Arc<dyn DataOracle> = Arc::clone(&data) as Arc<dyn DataOracle>;
        let sched = Arc::new(DmdaScheduler::new(
            config.sched_config(),
            Arc::clone(&workers),
            Arc::clone(&perf),
            oracle,
            Arc::new(MonotonicClock::new()),
        ));

        let shared = Arc::new(Shared {
            config,
            data,
            perf,
            sched,
            workers,
            table: Mutex::new(TaskTable::default()),
            progress: Condvar::new(),
            acquisitions: Mutex::new(IndexMap::new()),
        });

        let mut runtime = Self {
            shared: Arc::clone(&shared),
            threads: Vec::new(),
            copy: Arc::new(copy_codelet()),
        };
        for info in shared.workers.infos() {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("tessera-worker-{}", info.id.index()))
                .spawn(move || worker::run(&worker_shared, info));
            match spawned {
                Ok(handle) => runtime.threads.push(handle),
                Err(e) => {
                    runtime.stop_workers();
                    return Err(RuntimeError::config("workers", format!("cannot spawn {}: {e}", info.id)));
                }
            }
        }

        tracing::info!(
            workers = shared.workers.len(),
            nodes = nnodes,
            policy = %shared.config.policy,
            "runtime started"
        );
        Ok(runtime)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Data manager
    #[must_use]
    pub fn data(&self) -> &Arc<DataManager> {
        &self.shared.data
    }

    /// Performance models
    #[must_use]
    pub fn perf(&self) -> &Arc<PerfRegistry> {
        &self.shared.perf
    }

    /// Scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Arc<DmdaScheduler> {
        &self.shared.sched
    }

    /// Number of workers
    #[must_use]
    pub fn nworkers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Logical CPU worker `worker` is bound to
    #[must_use]
    pub fn worker_bind_id(&self, worker: WorkerId) -> Option<usize> {
        self.shared.workers.get(worker).and_then(|s| s.info.bind_id)
    }

    /// Register contents living in host memory
    ///
    /// # Errors
    ///
    /// Propagates data-manager errors
    pub fn register(&self, data: Vec<u8>) -> RuntimeResult<HandleId> {
        self.register_on(MemoryNode::HOST, data)
    }

    /// Register contents living on `node`
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` for nodes outside the machine
    pub fn register_on(&self, node: MemoryNode, data: Vec<u8>) -> RuntimeResult<HandleId> {
        Ok(self.shared.data.register(node, data)?)
    }

    /// Register a handle whose first access must be write-only
    #[must_use]
    pub fn register_uninitialized(&self, size: usize) -> HandleId {
        self.shared.data.register_uninitialized(size)
    }

    /// Wait for every task accessing `handle`, then unregister it
    ///
    /// Returns the home contents, if the handle has a home.
    ///
    /// # Errors
    ///
    /// Propagates data-manager errors
    pub fn unregister(&self, handle: HandleId) -> RuntimeResult<Option<Vec<u8>>> {
        self.barrier(handle)?;
        Ok(self.shared.data.unregister(handle)?)
    }

    /// Wait for every task accessing `handle`, then split it
    ///
    /// # Errors
    ///
    /// Propagates data-manager errors
    pub fn partition(&self, handle: HandleId, filter: &dyn PartitionFilter) -> RuntimeResult<Vec<HandleId>> {
        self.barrier(handle)?;
        Ok(self.shared.data.partition(handle, filter)?)
    }

    /// Wait for every task accessing the children of `handle`, then gather them on `node`
    ///
    /// # Errors
    ///
    /// Propagates data-manager errors
    pub fn unpartition(&self, handle: HandleId, node: MemoryNode) -> RuntimeResult<()> {
        for child in self.shared.data.handle(handle)?.children() {
            self.barrier(child)?;
        }
        Ok(self.shared.data.unpartition(handle, node)?)
    }

    /// Start assembling a task running `codelet`
    pub fn task(&self, codelet: &Arc<Codelet>) -> TaskBuilder<'_> {
        TaskBuilder {
            runtime: self,
            codelet: Arc::clone(codelet),
            handles: Vec::new(),
            priority: 0,
            context: ContextId::DEFAULT,
            after: Vec::new(),
            arg: None,
            callback: None,
        }
    }

    fn submit(&self, builder: TaskBuilder<'_>) -> RuntimeResult<TaskId> {
        let shared = &self.shared;
        let codelet = builder.codelet;
        codelet.validate()?;
        if builder.handles.len() != codelet.modes().len() {
            return Err(RuntimeError::BufferCount {
                codelet: codelet.name().to_string(),
                expected: codelet.modes().len(),
                got: builder.handles.len(),
            });
        }
        let handles = builder
            .handles
            .iter()
            .map(|h| shared.data.handle(*h))
            .collect::<Result<Vec<_>, _>>()?;
        let archs = codelet.where_mask();

        let (id, ready) = {
            let mut table = shared.table.lock();
            let id = table.allocate_id();
            if !shared.workers.iter().any(|s| s.info.can_execute(archs)) {
                return Err(SchedError::NoEligibleWorker { task: id, required: archs }.into());
            }
            if let Some(dep) = builder.after.iter().find(|d| **d >= id) {
                return Err(RuntimeError::UnknownTask(*dep));
            }
            if table.kinds.insert(codelet.kind()) {
                codelet.register_model(&shared.perf);
            }

            let accesses: Vec<BufferAccess> = handles
                .iter()
                .zip(codelet.modes())
                .map(|(h, mode)| BufferAccess::new(h.id(), *mode))
                .collect();
            let footprint = combine(&handles.iter().map(|h| h.footprint()).collect::<Vec<_>>());
            let size = handles.iter().map(|h| h.size()).sum();

            let mut deps: IndexSet<TaskId> = builder.after.iter().copied().collect();
            for access in &accesses {
                if let Some(h) = handles.iter().find(|h| h.id() == access.handle) {
                    deps.extend(h.implicit_dependencies(id, access.mode));
                }
            }
            deps.swap_remove(&id);

            let sched = SchedTask::new(id, codelet.kind(), archs, accesses)
                .with_priority(builder.priority)
                .with_layout(footprint, size)
                .with_context(builder.context);
            let body = TaskBody::Compute {
                codelet: Arc::clone(&codelet),
                arg: builder.arg,
                sched,
                callback: builder.callback,
            };
            let ready = shared.insert(&mut table, id, deps, body, true)?;
            (id, ready)
        };
        tracing::debug!(task = %id, codelet = codelet.name(), ready, "task submitted");

        if ready {
            if let Some((task, outcome)) = shared.dispatch(id) {
                shared.complete(task, outcome);
            }
        }
        Ok(id)
    }

    /// Copy the contents of `src` into `dst`, in task order
    ///
    /// # Errors
    ///
    /// Same as [`TaskBuilder::submit`]
    pub fn data_cpy(&self, dst: HandleId, src: HandleId) -> RuntimeResult<TaskId> {
        self.task(&self.copy).buffer(dst).buffer(src).submit()
    }

    /// Block until every earlier task accessing `handle` is done and pin it in host memory
    ///
    /// Later tasks accessing the handle wait for [`Runtime::release`].
    /// Acquiring a handle already held in an incompatible mode deadlocks.
    ///
    /// # Errors
    ///
    /// Propagates fetch errors
    pub fn acquire(&self, handle: HandleId, mode: AccessMode) -> RuntimeResult<NodeBuffer> {
        let shared = &self.shared;
        let id = shared.submit_data_op(handle, mode, TaskBody::Sync, false)?;
        shared.wait_released(id);
        match shared.data.acquire(handle, MemoryNode::HOST, mode) {
            Ok(buffer) => {
                shared.acquisitions.lock().entry(handle).or_default().push((id, mode));
                Ok(buffer)
            }
            Err(e) => {
                shared.complete(id, Ok(()));
                Err(e.into())
            }
        }
    }

    /// Drop the most recent acquisition of `handle`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the handle is not acquired
    pub fn release(&self, handle: HandleId) -> RuntimeResult<()> {
        let shared = &self.shared;
        let (id, mode) = shared
            .acquisitions
            .lock()
            .get_mut(&handle)
            .and_then(Vec::pop)
            .ok_or_else(|| tessera_data::DataError::InvalidState {
                handle,
                reason: "release without acquire".to_string(),
            })?;
        let released = shared.data.release(handle, MemoryNode::HOST, mode);
        shared.complete(id, Ok(()));
        Ok(released?)
    }

    /// Invalidate every replica of `handle` once earlier tasks are done
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` for unknown handles
    pub fn invalidate_submit(&self, handle: HandleId) -> RuntimeResult<TaskId> {
        self.shared
            .submit_data_op(handle, AccessMode::Write, TaskBody::Invalidate(handle), true)
    }

    /// Install the reduction operators; later `Redux` accesses accumulate privately
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` for unknown handles
    pub fn start_reduction(&self, handle: HandleId, ops: ReductionOps) -> RuntimeResult<()> {
        Ok(self.shared.data.set_reduction_ops(handle, ops)?)
    }

    /// Fold the accumulators of `handle` once every contributing task is done
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` for unknown handles
    pub fn end_reduction(&self, handle: HandleId) -> RuntimeResult<TaskId> {
        self.shared.submit_data_op(
            handle,
            AccessMode::ReadWrite,
            TaskBody::CommitReduction(handle),
            true,
        )
    }

    /// Wait for every task accessing `handle` without pinning anything
    fn barrier(&self, handle: HandleId) -> RuntimeResult<()> {
        let shared = &self.shared;
        let id = shared.submit_data_op(handle, AccessMode::ReadWrite, TaskBody::Sync, false)?;
        shared.wait_released(id);
        shared.complete(id, Ok(()));
        Ok(())
    }

    /// Block until every submitted task has completed
    ///
    /// # Errors
    ///
    /// Returns `TaskFailed` for the first task that failed since the last call
    pub fn wait_for_all(&self) -> RuntimeResult<()> {
        let shared = &self.shared;
        loop {
            {
                let mut table = shared.table.lock();
                if table.outstanding == 0 {
                    let failures = std::mem::take(&mut table.failures);
                    return match failures.into_iter().next() {
                        Some((task, reason)) => Err(RuntimeError::TaskFailed { task, reason }),
                        None => Ok(()),
                    };
                }
                shared.progress.wait_for(&mut table, WAIT_POLL);
            }
            shared.data.progress_all();
        }
    }

    /// Scheduler load and context counters
    #[must_use]
    pub fn introspect(&self) -> SchedIntrospection {
        self.shared.sched.introspect()
    }

    /// Coherency counters
    #[must_use]
    pub fn msi_stats(&self) -> MsiStats {
        self.shared.data.msi_stats()
    }

    /// Wait for all tasks, stop the workers and save the performance models
    ///
    /// # Errors
    ///
    /// Returns the first task failure, or the error of saving the models
    pub fn shutdown(mut self) -> RuntimeResult<()> {
        let waited = self.wait_for_all();
        self.stop_workers();
        if let Some(dir) = &self.shared.config.sampling_dir {
            self.shared.perf.save(dir)?;
        }
        tracing::info!("runtime shut down");
        waited
    }

    fn stop_workers(&mut self) {
        self.shared.sched.shutdown();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop_workers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_core::Arch;

    fn runtime(ncpus: usize) -> Runtime {
        Runtime::start(RuntimeConfig::default().with_ncpus(ncpus)).unwrap()
    }

    fn increment() -> Arc<Codelet> {
        Arc::new(Codelet::new("increment", &[AccessMode::ReadWrite]).with_impl(Arch::Cpu, |ctx| {
            ctx.buffer(0).with_mut(|b| b[0] += 1);
        }))
    }

    #[test]
    fn test_tasks_on_one_handle_are_serialised() {
        let rt = runtime(4);
        let h = rt.register(vec![0]).unwrap();
        let codelet = increment();
        for _ in 0..50 {
            rt.task(&codelet).buffer(h).submit().unwrap();
        }
        rt.wait_for_all().unwrap();
        assert_eq!(rt.unregister(h).unwrap(), Some(vec![50]));
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_buffer_count_checked() {
        let rt = runtime(1);
        let h = rt.register(vec![0]).unwrap();
        let err = rt.task(&increment()).buffers(&[h, h]).submit().unwrap_err();
        assert!(matches!(err, RuntimeError::BufferCount { expected: 1, got: 2, .. }));
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_no_eligible_worker_is_reported() {
        let rt = runtime(1);
        let h = rt.register(vec![0]).unwrap();
        let cuda_only = Arc::new(Codelet::new("gpu", &[AccessMode::Read]).with_impl(Arch::Cuda, |_| {}));
        let err = rt.task(&cuda_only).buffer(h).submit().unwrap_err();
        assert!(matches!(err, RuntimeError::Sched(SchedError::NoEligibleWorker { .. })));
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_callbacks_and_explicit_dependencies() {
        let rt = runtime(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let noop = Arc::new(Codelet::new("noop", &[]).with_impl(Arch::Cpu, |_| {}));

        let first = {
            let order = Arc::clone(&order);
            rt.task(&noop).on_complete(move || order.lock().push(1)).submit().unwrap()
        };
        {
            let order = Arc::clone(&order);
            rt.task(&noop)
                .after(first)
                .on_complete(move || order.lock().push(2))
                .submit()
                .unwrap();
        }
        rt.wait_for_all().unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_future_dependency_rejected() {
        let rt = runtime(1);
        let noop = Arc::new(Codelet::new("noop", &[]).with_impl(Arch::Cpu, |_| {}));
        let err = rt.task(&noop).after(TaskId::from_raw(99)).submit().unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownTask(_)));
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_acquire_waits_for_writers() {
        let rt = runtime(2);
        let h = rt.register(vec![0]).unwrap();
        let slow = Arc::new(Codelet::new("slow_set", &[AccessMode::Write]).with_impl(Arch::Cpu, |ctx| {
            std::thread::sleep(Duration::from_millis(20));
            ctx.buffer(0).with_mut(|b| b[0] = 9);
        }));
        rt.task(&slow).buffer(h).submit().unwrap();
        let buffer = rt.acquire(h, AccessMode::Read).unwrap();
        assert_eq!(buffer.to_vec(), vec![9]);
        rt.release(h).unwrap();
        assert!(rt.release(h).is_err());
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_task_argument() {
        let rt = runtime(1);
        let h = rt.register(vec![3]).unwrap();
        let scale = Arc::new(Codelet::new("scale", &[AccessMode::ReadWrite]).with_impl(Arch::Cpu, |ctx| {
            let factor = *ctx.arg::<u8>().unwrap_or(&1);
            ctx.buffer(0).with_mut(|b| b[0] *= factor);
        }));
        rt.task(&scale).buffer(h).arg(5u8).submit().unwrap();
        rt.wait_for_all().unwrap();
        assert_eq!(rt.unregister(h).unwrap(), Some(vec![15]));
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_data_cpy() {
        let rt = runtime(2);
        let src = rt.register(vec![1, 2, 3, 4]).unwrap();
        let dst = rt.register_uninitialized(4);
        rt.data_cpy(dst, src).unwrap();
        let buffer = rt.acquire(dst, AccessMode::Read).unwrap();
        assert_eq!(buffer.to_vec(), vec![1, 2, 3, 4]);
        rt.release(dst).unwrap();
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_measurements_calibrate_the_model() {
        let rt = runtime(1);
        let h = rt.register(vec![0]).unwrap();
        let codelet = increment();
        rt.task(&codelet).buffer(h).submit().unwrap();
        rt.wait_for_all().unwrap();
        let summary = rt
            .perf()
            .summaries()
            .into_iter()
            .find(|s| s.kind == codelet.kind())
            .unwrap();
        assert_eq!(summary.samples, 1);
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_failed_task_poisons_dependents() {
        let rt = runtime(1);
        let missing = rt.register_uninitialized(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let reader = {
            let ran = Arc::clone(&ran);
            Arc::new(Codelet::new("reader", &[AccessMode::ReadWrite]).with_impl(Arch::Cpu, move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };
        // Reading a handle nobody wrote has no source
        rt.task(&reader).buffer(missing).submit().unwrap();
        rt.task(&reader).buffer(missing).submit().unwrap();
        let err = rt.wait_for_all().unwrap_err();
        assert!(matches!(err, RuntimeError::TaskFailed { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_kernel_fails_its_task() {
        let rt = runtime(1);
        let h = rt.register(vec![0]).unwrap();
        let boom = Arc::new(Codelet::new("boom", &[AccessMode::ReadWrite]).with_impl(Arch::Cpu, |_| {
            panic!("kernel exploded");
        }));
        let ran = Arc::new(AtomicUsize::new(0));
        let after = {
            let ran = Arc::clone(&ran);
            Arc::new(Codelet::new("after_boom", &[AccessMode::Read]).with_impl(Arch::Cpu, move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };
        rt.task(&boom).buffer(h).submit().unwrap();
        rt.task(&after).buffer(h).submit().unwrap();
        match rt.wait_for_all() {
            Err(RuntimeError::TaskFailed { reason, .. }) => assert!(reason.contains("kernel exploded")),
            other => panic!("expected a failed task, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // The only worker survived and keeps running tasks
        let other = rt.register(vec![0]).unwrap();
        rt.task(&after).buffer(other).submit().unwrap();
        rt.wait_for_all().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        rt.shutdown().unwrap();
    }

    #[test]
    fn test_bind_ids_repeat() {
        let rt = Runtime::start(RuntimeConfig::default().with_ncpus(3).with_bind_ids(vec![4, 6])).unwrap();
        assert_eq!(rt.worker_bind_id(WorkerId::from_index(0)), Some(4));
        assert_eq!(rt.worker_bind_id(WorkerId::from_index(2)), Some(4));
        assert_eq!(rt.worker_bind_id(WorkerId::from_index(9)), None);
        rt.shutdown().unwrap();
    }
}
