//! Worker threads.
//!
//! A worker pops from its own queue, brings every input to its memory node,
//! runs the implementation for its architecture, releases the buffers and
//! feeds the measured duration back into the performance model. While its
//! queue is empty it drives pending transfers.

use crate::codelet::KernelContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::Shared;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tessera_data::{FetchStatus, NodeBuffer, RequestOutcome};
use tessera_sched::{BufferAccess, SchedError, SchedTask, WorkerInfo};

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Body of one worker thread
pub(crate) fn run(shared: &Shared, info: WorkerInfo) {
    let span = tracing::info_span!("worker", id = %info.id, arch = %info.arch);
    let _guard = span.enter();
    tracing::debug!(node = %info.memory_node, bind_id = ?info.bind_id, "worker started");

    loop {
        match shared.sched.pop_blocking(info.id, IDLE_POLL) {
            Ok(Some(task)) => {
                let outcome = execute(shared, &info, &task).map_err(|e| e.to_string());
                if let Err(reason) = &outcome {
                    tracing::error!(task = %task.id, %reason, "task failed");
                }
                shared.sched.task_done(info.id, &task);
                shared.complete(task.id, outcome);
            }
            Ok(None) => {
                shared.data.progress_all();
            }
            Err(SchedError::ShutDown) => break,
            Err(e) => {
                tracing::error!(error = %e, "worker stopping");
                break;
            }
        }
    }
    tracing::debug!("worker stopped");
}

fn execute(shared: &Shared, info: &WorkerInfo, task: &SchedTask) -> RuntimeResult<()> {
    let (codelet, arg) = shared
        .compute_body(task.id)
        .ok_or(RuntimeError::UnknownTask(task.id))?;
    let kernel = codelet
        .implementation(info.arch)
        .cloned()
        .ok_or_else(|| RuntimeError::MissingImplementation {
            codelet: codelet.name().to_string(),
            arch: info.arch,
        })?;

    let span = tracing::debug_span!("task", id = %task.id, kind = codelet.name());
    let _guard = span.enter();

    let mut buffers = Vec::with_capacity(task.buffers.len());
    for (i, access) in task.buffers.iter().enumerate() {
        match fetch_input(shared, info, access) {
            Ok(buffer) => buffers.push(buffer),
            Err(e) => {
                release_inputs(shared, info, &task.buffers[..i]);
                return Err(e);
            }
        }
    }

    let ctx = KernelContext::new(&buffers, arg.as_deref(), info.id, info.arch, info.memory_node);
    let start = Instant::now();
    let ran = panic::catch_unwind(AssertUnwindSafe(|| kernel(&ctx)));
    let elapsed_us = start.elapsed().as_secs_f64() * 1_000_000.0;
    let power = ctx.reported_power();

    release_inputs(shared, info, &task.buffers);
    if let Err(payload) = ran {
        return Err(RuntimeError::KernelPanicked {
            codelet: codelet.name().to_string(),
            message: panic_message(payload.as_ref()),
        });
    }
    shared.perf.observe(
        task.kind,
        info.perf_arch,
        task.footprint,
        task.size,
        elapsed_us,
        power,
    );
    tracing::debug!(elapsed_us, predicted = ?task.predicted, "task executed");
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Pin the replica `access` needs on the worker's node
fn fetch_input(shared: &Shared, info: &WorkerInfo, access: &BufferAccess) -> RuntimeResult<NodeBuffer> {
    if access.mode.is_relaxed() {
        return Ok(shared.data.fetch_private(access.handle, info.id, access.mode)?);
    }
    let node = info.memory_node;
    loop {
        let ticket = shared.data.fetch_async(access.handle, node, access.mode, false)?;
        if ticket.status() == FetchStatus::Frozen {
            // Every contributor has finished by now; fold their accumulators here
            shared.data.end_reduction(access.handle, node)?;
        }
        match ticket.wait(&shared.data)? {
            RequestOutcome::Completed => return Ok(shared.data.buffer(access.handle, node)?),
            RequestOutcome::Discarded => {
                tracing::debug!(handle = %access.handle, "input invalidated while in transfer, refetching");
            }
        }
    }
}

fn release_inputs(shared: &Shared, info: &WorkerInfo, accesses: &[BufferAccess]) {
    for access in accesses {
        let released = if access.mode.is_relaxed() {
            shared.data.release_private(access.handle, info.id)
        } else {
            shared.data.release(access.handle, info.memory_node, access.mode)
        };
        if let Err(e) = released {
            tracing::warn!(handle = %access.handle, error = %e, "release failed");
        }
    }
}
