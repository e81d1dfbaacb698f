//! What the scheduler knows about a task.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{AccessMode, ArchSet, ContextId, HandleId, TaskId, TaskKind};

/// One buffer a task accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferAccess {
    /// Data handle
    pub handle: HandleId,
    /// Access mode
    pub mode: AccessMode,
}

impl BufferAccess {
    /// Create a buffer descriptor
    #[must_use]
    pub const fn new(handle: HandleId, mode: AccessMode) -> Self {
        Self { handle, mode }
    }
}

/// Scheduling view of a task
///
/// The runtime keeps the full task (implementations, arguments) in its own
/// arena; queues hold only this.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedTask {
    /// Task identifier
    pub id: TaskId,
    /// Computation performed
    pub kind: TaskKind,
    /// Larger is more urgent
    pub priority: i32,
    /// Architectures with an implementation
    pub archs: ArchSet,
    /// Buffers in declaration order
    pub buffers: Arc<[BufferAccess]>,
    /// Footprint of the buffers' layout
    pub footprint: u32,
    /// Total bytes touched
    pub size: usize,
    /// Scheduling context
    pub context: ContextId,
    /// Predicted duration on the chosen worker, if calibrated
    pub predicted: Option<f64>,
    /// Predicted power on the chosen worker
    pub predicted_power: Option<f64>,
    /// Predicted transfer time accounted in the chosen queue
    pub predicted_transfer: f64,
}

impl SchedTask {
    /// Create a task with default priority and context
    #[must_use]
    pub fn new(id: TaskId, kind: TaskKind, archs: ArchSet, buffers: Vec<BufferAccess>) -> Self {
        Self {
            id,
            kind,
            priority: 0,
            archs,
            buffers: buffers.into(),
            footprint: 0,
            size: 0,
            context: ContextId::DEFAULT,
            predicted: None,
            predicted_power: None,
            predicted_transfer: 0.0,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set footprint and size
    #[must_use]
    pub fn with_layout(mut self, footprint: u32, size: usize) -> Self {
        self.footprint = footprint;
        self.size = size;
        self
    }

    /// Set the scheduling context
    #[must_use]
    pub fn with_context(mut self, context: ContextId) -> Self {
        self.context = context;
        self
    }

    /// Buffers as (handle, mode) pairs
    #[must_use]
    pub fn accesses(&self) -> Vec<(HandleId, AccessMode)> {
        self.buffers.iter().map(|b| (b.handle, b.mode)).collect()
    }

    /// Time this task adds to a queue's expected length
    #[must_use]
    pub fn queued_length(&self) -> f64 {
        self.predicted.unwrap_or(0.0) + self.predicted_transfer
    }
}
