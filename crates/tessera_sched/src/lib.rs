//! TESSERA Scheduling
//!
//! Places ready tasks on per-worker queues using performance-model
//! predictions and data-transfer penalties, and hands them back to workers
//! in policy order.
//!
//! The scheduler never runs tasks and never moves data itself: it asks a
//! [`DataOracle`] what transfers would cost and how many inputs are resident,
//! and the runtime's workers do the rest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod task;

pub use error::{SchedError, SchedResult};
pub use policy::{PriorityRange, SchedPolicy};
pub use queue::WorkerQueue;
pub use registry::{QueueTiming, TimingSnapshot, WorkerInfo, WorkerRegistry, WorkerSlot};
pub use scheduler::{
    ContextCounters, DataOracle, DmdaScheduler, SchedConfig, SchedIntrospection, SchedWeights,
    WorkerLoad,
};
pub use task::{BufferAccess, SchedTask};
