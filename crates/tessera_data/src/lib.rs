//! TESSERA Data Management
//!
//! Tracks, for every logical data object, which memory nodes hold valid
//! copies and in what state, and drives asynchronous transfers so that a
//! consumer on any node sees coherent contents.
//!
//! Layers, leaves first:
//! - [`backend`]: the memory/transfer seam (allocate, free, async copy)
//! - [`replica`]: per-node and per-worker copies with their MSI state
//! - [`handle`]: the logical data object and its partition links
//! - [`coherency`]: pure state transitions over a handle
//! - [`request`]: per-node queues of in-flight transfers
//! - [`manager`]: the entry point tying it together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod coherency;
pub mod error;
pub mod filter;
pub mod footprint;
pub mod handle;
pub mod manager;
pub mod registry;
pub mod replica;
pub mod request;

pub use backend::{HostMemory, MemoryBackend, NodeBuffer, TransferStatus, TransferToken};
pub use error::{DataError, DataResult};
pub use filter::{BlockFilter, PartitionFilter};
pub use handle::{DataHandle, InitFn, ReductionOps, ReduxFn};
pub use manager::{DataConfig, DataManager, FetchStatus, FetchTicket, MsiStats, ReplicaStatus};
pub use registry::HandleRegistry;
pub use replica::{AccessStats, CacheState, Replica};
pub use request::{Completion, QueueStats, RequestOutcome};
