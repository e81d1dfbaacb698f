//! TESSERA Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Every other tessera crate speaks in these identifiers, architecture
//! descriptors and access modes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod arch;
pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use access::AccessMode;
pub use arch::{Arch, ArchSet, PerfArch};
pub use error::{CoreError, CoreResult};
pub use id::{ContextId, HandleId, MemoryNode, RequestId, TaskId, TaskKind, WorkerId};
pub use time::{Clock, ManualClock, MonotonicClock};
