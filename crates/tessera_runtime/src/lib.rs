//! TESSERA Runtime
//!
//! Runs codelets on a pool of CPU and accelerator workers. Applications
//! register data, submit tasks naming the buffers they touch, and the
//! runtime derives the ordering between tasks from those accesses, places
//! each ready task with the scheduler and keeps replicas coherent while
//! workers move data to where tasks run.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera_core::{AccessMode, Arch};
//! use tessera_runtime::{Codelet, Runtime, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rt = Runtime::start(RuntimeConfig::default())?;
//! let v = rt.register(vec![1, 2, 3])?;
//! let double = Arc::new(
//!     Codelet::new("double", &[AccessMode::ReadWrite])
//!         .with_impl(Arch::Cpu, |ctx| ctx.buffer(0).with_mut(|b| b.iter_mut().for_each(|x| *x *= 2))),
//! );
//! rt.task(&double).buffer(v).submit()?;
//! rt.wait_for_all()?;
//! assert_eq!(rt.unregister(v)?, Some(vec![2, 4, 6]));
//! rt.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codelet;
pub mod config;
pub mod deps;
pub mod error;
pub mod runtime;
mod worker;

pub use codelet::{copy_codelet, Codelet, CodeletModel, KernelContext, KernelFn};
pub use config::{AcceleratorSpec, RuntimeConfig};
pub use deps::DependencyTracker;
pub use error::{RuntimeError, RuntimeResult};
pub use runtime::{Runtime, TaskArg, TaskBuilder, TaskCallback};
