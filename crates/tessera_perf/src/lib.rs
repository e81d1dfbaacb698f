//! TESSERA Performance Models
//!
//! Predicts how long a task kind runs on a performance architecture and how
//! long moving bytes between memory nodes takes. Until a (kind, arch,
//! footprint) triple has been measured, predictions are explicitly
//! [`Prediction::Uncalibrated`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod model;
pub mod registry;

pub use bus::{BusModel, LinkModel};
pub use error::{PerfError, PerfResult};
pub use model::{CostFn, HistoryEntry, ModelType, PerfModel, Prediction};
pub use registry::{ModelSummary, PerfRegistry};
