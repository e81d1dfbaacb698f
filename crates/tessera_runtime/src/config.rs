//! Runtime configuration.
//!
//! Defaults, builder methods, and an overlay of `TESSERA_*` environment
//! variables.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tessera_core::{Arch, MemoryNode, WorkerId};
use tessera_data::DataConfig;
use tessera_sched::{SchedConfig, SchedPolicy, SchedWeights, WorkerInfo};

/// One accelerator worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorSpec {
    /// Architecture family
    pub arch: Arch,
    /// Device index within the family
    pub device: u32,
}

impl AcceleratorSpec {
    /// Create an accelerator description
    #[must_use]
    pub const fn new(arch: Arch, device: u32) -> Self {
        Self { arch, device }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// CPU workers, all computing from host memory
    pub ncpus: usize,
    /// Accelerator workers, each with its own memory node
    pub accelerators: Vec<AcceleratorSpec>,
    /// Scheduling policy
    pub policy: SchedPolicy,
    /// Fitness coefficients
    pub weights: SchedWeights,
    /// Prefetch inputs when a task is placed
    pub prefetch: bool,
    /// Samples before a history model is trusted
    pub calibrate_min_samples: u32,
    /// Directory performance models are loaded from and saved to
    pub sampling_dir: Option<PathBuf>,
    /// Attempts per transfer before it fails
    pub max_transfer_retries: u32,
    /// Transfers in flight per destination node
    pub max_in_flight: usize,
    /// Logical CPUs workers are bound to, repeated when shorter than the worker count
    pub bind_ids: Vec<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let data = DataConfig::default();
        Self {
            ncpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            accelerators: Vec::new(),
            policy: SchedPolicy::default(),
            weights: SchedWeights::default(),
            prefetch: true,
            calibrate_min_samples: 1,
            sampling_dir: None,
            max_transfer_retries: data.max_transfer_retries,
            max_in_flight: data.max_in_flight,
            bind_ids: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Set the number of CPU workers
    #[must_use]
    pub fn with_ncpus(mut self, ncpus: usize) -> Self {
        self.ncpus = ncpus;
        self
    }

    /// Add an accelerator worker
    #[must_use]
    pub fn with_accelerator(mut self, arch: Arch, device: u32) -> Self {
        self.accelerators.push(AcceleratorSpec::new(arch, device));
        self
    }

    /// Set the scheduling policy
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

    /// Set the calibration sample threshold
    #[must_use]
    pub fn with_calibrate_min_samples(mut self, samples: u32) -> Self {
        self.calibrate_min_samples = samples;
        self
    }

    /// Set the sampling directory
    #[must_use]
    pub fn with_sampling_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sampling_dir = Some(dir.into());
        self
    }

    /// Set the transfer retry limit
    #[must_use]
    pub fn with_max_transfer_retries(mut self, retries: u32) -> Self {
        self.max_transfer_retries = retries;
        self
    }

    /// Set the worker CPU bindings
    #[must_use]
    pub fn with_bind_ids(mut self, ids: Vec<usize>) -> Self {
        self.bind_ids = ids;
        self
    }

    /// Defaults overlaid with the process environment
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unparseable variables
    pub fn from_env() -> RuntimeResult<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay variables read through `lookup` on this configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first unparseable variable
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> RuntimeResult<Self> {
        if let Some(v) = lookup("TESSERA_SCHED") {
            self.policy = v
                .parse()
                .map_err(|e: tessera_sched::SchedError| RuntimeError::config("TESSERA_SCHED", e.to_string()))?;
        }
        if let Some(v) = lookup("TESSERA_SCHED_ALPHA") {
            self.weights.alpha = parse_number("TESSERA_SCHED_ALPHA", &v)?;
        }
        if let Some(v) = lookup("TESSERA_SCHED_BETA") {
            self.weights.beta = parse_number("TESSERA_SCHED_BETA", &v)?;
        }
        if let Some(v) = lookup("TESSERA_SCHED_GAMMA") {
            self.weights.gamma = parse_number("TESSERA_SCHED_GAMMA", &v)?;
        }
        if let Some(v) = lookup("TESSERA_IDLE_POWER") {
            self.weights.idle_power = parse_number("TESSERA_IDLE_POWER", &v)?;
        }
        if let Some(v) = lookup("TESSERA_NCPUS") {
            self.ncpus = parse_number("TESSERA_NCPUS", &v)?;
        }
        if let Some(v) = lookup("TESSERA_PREFETCH") {
            self.prefetch = parse_flag("TESSERA_PREFETCH", &v)?;
        }
        if let Some(v) = lookup("TESSERA_CALIBRATE") {
            self.calibrate_min_samples = parse_number("TESSERA_CALIBRATE", &v)?;
        }
        if let Some(v) = lookup("TESSERA_SAMPLING_DIR") {
            if !v.trim().is_empty() {
                self.sampling_dir = Some(PathBuf::from(v.trim()));
            }
        }
        if let Some(v) = lookup("TESSERA_WORKERS_CPUID") {
            self.bind_ids = v
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| parse_number("TESSERA_WORKERS_CPUID", s))
                .collect::<RuntimeResult<_>>()?;
        }
        Ok(self)
    }

    /// Check the configuration describes a usable machine
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when there are no workers or a limit is zero
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.nworkers() == 0 {
            return Err(RuntimeError::config("ncpus", "the machine has no workers"));
        }
        if self.max_transfer_retries == 0 {
            return Err(RuntimeError::config("max_transfer_retries", "must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(RuntimeError::config("max_in_flight", "must be at least 1"));
        }
        for (name, weight) in [
            ("alpha", self.weights.alpha),
            ("beta", self.weights.beta),
            ("gamma", self.weights.gamma),
            ("idle_power", self.weights.idle_power),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RuntimeError::config(name, format!("{weight} is not a non-negative number")));
            }
        }
        Ok(())
    }

    /// Total number of workers
    #[must_use]
    pub fn nworkers(&self) -> usize {
        self.ncpus + self.accelerators.len()
    }

    /// Number of memory nodes: host plus one per accelerator
    #[must_use]
    pub fn nnodes(&self) -> usize {
        1 + self.accelerators.len()
    }

    /// Worker descriptions, CPUs first
    #[must_use]
    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        let cpus = (0..self.ncpus).map(|i| WorkerInfo::cpu(WorkerId::from_index(i)));
        let accels = self.accelerators.iter().enumerate().map(|(i, spec)| {
            WorkerInfo::accelerator(
                WorkerId::from_index(self.ncpus + i),
                spec.arch,
                spec.device,
                MemoryNode::from_index(1 + i),
            )
        });
        cpus.chain(accels)
            .enumerate()
            .map(|(i, info)| match self.bind_id(i) {
                Some(id) => info.with_bind_id(id),
                None => info,
            })
            .collect()
    }

    /// Logical CPU of worker `index`
    #[must_use]
    pub fn bind_id(&self, index: usize) -> Option<usize> {
        if self.bind_ids.is_empty() {
            None
        } else {
            Some(self.bind_ids[index % self.bind_ids.len()])
        }
    }

    /// Scheduler part of the configuration
    #[must_use]
    pub fn sched_config(&self) -> SchedConfig {
        SchedConfig::default()
            .with_policy(self.policy)
            .with_weights(self.weights)
            .with_prefetch(self.prefetch)
    }

    /// Data-management part of the configuration
    #[must_use]
    pub fn data_config(&self) -> DataConfig {
        DataConfig::default()
            .with_max_transfer_retries(self.max_transfer_retries)
            .with_max_in_flight(self.max_in_flight)
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> RuntimeResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| RuntimeError::config(field, format!("{value:?}: {e}")))
}

fn parse_flag(field: &str, value: &str) -> RuntimeResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RuntimeError::config(field, format!("{value:?} is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.policy, SchedPolicy::Dmda);
        assert_eq!(config.weights.gamma, 1000.0);
        assert!(config.prefetch);
        assert_eq!(config.max_transfer_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay() {
        let config = RuntimeConfig::default()
            .overlay(env(&[
                ("TESSERA_SCHED", "dmdas"),
                ("TESSERA_SCHED_BETA", "2.5"),
                ("TESSERA_NCPUS", "3"),
                ("TESSERA_PREFETCH", "off"),
                ("TESSERA_CALIBRATE", "4"),
                ("TESSERA_WORKERS_CPUID", "0, 2"),
            ]))
            .unwrap();
        assert_eq!(config.policy, SchedPolicy::Dmdas);
        assert_eq!(config.weights.beta, 2.5);
        assert_eq!(config.ncpus, 3);
        assert!(!config.prefetch);
        assert_eq!(config.calibrate_min_samples, 4);
        assert_eq!(config.bind_ids, vec![0, 2]);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = RuntimeConfig::default()
            .overlay(env(&[("TESSERA_SCHED_ALPHA", "fast")]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { ref field, .. } if field == "TESSERA_SCHED_ALPHA"));

        let err = RuntimeConfig::default()
            .overlay(env(&[("TESSERA_SCHED", "random")]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_topology() {
        let config = RuntimeConfig::default()
            .with_ncpus(2)
            .with_accelerator(Arch::Cuda, 0)
            .with_accelerator(Arch::Cuda, 1)
            .with_bind_ids(vec![5, 6, 7]);
        assert_eq!(config.nworkers(), 4);
        assert_eq!(config.nnodes(), 3);

        let infos = config.worker_infos();
        assert_eq!(infos[0].memory_node, MemoryNode::HOST);
        assert_eq!(infos[3].memory_node, MemoryNode::from_index(2));
        assert_eq!(infos[3].perf_arch.device, 1);
        let binds: Vec<Option<usize>> = infos.iter().map(|i| i.bind_id).collect();
        assert_eq!(binds, vec![Some(5), Some(6), Some(7), Some(5)]);
    }

    #[test]
    fn test_validate() {
        assert!(RuntimeConfig::default().with_ncpus(0).validate().is_err());
        let mut config = RuntimeConfig::default();
        config.weights.alpha = -1.0;
        assert!(config.validate().is_err());
    }
}
