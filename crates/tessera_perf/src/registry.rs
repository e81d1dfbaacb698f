//! Registry of performance models, shared by the scheduler and workers.

use crate::error::{PerfError, PerfResult};
use crate::model::{CostFn, ModelType, PerfModel, Prediction};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tessera_core::{PerfArch, TaskKind};

/// Summary of one model, for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Task kind
    pub kind: TaskKind,
    /// Symbol
    pub symbol: String,
    /// Prediction strategy
    pub model_type: ModelType,
    /// Architectures with measurements
    pub archs: Vec<PerfArch>,
    /// Total number of samples
    pub samples: u64,
}

/// Thread-safe collection of performance models keyed by task kind
///
/// Kinds that were never registered get a history model on first use, so
/// every task kind calibrates itself eventually.
pub struct PerfRegistry {
    models: RwLock<IndexMap<TaskKind, PerfModel>>,
    min_samples: u32,
}

impl PerfRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(min_samples: u32) -> Self {
        Self {
            models: RwLock::new(IndexMap::new()),
            min_samples: min_samples.max(1),
        }
    }

    /// Samples required before a history entry is trusted
    #[must_use]
    pub const fn min_samples(&self) -> u32 {
        self.min_samples
    }

    /// Register (or replace) a model
    pub fn register(&self, model: PerfModel) {
        tracing::debug!(kind = %model.kind, symbol = %model.symbol, "registering performance model");
        self.models.write().insert(model.kind, model);
    }

    /// Register a history model unless one already exists for the kind
    pub fn ensure_history(&self, kind: TaskKind, symbol: &str) {
        let mut models = self.models.write();
        models
            .entry(kind)
            .or_insert_with(|| PerfModel::history(kind, symbol));
    }

    /// Register an analytic cost function for a kind
    pub fn register_analytic(&self, kind: TaskKind, symbol: &str, cost: CostFn) {
        self.register(PerfModel::analytic(kind, symbol, cost));
    }

    /// Predict the duration of a task on an architecture
    #[must_use]
    pub fn predict(&self, kind: TaskKind, arch: PerfArch, footprint: u32, size: usize) -> Prediction {
        self.models
            .read()
            .get(&kind)
            .map_or(Prediction::Uncalibrated, |m| {
                m.predict(arch, footprint, size, self.min_samples)
            })
    }

    /// Predict the power drawn by a task on an architecture
    #[must_use]
    pub fn predict_power(&self, kind: TaskKind, arch: PerfArch, footprint: u32) -> Option<f64> {
        self.models
            .read()
            .get(&kind)
            .and_then(|m| m.predict_power(arch, footprint))
    }

    /// Feed a measurement back into the model for `kind`
    pub fn observe(
        &self,
        kind: TaskKind,
        arch: PerfArch,
        footprint: u32,
        size: usize,
        length_us: f64,
        power: Option<f64>,
    ) {
        let mut models = self.models.write();
        let model = models
            .entry(kind)
            .or_insert_with(|| PerfModel::history(kind, kind.to_string()));
        model.observe(arch, footprint, size, length_us, power);
        tracing::trace!(%kind, %arch, footprint, length_us, "recorded measurement");
    }

    /// Snapshot of one model
    #[must_use]
    pub fn model(&self, kind: TaskKind) -> Option<PerfModel> {
        self.models.read().get(&kind).cloned()
    }

    /// Summaries of every registered model
    #[must_use]
    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.models
            .read()
            .values()
            .map(|m| ModelSummary {
                kind: m.kind,
                symbol: m.symbol.clone(),
                model_type: m.model_type,
                archs: m.measured_archs().collect(),
                samples: m.total_samples(),
            })
            .collect()
    }

    /// Persist every history model into `dir`, one JSON file per kind
    ///
    /// # Errors
    ///
    /// Returns error if the directory or a file cannot be written
    pub fn save(&self, dir: &Path) -> PerfResult<usize> {
        std::fs::create_dir_all(dir).map_err(|source| PerfError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let models = self.models.read();
        let mut written = 0;
        for model in models.values() {
            if model.model_type != ModelType::History {
                continue;
            }
            let path = dir.join(format!("{}.json", model.kind.as_uuid()));
            let json = serde_json::to_vec_pretty(model).map_err(|e| PerfError::InvalidModel {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            std::fs::write(&path, json).map_err(|source| PerfError::Io {
                path: path.display().to_string(),
                source,
            })?;
            written += 1;
        }

        tracing::info!(dir = %dir.display(), written, "saved performance models");
        Ok(written)
    }

    /// Load every model file found in `dir`, merging with models already present
    ///
    /// A missing directory is not an error: nothing has been sampled yet.
    ///
    /// # Errors
    ///
    /// Returns error if a file cannot be read or decoded
    pub fn load(&self, dir: &Path) -> PerfResult<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let entries = std::fs::read_dir(dir).map_err(|source| PerfError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut loaded = 0;
        for entry in entries {
            let entry = entry.map_err(|source| PerfError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = std::fs::read(&path).map_err(|source| PerfError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let model: PerfModel =
                serde_json::from_slice(&bytes).map_err(|e| PerfError::InvalidModel {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            let mut models = self.models.write();
            match models.get_mut(&model.kind) {
                Some(existing) if existing.model_type == ModelType::History => {
                    existing.absorb(model);
                }
                Some(_) => {}
                None => {
                    models.insert(model.kind, model);
                }
            }
            loaded += 1;
        }

        tracing::info!(dir = %dir.display(), loaded, "loaded performance models");
        Ok(loaded)
    }
}

impl Default for PerfRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::Arch;

    #[test]
    fn test_unknown_kind_is_uncalibrated() {
        let registry = PerfRegistry::default();
        let kind = TaskKind::from_symbol("never_seen");
        assert_eq!(
            registry.predict(kind, PerfArch::cpu(), 0, 0),
            Prediction::Uncalibrated
        );
    }

    #[test]
    fn test_observe_creates_history_model() {
        let registry = PerfRegistry::default();
        let kind = TaskKind::from_symbol("axpy");
        registry.observe(kind, PerfArch::cpu(), 4, 32, 8.0, Some(2.0));

        assert_eq!(
            registry.predict(kind, PerfArch::cpu(), 4, 32),
            Prediction::Estimate(8.0)
        );
        assert_eq!(registry.predict_power(kind, PerfArch::cpu(), 4), Some(2.0));
        assert_eq!(registry.summaries().len(), 1);
    }

    #[test]
    fn test_register_analytic() {
        let registry = PerfRegistry::default();
        let kind = TaskKind::from_symbol("fft");
        registry.register_analytic(kind, "fft", Arc::new(|_, _, _| 42.0));
        let cuda = PerfArch::new(Arch::Cuda, 0);
        assert_eq!(registry.predict(kind, cuda, 0, 0), Prediction::Estimate(42.0));
    }

    #[test]
    fn test_ensure_history_keeps_existing() {
        let registry = PerfRegistry::default();
        let kind = TaskKind::from_symbol("fft");
        registry.register_analytic(kind, "fft", Arc::new(|_, _, _| 1.0));
        registry.ensure_history(kind, "fft");
        assert_eq!(registry.model(kind).unwrap().model_type, ModelType::Analytic);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let kind = TaskKind::from_symbol("gemm");
        let cuda = PerfArch::new(Arch::Cuda, 0);

        let registry = PerfRegistry::default();
        registry.ensure_history(kind, "gemm");
        registry.observe(kind, cuda, 7, 1024, 100.0, None);
        registry.observe(kind, cuda, 7, 1024, 300.0, None);
        assert_eq!(registry.save(dir.path()).unwrap(), 1);

        let restored = PerfRegistry::default();
        assert_eq!(restored.load(dir.path()).unwrap(), 1);
        assert_eq!(restored.predict(kind, cuda, 7, 1024), Prediction::Estimate(200.0));
        assert_eq!(restored.model(kind).unwrap().symbol, "gemm");
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PerfRegistry::default();
        assert_eq!(registry.load(&dir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let registry = PerfRegistry::default();
        assert!(matches!(
            registry.load(dir.path()),
            Err(PerfError::InvalidModel { .. })
        ));
    }
}
