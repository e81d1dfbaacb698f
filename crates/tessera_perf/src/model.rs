//! Per task-kind performance models.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{PerfArch, TaskKind};

/// Analytic cost function: (architecture, footprint, bytes) -> microseconds
pub type CostFn = Arc<dyn Fn(PerfArch, u32, usize) -> f64 + Send + Sync>;

/// Outcome of a duration prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// Expected duration in microseconds
    Estimate(f64),
    /// No measurement exists yet for this (kind, arch, footprint)
    Uncalibrated,
}

impl Prediction {
    /// Whether a real estimate is available
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        matches!(self, Self::Estimate(_))
    }

    /// The estimate, if any
    #[must_use]
    pub fn estimate(&self) -> Option<f64> {
        match self {
            Self::Estimate(v) => Some(*v),
            Self::Uncalibrated => None,
        }
    }
}

/// How a model produces its predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    /// Mean of past measurements per footprint
    History,
    /// Caller-supplied cost function; always calibrated
    Analytic,
    /// Fixed cost per performance architecture
    PerArch,
}

/// Measurements for one footprint on one architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Footprint of the task's data layout
    pub footprint: u32,
    /// Total bytes touched by the task
    pub size: usize,
    /// Number of duration samples
    pub nsample: u32,
    /// Sum of durations
    pub sum: f64,
    /// Sum of squared durations
    pub sum2: f64,
    /// Number of power samples
    pub power_samples: u32,
    /// Sum of power measurements
    pub power_sum: f64,
}

impl HistoryEntry {
    fn new(footprint: u32, size: usize) -> Self {
        Self {
            footprint,
            size,
            nsample: 0,
            sum: 0.0,
            sum2: 0.0,
            power_samples: 0,
            power_sum: 0.0,
        }
    }

    /// Mean duration
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.nsample == 0 {
            return 0.0;
        }
        self.sum / f64::from(self.nsample)
    }

    /// Standard deviation of durations
    #[must_use]
    pub fn deviation(&self) -> f64 {
        if self.nsample == 0 {
            return 0.0;
        }
        let n = f64::from(self.nsample);
        let mean = self.sum / n;
        (self.sum2 / n - mean * mean).max(0.0).sqrt()
    }

    /// Mean power, if any power was measured
    #[must_use]
    pub fn power(&self) -> Option<f64> {
        if self.power_samples == 0 {
            return None;
        }
        Some(self.power_sum / f64::from(self.power_samples))
    }

    fn record(&mut self, length_us: f64, power: Option<f64>) {
        self.nsample += 1;
        self.sum += length_us;
        self.sum2 += length_us * length_us;
        if let Some(p) = power {
            self.power_samples += 1;
            self.power_sum += p;
        }
    }
}

/// Performance model for one task kind
#[derive(Clone, Serialize, Deserialize)]
pub struct PerfModel {
    /// Task kind the model describes
    pub kind: TaskKind,
    /// Human-readable symbol
    pub symbol: String,
    /// Prediction strategy
    pub model_type: ModelType,
    /// History per architecture, keyed by footprint
    histories: IndexMap<String, ArchHistory>,
    /// Fixed costs per architecture
    per_arch_cost: IndexMap<String, f64>,
    #[serde(skip)]
    cost: Option<CostFn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArchHistory {
    arch: PerfArch,
    entries: IndexMap<u32, HistoryEntry>,
}

impl std::fmt::Debug for PerfModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfModel")
            .field("kind", &self.kind)
            .field("symbol", &self.symbol)
            .field("model_type", &self.model_type)
            .field("histories", &self.histories.len())
            .finish()
    }
}

impl PerfModel {
    /// Create a history-based model
    #[must_use]
    pub fn history(kind: TaskKind, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            model_type: ModelType::History,
            histories: IndexMap::new(),
            per_arch_cost: IndexMap::new(),
            cost: None,
        }
    }

    /// Create an analytic model
    #[must_use]
    pub fn analytic(kind: TaskKind, symbol: impl Into<String>, cost: CostFn) -> Self {
        Self {
            model_type: ModelType::Analytic,
            cost: Some(cost),
            ..Self::history(kind, symbol)
        }
    }

    /// Create a fixed-cost-per-architecture model
    #[must_use]
    pub fn per_arch(kind: TaskKind, symbol: impl Into<String>, costs: &[(PerfArch, f64)]) -> Self {
        let mut model = Self {
            model_type: ModelType::PerArch,
            ..Self::history(kind, symbol)
        };
        for (arch, cost) in costs {
            model.per_arch_cost.insert(arch.to_string(), *cost);
        }
        model
    }

    /// Predict the duration of a task with the given footprint
    ///
    /// A history entry counts as calibrated once it holds `min_samples` samples.
    #[must_use]
    pub fn predict(&self, arch: PerfArch, footprint: u32, size: usize, min_samples: u32) -> Prediction {
        match self.model_type {
            ModelType::Analytic => match &self.cost {
                Some(cost) => Prediction::Estimate(cost(arch, footprint, size)),
                None => Prediction::Uncalibrated,
            },
            ModelType::PerArch => match self.per_arch_cost.get(&arch.to_string()) {
                Some(cost) => Prediction::Estimate(*cost),
                None => Prediction::Uncalibrated,
            },
            ModelType::History => match self.entry(arch, footprint) {
                Some(entry) if entry.nsample >= min_samples.max(1) => {
                    Prediction::Estimate(entry.mean())
                }
                _ => Prediction::Uncalibrated,
            },
        }
    }

    /// Predict the power drawn by a task with the given footprint
    #[must_use]
    pub fn predict_power(&self, arch: PerfArch, footprint: u32) -> Option<f64> {
        self.entry(arch, footprint).and_then(HistoryEntry::power)
    }

    /// Record a measurement
    pub fn observe(
        &mut self,
        arch: PerfArch,
        footprint: u32,
        size: usize,
        length_us: f64,
        power: Option<f64>,
    ) {
        let history = self
            .histories
            .entry(arch.to_string())
            .or_insert_with(|| ArchHistory {
                arch,
                entries: IndexMap::new(),
            });
        history
            .entries
            .entry(footprint)
            .or_insert_with(|| HistoryEntry::new(footprint, size))
            .record(length_us, power);
    }

    /// Look up the history entry for an architecture and footprint
    #[must_use]
    pub fn entry(&self, arch: PerfArch, footprint: u32) -> Option<&HistoryEntry> {
        self.histories
            .get(&arch.to_string())
            .and_then(|h| h.entries.get(&footprint))
    }

    /// Architectures with at least one measurement
    pub fn measured_archs(&self) -> impl Iterator<Item = PerfArch> + '_ {
        self.histories.values().map(|h| h.arch)
    }

    /// Total number of samples across all architectures
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.histories
            .values()
            .flat_map(|h| h.entries.values())
            .map(|e| u64::from(e.nsample))
            .sum()
    }

    /// Merge measurements from a model loaded from disk
    pub(crate) fn absorb(&mut self, other: PerfModel) {
        for (key, history) in other.histories {
            let mine = self.histories.entry(key).or_insert_with(|| ArchHistory {
                arch: history.arch,
                entries: IndexMap::new(),
            });
            for (fp, entry) in history.entries {
                match mine.entries.get_mut(&fp) {
                    Some(existing) => {
                        existing.nsample += entry.nsample;
                        existing.sum += entry.sum;
                        existing.sum2 += entry.sum2;
                        existing.power_samples += entry.power_samples;
                        existing.power_sum += entry.power_sum;
                    }
                    None => {
                        mine.entries.insert(fp, entry);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_core::Arch;

    fn kind() -> TaskKind {
        TaskKind::from_symbol("scal")
    }

    #[test]
    fn test_history_uncalibrated_until_observed() {
        let mut model = PerfModel::history(kind(), "scal");
        let cpu = PerfArch::cpu();
        assert_eq!(model.predict(cpu, 1, 64, 1), Prediction::Uncalibrated);

        model.observe(cpu, 1, 64, 10.0, None);
        assert_eq!(model.predict(cpu, 1, 64, 1), Prediction::Estimate(10.0));

        // Other footprints and architectures stay uncalibrated
        assert_eq!(model.predict(cpu, 2, 64, 1), Prediction::Uncalibrated);
        let cuda = PerfArch::new(Arch::Cuda, 0);
        assert_eq!(model.predict(cuda, 1, 64, 1), Prediction::Uncalibrated);
    }

    #[test]
    fn test_history_min_samples() {
        let mut model = PerfModel::history(kind(), "scal");
        let cpu = PerfArch::cpu();
        model.observe(cpu, 1, 64, 10.0, None);
        assert!(!model.predict(cpu, 1, 64, 3).is_calibrated());

        model.observe(cpu, 1, 64, 20.0, None);
        model.observe(cpu, 1, 64, 30.0, None);
        assert_eq!(model.predict(cpu, 1, 64, 3).estimate(), Some(20.0));
    }

    #[test]
    fn test_history_deviation_and_power() {
        let mut model = PerfModel::history(kind(), "scal");
        let cpu = PerfArch::cpu();
        model.observe(cpu, 1, 64, 10.0, Some(5.0));
        model.observe(cpu, 1, 64, 30.0, None);

        let entry = model.entry(cpu, 1).unwrap();
        assert_eq!(entry.nsample, 2);
        assert_eq!(entry.mean(), 20.0);
        assert_eq!(entry.deviation(), 10.0);
        assert_eq!(model.predict_power(cpu, 1), Some(5.0));
        assert_eq!(model.total_samples(), 2);
    }

    #[test]
    fn test_analytic_always_calibrated() {
        let model = PerfModel::analytic(
            kind(),
            "scal",
            Arc::new(|arch, _fp, size| size as f64 / arch.relative_speedup()),
        );
        assert_eq!(
            model.predict(PerfArch::cpu(), 0, 100, 1),
            Prediction::Estimate(100.0)
        );
    }

    #[test]
    fn test_per_arch_costs() {
        let cuda = PerfArch::new(Arch::Cuda, 0);
        let model = PerfModel::per_arch(kind(), "scal", &[(PerfArch::cpu(), 50.0), (cuda, 5.0)]);
        assert_eq!(model.predict(cuda, 9, 0, 1), Prediction::Estimate(5.0));
        assert_eq!(
            model.predict(PerfArch::new(Arch::OpenCl, 0), 9, 0, 1),
            Prediction::Uncalibrated
        );
    }

    #[test]
    fn test_absorb_merges_samples() {
        let cpu = PerfArch::cpu();
        let mut a = PerfModel::history(kind(), "scal");
        a.observe(cpu, 1, 64, 10.0, None);
        let mut b = PerfModel::history(kind(), "scal");
        b.observe(cpu, 1, 64, 30.0, None);
        b.observe(cpu, 2, 64, 7.0, None);

        a.absorb(b);
        assert_eq!(a.entry(cpu, 1).unwrap().mean(), 20.0);
        assert_eq!(a.entry(cpu, 2).unwrap().nsample, 1);
    }

    proptest::proptest! {
        #[test]
        fn test_mean_stays_within_samples(samples in proptest::collection::vec(1.0f64..1e6, 1..50)) {
            let mut model = PerfModel::history(kind(), "scal");
            for s in &samples {
                model.observe(PerfArch::cpu(), 7, 64, *s, None);
            }
            let entry = model.entry(PerfArch::cpu(), 7).unwrap();
            let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = samples.iter().copied().fold(0.0, f64::max);
            prop_assert_eq!(entry.nsample as usize, samples.len());
            prop_assert!(entry.mean() >= lo * (1.0 - 1e-9) && entry.mean() <= hi * (1.0 + 1e-9));
            prop_assert!(entry.deviation() >= 0.0);
        }
    }
}
