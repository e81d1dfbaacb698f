//! Processing architectures and capability sets.
//!
//! A worker has exactly one [`Arch`]; a task declares the set of
//! architectures it has implementations for as an [`ArchSet`]. Performance
//! models are keyed by the finer-grained [`PerfArch`].

use serde::{Deserialize, Serialize};

/// A processing architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
    /// General-purpose CPU core
    Cpu,
    /// CUDA accelerator
    Cuda,
    /// OpenCL accelerator
    OpenCl,
}

impl Arch {
    /// Every architecture, in bit order
    pub const ALL: [Arch; 3] = [Arch::Cpu, Arch::Cuda, Arch::OpenCl];

    const fn bit(self) -> u8 {
        match self {
            Self::Cpu => 1 << 0,
            Self::Cuda => 1 << 1,
            Self::OpenCl => 1 << 2,
        }
    }

    /// Default relative speed of this family compared to one CPU core
    #[must_use]
    pub const fn relative_speedup(self) -> f64 {
        match self {
            Self::Cpu => 1.0,
            Self::Cuda => 13.33,
            Self::OpenCl => 12.22,
        }
    }

    /// Get a string representation of the architecture
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::OpenCl => "opencl",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Arch {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "opencl" => Ok(Self::OpenCl),
            other => Err(crate::CoreError::InvalidArch {
                name: other.to_string(),
            }),
        }
    }
}

/// A set of architectures, the capability bitmap of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ArchSet(u8);

impl ArchSet {
    /// Create a new empty set
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Set containing every architecture
    #[must_use]
    pub const fn all() -> Self {
        Self(Arch::Cpu.bit() | Arch::Cuda.bit() | Arch::OpenCl.bit())
    }

    /// Set containing one architecture
    #[must_use]
    pub const fn only(arch: Arch) -> Self {
        Self(arch.bit())
    }

    /// Add an architecture
    pub fn insert(&mut self, arch: Arch) {
        self.0 |= arch.bit();
    }

    /// Builder-style insert
    #[must_use]
    pub const fn with(self, arch: Arch) -> Self {
        Self(self.0 | arch.bit())
    }

    /// Check membership
    #[must_use]
    pub const fn contains(&self, arch: Arch) -> bool {
        self.0 & arch.bit() != 0
    }

    /// Check whether the set is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate members in bit order
    pub fn iter(&self) -> impl Iterator<Item = Arch> + '_ {
        Arch::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Arch> for ArchSet {
    fn from_iter<I: IntoIterator<Item = Arch>>(iter: I) -> Self {
        let mut set = Self::new();
        for arch in iter {
            set.insert(arch);
        }
        set
    }
}

impl std::fmt::Display for ArchSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(Arch::name).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}

/// Performance architecture - the key performance histories are stored under
///
/// Two CUDA devices of different generations are different performance
/// architectures even though they share an [`Arch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PerfArch {
    /// Architecture family
    pub arch: Arch,
    /// Device index within the family (0 for CPUs)
    pub device: u32,
}

impl PerfArch {
    /// Create a new performance architecture
    #[must_use]
    pub const fn new(arch: Arch, device: u32) -> Self {
        Self { arch, device }
    }

    /// The default CPU performance architecture
    #[must_use]
    pub const fn cpu() -> Self {
        Self::new(Arch::Cpu, 0)
    }

    /// Relative speed compared to one CPU core
    #[must_use]
    pub const fn relative_speedup(&self) -> f64 {
        self.arch.relative_speedup()
    }
}

impl std::fmt::Display for PerfArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.arch, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_arch_set_membership() {
        let set = ArchSet::only(Arch::Cpu).with(Arch::Cuda);
        assert!(set.contains(Arch::Cpu));
        assert!(set.contains(Arch::Cuda));
        assert!(!set.contains(Arch::OpenCl));
        assert!(!set.is_empty());
        assert!(ArchSet::new().is_empty());
    }

    #[test]
    fn test_arch_set_from_iter() {
        let set: ArchSet = [Arch::OpenCl, Arch::Cpu].into_iter().collect();
        let members: Vec<Arch> = set.iter().collect();
        assert_eq!(members, vec![Arch::Cpu, Arch::OpenCl]);
    }

    #[test]
    fn test_arch_set_display() {
        assert_eq!(format!("{}", ArchSet::all()), "{cpu,cuda,opencl}");
        assert_eq!(format!("{}", ArchSet::new()), "{}");
    }

    #[test]
    fn test_arch_parse() {
        assert_eq!("CUDA".parse::<Arch>().unwrap(), Arch::Cuda);
        assert!("fpga".parse::<Arch>().is_err());
    }

    #[test]
    fn test_relative_speedup() {
        assert_eq!(PerfArch::cpu().relative_speedup(), 1.0);
        assert!(PerfArch::new(Arch::Cuda, 0).relative_speedup() > 1.0);
    }

    #[test]
    fn test_perf_arch_display() {
        assert_eq!(format!("{}", PerfArch::new(Arch::Cuda, 1)), "cuda_1");
    }

    proptest::proptest! {
        #[test]
        fn test_arch_set_matches_membership(mask in proptest::collection::vec(any::<bool>(), 3)) {
            let set: ArchSet = Arch::ALL
                .into_iter()
                .zip(&mask)
                .filter(|(_, keep)| **keep)
                .map(|(arch, _)| arch)
                .collect();
            for (arch, keep) in Arch::ALL.into_iter().zip(&mask) {
                prop_assert_eq!(set.contains(arch), *keep);
            }
            prop_assert_eq!(set.is_empty(), !mask.iter().any(|k| *k));
        }
    }
}
