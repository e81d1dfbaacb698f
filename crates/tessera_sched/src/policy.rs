//! Scheduling policies of the deque-model family.

use crate::error::SchedError;
use serde::{Deserialize, Serialize};

/// Inclusive range of accepted task priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    /// Lowest accepted priority
    pub min: i32,
    /// Highest accepted priority
    pub max: i32,
}

impl PriorityRange {
    /// Two levels: normal (0) and urgent (1)
    pub const DEFAULT: Self = Self { min: 0, max: 1 };

    /// Every `i32`
    pub const FULL: Self = Self {
        min: i32::MIN,
        max: i32::MAX,
    };

    /// Whether `priority` lies inside the range
    #[must_use]
    pub const fn contains(&self, priority: i32) -> bool {
        priority >= self.min && priority <= self.max
    }

    /// Nearest accepted priority
    #[must_use]
    pub fn clamp(&self, priority: i32) -> i32 {
        priority.clamp(self.min, self.max)
    }
}

/// Placement and dequeue strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// Minimum expected completion, ignoring data
    Dm,
    /// Adds the transfer penalty to the completion estimate
    #[default]
    Dmda,
    /// As `Dmda`, dequeuing tasks whose inputs are resident first
    Dmdar,
    /// As `Dmdar`, keeping queues sorted by priority
    Dmdas,
}

impl SchedPolicy {
    /// Every policy
    pub const ALL: [SchedPolicy; 4] = [Self::Dm, Self::Dmda, Self::Dmdar, Self::Dmdas];

    /// Lower-case name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Dmda => "dmda",
            Self::Dmdar => "dmdar",
            Self::Dmdas => "dmdas",
        }
    }

    /// One-line description
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Dm => "performance model",
            Self::Dmda => "data-aware performance model",
            Self::Dmdar => "data-aware performance model (ready)",
            Self::Dmdas => "data-aware performance model (sorted)",
        }
    }

    /// Whether the transfer penalty enters the fitness
    #[must_use]
    pub const fn uses_data_penalty(self) -> bool {
        !matches!(self, Self::Dm)
    }

    /// Whether workers dequeue by input readiness
    #[must_use]
    pub const fn pops_ready(self) -> bool {
        matches!(self, Self::Dmdar | Self::Dmdas)
    }

    /// Whether queues are kept sorted by priority
    #[must_use]
    pub const fn sorted(self) -> bool {
        matches!(self, Self::Dmdas)
    }

    /// Priorities the policy accepts
    #[must_use]
    pub const fn priority_range(self) -> PriorityRange {
        if self.sorted() {
            PriorityRange::FULL
        } else {
            PriorityRange::DEFAULT
        }
    }
}

impl std::fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SchedPolicy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.name() == lower)
            .ok_or(SchedError::UnknownPolicy {
                name: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for policy in SchedPolicy::ALL {
            assert_eq!(policy.name().parse::<SchedPolicy>().unwrap(), policy);
        }
        assert_eq!(" DMDAS ".parse::<SchedPolicy>().unwrap(), SchedPolicy::Dmdas);
        assert!(matches!(
            "eager".parse::<SchedPolicy>(),
            Err(SchedError::UnknownPolicy { .. })
        ));
    }

    #[test]
    fn test_policy_traits() {
        assert!(!SchedPolicy::Dm.uses_data_penalty());
        assert!(SchedPolicy::Dmda.uses_data_penalty());
        assert!(!SchedPolicy::Dmda.pops_ready());
        assert!(SchedPolicy::Dmdar.pops_ready());
        assert!(SchedPolicy::Dmdas.sorted());
        assert_eq!(SchedPolicy::default(), SchedPolicy::Dmda);
    }

    #[test]
    fn test_priority_range() {
        let range = SchedPolicy::Dmda.priority_range();
        assert_eq!(range.clamp(7), 1);
        assert_eq!(range.clamp(-3), 0);
        assert!(range.contains(1));
        assert!(SchedPolicy::Dmdas.priority_range().contains(-1_000));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&SchedPolicy::Dmdar).unwrap();
        assert_eq!(json, "\"dmdar\"");
    }
}
