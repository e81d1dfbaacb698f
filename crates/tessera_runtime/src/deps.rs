//! Task dependency tracking.
//!
//! Tasks enter with the set of tasks they must follow (explicit ones plus
//! those derived from data accesses) and become ready once every one of
//! them has completed. Completed ids are forgotten once nothing can refer
//! to them any more; an unknown id below the high-water mark is taken as
//! completed.

use crate::error::{RuntimeError, RuntimeResult};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use tessera_core::TaskId;

/// Dependency graph of tasks not yet completed
#[derive(Debug, Default)]
pub struct DependencyTracker {
    /// Task -> tasks it still waits for
    dependencies: IndexMap<TaskId, IndexSet<TaskId>>,
    /// Task -> tasks waiting for it
    dependents: IndexMap<TaskId, IndexSet<TaskId>>,
    /// Tasks released but not completed
    running: BTreeSet<TaskId>,
    /// Highest id ever added
    high_water: Option<TaskId>,
    completed: u64,
}

impl DependencyTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_known(&self, task: TaskId) -> bool {
        self.dependencies.contains_key(&task) || self.running.contains(&task)
    }

    /// Add a task; returns whether it is ready right away
    ///
    /// Dependencies on tasks that already completed are dropped.
    ///
    /// # Errors
    ///
    /// Returns `DependencyCycle` if the task depends on itself and
    /// `UnknownTask` for ids never added
    pub fn add_task(&mut self, task: TaskId, deps: IndexSet<TaskId>) -> RuntimeResult<bool> {
        if deps.contains(&task) {
            return Err(RuntimeError::DependencyCycle(task));
        }
        if let Some(dep) = deps
            .iter()
            .find(|d| self.high_water.is_none_or(|hw| d.as_u64() > hw.as_u64()))
        {
            return Err(RuntimeError::UnknownTask(*dep));
        }

        let pending: IndexSet<TaskId> = deps.into_iter().filter(|d| self.is_known(*d)).collect();
        for dep in &pending {
            self.dependents.entry(*dep).or_default().insert(task);
        }
        self.high_water = Some(self.high_water.map_or(task, |hw| hw.max(task)));

        let ready = pending.is_empty();
        if ready {
            self.running.insert(task);
        } else {
            self.dependencies.insert(task, pending);
        }
        Ok(ready)
    }

    /// Mark a released task complete; returns the tasks it made ready
    ///
    /// # Panics
    ///
    /// Panics if the task was not released
    pub fn mark_complete(&mut self, task: TaskId) -> Vec<TaskId> {
        assert!(self.running.remove(&task), "{task} completed without being released");
        self.completed += 1;

        let mut ready = Vec::new();
        for dependent in self.dependents.swap_remove(&task).unwrap_or_default() {
            let Some(deps) = self.dependencies.get_mut(&dependent) else {
                continue;
            };
            deps.swap_remove(&task);
            if deps.is_empty() {
                self.dependencies.swap_remove(&dependent);
                self.running.insert(dependent);
                ready.push(dependent);
            }
        }
        ready
    }

    /// Tasks transitively waiting for `task`
    #[must_use]
    pub fn dependents_of(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen = IndexSet::new();
        let mut stack = vec![task];
        while let Some(t) = stack.pop() {
            for d in self.dependents.get(&t).into_iter().flatten() {
                if seen.insert(*d) {
                    stack.push(*d);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Whether `task` has been released and not completed
    #[must_use]
    pub fn is_released(&self, task: TaskId) -> bool {
        self.running.contains(&task)
    }

    /// Tasks still waiting for dependencies
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Tasks released and not completed
    #[must_use]
    pub fn released_count(&self) -> usize {
        self.running.len()
    }

    /// Tasks completed so far
    #[must_use]
    pub const fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Whether every added task has completed
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.dependencies.is_empty() && self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(n: u64) -> TaskId {
        TaskId::from_raw(n)
    }

    fn deps(ids: &[u64]) -> IndexSet<TaskId> {
        ids.iter().map(|n| t(*n)).collect()
    }

    #[test]
    fn test_independent_task_is_ready() {
        let mut tracker = DependencyTracker::new();
        assert!(tracker.add_task(t(0), IndexSet::new()).unwrap());
        assert!(tracker.is_released(t(0)));
        assert!(tracker.mark_complete(t(0)).is_empty());
        assert!(tracker.is_idle());
        assert_eq!(tracker.completed_count(), 1);
    }

    #[test]
    fn test_chain_releases_in_order() {
        let mut tracker = DependencyTracker::new();
        tracker.add_task(t(0), IndexSet::new()).unwrap();
        assert!(!tracker.add_task(t(1), deps(&[0])).unwrap());
        assert!(!tracker.add_task(t(2), deps(&[0, 1])).unwrap());
        assert_eq!(tracker.blocked_count(), 2);

        assert_eq!(tracker.mark_complete(t(0)), vec![t(1)]);
        assert_eq!(tracker.mark_complete(t(1)), vec![t(2)]);
        assert_eq!(tracker.mark_complete(t(2)), Vec::<TaskId>::new());
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_completed_dependencies_are_dropped() {
        let mut tracker = DependencyTracker::new();
        tracker.add_task(t(0), IndexSet::new()).unwrap();
        tracker.mark_complete(t(0));
        assert!(tracker.add_task(t(1), deps(&[0])).unwrap());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut tracker = DependencyTracker::new();
        assert!(matches!(
            tracker.add_task(t(3), deps(&[3])),
            Err(RuntimeError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_future_dependency_is_unknown() {
        let mut tracker = DependencyTracker::new();
        tracker.add_task(t(0), IndexSet::new()).unwrap();
        assert!(matches!(
            tracker.add_task(t(1), deps(&[9])),
            Err(RuntimeError::UnknownTask(id)) if id == t(9)
        ));
    }

    #[test]
    fn test_dependents_are_transitive() {
        let mut tracker = DependencyTracker::new();
        tracker.add_task(t(0), IndexSet::new()).unwrap();
        tracker.add_task(t(1), deps(&[0])).unwrap();
        tracker.add_task(t(2), deps(&[1])).unwrap();
        tracker.add_task(t(3), IndexSet::new()).unwrap();
        let mut downstream = tracker.dependents_of(t(0));
        downstream.sort();
        assert_eq!(downstream, vec![t(1), t(2)]);
    }

    proptest::proptest! {
        #[test]
        fn test_every_task_eventually_released(edges in proptest::collection::vec(proptest::collection::vec(0u64..64, 0..4), 1..40)) {
            let mut tracker = DependencyTracker::new();
            let mut ready = Vec::new();
            for (i, preds) in edges.iter().enumerate() {
                let i = i as u64;
                let preds: IndexSet<TaskId> = preds.iter().filter(|p| **p < i).map(|p| t(*p)).collect();
                if tracker.add_task(t(i), preds).unwrap() {
                    ready.push(t(i));
                }
            }
            let mut done = 0;
            while let Some(task) = ready.pop() {
                ready.extend(tracker.mark_complete(task));
                done += 1;
            }
            prop_assert_eq!(done, edges.len());
            prop_assert!(tracker.is_idle());
        }
    }
}
