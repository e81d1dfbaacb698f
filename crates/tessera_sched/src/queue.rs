//! Per-worker task queue.
//!
//! Entries live in a `BTreeMap` keyed by (rank, sequence). Head pushes take
//! the lowest rank with a decreasing sequence (most recent first), sorted
//! pushes rank by descending priority with an increasing sequence (stable),
//! and tail pushes take the highest rank.

use crate::task::SchedTask;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: i64,
    seq: i64,
}

const HEAD_RANK: i64 = i64::MIN;
const TAIL_RANK: i64 = i64::MAX;

/// Ordered tasks waiting for one worker
#[derive(Debug, Default)]
pub struct WorkerQueue {
    entries: BTreeMap<QueueKey, SchedTask>,
    next_head: i64,
    next_tail: i64,
}

impl WorkerQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail
    pub fn push_back(&mut self, task: SchedTask) {
        let key = QueueKey {
            rank: TAIL_RANK,
            seq: self.bump_tail(),
        };
        self.entries.insert(key, task);
    }

    /// Insert at the head; the most recent head push pops first
    pub fn push_front(&mut self, task: SchedTask) {
        self.next_head -= 1;
        let key = QueueKey {
            rank: HEAD_RANK,
            seq: self.next_head,
        };
        self.entries.insert(key, task);
    }

    /// Insert by descending priority, after existing tasks of equal priority
    pub fn push_sorted(&mut self, task: SchedTask) {
        let key = QueueKey {
            rank: -i64::from(task.priority),
            seq: self.bump_tail(),
        };
        self.entries.insert(key, task);
    }

    fn bump_tail(&mut self) -> i64 {
        let seq = self.next_tail;
        self.next_tail += 1;
        seq
    }

    /// Remove the head task
    pub fn pop_front(&mut self) -> Option<SchedTask> {
        self.entries.pop_first().map(|(_, task)| task)
    }

    /// Remove the task that stalls least
    ///
    /// Only tasks at or above the head's priority are candidates. Among
    /// them the first with the fewest non-ready buffers wins; the scan stops
    /// at the first fully ready one.
    pub fn pop_ready(&mut self, mut non_ready: impl FnMut(&SchedTask) -> usize) -> Option<SchedTask> {
        let head_priority = self.entries.values().next()?.priority;
        let mut best: Option<(QueueKey, usize)> = None;
        for (key, task) in &self.entries {
            if task.priority < head_priority {
                continue;
            }
            let count = non_ready(task);
            if best.is_none_or(|(_, c)| count < c) {
                best = Some((*key, count));
                if count == 0 {
                    break;
                }
            }
        }
        best.and_then(|(key, _)| self.entries.remove(&key))
    }

    /// Remove every task, head first
    pub fn pop_every(&mut self) -> Vec<SchedTask> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of queued tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued tasks, head first
    pub fn iter(&self) -> impl Iterator<Item = &SchedTask> {
        self.entries.values()
    }
}
