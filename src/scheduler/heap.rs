//! Timer heap for deadline management.
//!
//! A min-heap of `(deadline, task)` entries. Cancelled tasks are not removed
//! from the heap on cancel; the driver drops their entries when they surface,
//! and the scheduler compacts the heap once stale entries dominate.

use super::task::TaskId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    task: TaskId,
    /// Insertion order; breaks ties between equal deadlines.
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An entry whose deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Expired {
    pub(crate) task: TaskId,
    pub(crate) deadline: Instant,
}

/// A min-heap of timers ordered by deadline.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn insert(&mut self, task: TaskId, deadline: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            task,
            generation,
        });
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops all timers that have expired (deadline <= now), earliest first.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                expired.push(Expired {
                    task: entry.task,
                    deadline: entry.deadline,
                });
            }
        }
        expired
    }

    /// Keeps only the entries whose task satisfies `keep`.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(TaskId) -> bool) {
        self.heap.retain(|entry| keep(entry.task));
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
