//! Priority-ordered runnable set.
//!
//! Holds the tasks that are QUEUED and unblocked, ordered by priority
//! (`P0` first) and then submission time.  All operations take one
//! mutex and complete without awaiting; an empty dequeue returns `None`
//! rather than blocking.
//!
//! `remove` rebuilds the heap without the victim — O(n), which the
//! contract allows, and it keeps every surviving entry's metadata
//! authoritative (no tombstones to race a re-enqueue of the same id).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use crate::event::TaskPriority;

/// One queued task reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: String,
    pub priority: TaskPriority,
    /// Submission time, epoch milliseconds.
    pub created_at: i64,
}

/// Heap entry; `seq` breaks ties between equal timestamps so ordering
/// stays stable under bursts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    task: QueuedTask,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum, so "greater" means "dispatched
        // sooner": lower priority value, then earlier submission, then
        // lower sequence number.
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    members: HashSet<String>,
    next_seq: u64,
}

/// Mutex-serialized priority queue of runnable tasks.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task.  Re-enqueueing an id already present is a no-op.
    pub fn enqueue(&self, task: QueuedTask) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.members.insert(task.task_id.clone()) {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry { task, seq });
    }

    /// Remove and return the head, or `None` when empty.
    pub fn dequeue(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.heap.pop()?;
        state.members.remove(&entry.task.task_id);
        Some(entry.task)
    }

    /// Return the head without removing it.
    pub fn peek(&self) -> Option<QueuedTask> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heap.peek().map(|entry| entry.task.clone())
    }

    /// Remove a specific id.  Returns whether it was present.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.members.remove(task_id) {
            return false;
        }
        let survivors: Vec<Entry> = std::mem::take(&mut state.heap)
            .into_iter()
            .filter(|entry| entry.task.task_id != task_id)
            .collect();
        state.heap = BinaryHeap::from(survivors);
        true
    }

    pub fn contains(&self, task_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.members.contains(task_id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heap.clear();
        state.members.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: TaskPriority, created_at: i64) -> QueuedTask {
        QueuedTask {
            task_id: id.into(),
            priority,
            created_at,
        }
    }

    #[test]
    fn empty_dequeue_returns_none() {
        let queue = PriorityQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.peek().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn priority_beats_submission_order() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("low", TaskPriority::P2, 1));
        queue.enqueue(task("mid", TaskPriority::P1, 2));
        queue.enqueue(task("high", TaskPriority::P0, 3));

        assert_eq!(queue.dequeue().unwrap().task_id, "high");
        assert_eq!(queue.dequeue().unwrap().task_id, "mid");
        assert_eq!(queue.dequeue().unwrap().task_id, "low");
    }

    #[test]
    fn fifo_within_a_priority() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("a", TaskPriority::P1, 10));
        queue.enqueue(task("b", TaskPriority::P1, 20));
        queue.enqueue(task("c", TaskPriority::P1, 30));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_timestamps_preserve_insertion_order() {
        let queue = PriorityQueue::new();
        for id in ["x", "y", "z"] {
            queue.enqueue(task(id, TaskPriority::P1, 100));
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn remove_purges_the_entry() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("a", TaskPriority::P0, 1));
        queue.enqueue(task("b", TaskPriority::P1, 2));

        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert!(!queue.contains("a"));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.peek().unwrap().task_id, "b");
        assert_eq!(queue.dequeue().unwrap().task_id, "b");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn re_enqueue_after_remove_uses_fresh_metadata() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("a", TaskPriority::P2, 1));
        queue.enqueue(task("b", TaskPriority::P1, 2));

        assert!(queue.remove("a"));
        queue.enqueue(task("a", TaskPriority::P0, 3));

        // The re-enqueued entry's new priority wins.
        assert_eq!(queue.dequeue().unwrap().task_id, "a");
        assert_eq!(queue.dequeue().unwrap().task_id, "b");
    }

    #[test]
    fn duplicate_enqueue_is_a_noop() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("a", TaskPriority::P1, 1));
        queue.enqueue(task("a", TaskPriority::P0, 2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().priority, TaskPriority::P1);
    }

    #[test]
    fn clear_empties_everything() {
        let queue = PriorityQueue::new();
        queue.enqueue(task("a", TaskPriority::P1, 1));
        queue.enqueue(task("b", TaskPriority::P2, 2));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }
}
