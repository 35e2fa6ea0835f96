//! Deadline-ordered callback queue.
//!
//! A small min-heap of `(deadline, id)` pairs with a side table of pending
//! callbacks. Cancellation removes the callback and leaves a stale heap
//! entry behind; stale entries are skipped when popped, keeping cancel
//! cheap without a heap rebuild.

use crate::types::Time;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;

/// A callback run when its deadline expires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Batch of expired callbacks collected under the queue lock.
pub(crate) type CallbackBatch = SmallVec<[TimerCallback; 4]>;

/// Handle identifying a registered timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueEntry {
    deadline: Time,
    id: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timer callbacks ordered by deadline.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<QueueEntry>,
    callbacks: BTreeMap<u64, TimerCallback>,
    next_id: u64,
}

impl TimerQueue {
    /// Creates a new empty queue.
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Returns the number of live (uncancelled, unfired) timers.
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns true if no live timers remain.
    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Registers a callback to run at the given deadline.
    pub(crate) fn register(&mut self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.insert(id, callback);
        self.heap.push(QueueEntry { deadline, id });
        TimerHandle { id }
    }

    /// Cancels a registered timer.
    ///
    /// Returns true if the timer was still pending. The heap entry stays
    /// behind and is discarded when it surfaces.
    pub(crate) fn cancel(&mut self, handle: &TimerHandle) -> bool {
        self.callbacks.remove(&handle.id).is_some()
    }

    /// Returns the earliest live deadline, discarding stale entries.
    pub(crate) fn next_deadline(&mut self) -> Option<Time> {
        while let Some(entry) = self.heap.peek() {
            if self.callbacks.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every callback whose deadline is `<= now`.
    pub(crate) fn collect_expired(&mut self, now: Time) -> CallbackBatch {
        let mut batch = CallbackBatch::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let id = entry.id;
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&id) {
                batch.push(callback);
            }
        }
        batch
    }

    /// Drops every pending timer without running it.
    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.callbacks.clear();
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.callbacks.len())
            .field("heap_entries", &self.heap.len())
            .finish()
    }
}
