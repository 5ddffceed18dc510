//! Buffer for entries that arrived ahead of their predecessors.

use crate::types::{LogEntry, Sequence};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

struct BySequence(Arc<LogEntry>);

impl PartialEq for BySequence {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}

impl Eq for BySequence {}

impl PartialOrd for BySequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.sequence.cmp(&other.0.sequence)
    }
}

/// Min-heap of buffered entries keyed by sequence.
#[derive(Default)]
pub(crate) struct PendingBuffer {
    heap: BinaryHeap<Reverse<BySequence>>,
    members: HashSet<Sequence>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an entry. Returns false if its sequence is already buffered.
    pub fn push(&mut self, entry: Arc<LogEntry>) -> bool {
        if !self.members.insert(entry.sequence) {
            return false;
        }
        self.heap.push(Reverse(BySequence(entry)));
        true
    }

    /// Lowest buffered entry.
    pub fn peek(&self) -> Option<&Arc<LogEntry>> {
        self.heap.peek().map(|Reverse(BySequence(entry))| entry)
    }

    pub fn pop(&mut self) -> Option<Arc<LogEntry>> {
        let Reverse(BySequence(entry)) = self.heap.pop()?;
        self.members.remove(&entry.sequence);
        Some(entry)
    }

    pub fn contains(&self, seq: Sequence) -> bool {
        self.members.contains(&seq)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// How long the lowest buffered entry has been waiting.
    pub fn head_wait(&self) -> Option<Duration> {
        self.peek().map(|entry| entry.time_received.elapsed())
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }
}
