//! Bounded set of document ids written locally but not yet seen on the feed.

use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::warn;

/// Default number of tracked ids.
pub const MAX_PENDING_INSERTIONS: usize = 1000;

/// Provisional doc-id tracking. Once full, new ids are logged and dropped
/// rather than failing the caller.
pub struct PendingInsertions {
    ids: Mutex<HashSet<String>>,
    capacity: usize,
}

impl PendingInsertions {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_INSERTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    /// Track `doc_id`. Returns false if the set is full and the id was dropped.
    pub fn note(&self, doc_id: &str) -> bool {
        let mut ids = self.ids.lock();
        if ids.contains(doc_id) {
            return true;
        }
        if ids.len() >= self.capacity {
            warn!(doc_id, capacity = self.capacity, "pending insertion set full, not tracking");
            return false;
        }
        ids.insert(doc_id.to_string());
        true
    }

    /// Stop tracking `doc_id`. Returns true if it was tracked.
    pub fn check(&self, doc_id: &str) -> bool {
        self.ids.lock().remove(doc_id)
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.ids.lock().contains(doc_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingInsertions {
    fn default() -> Self {
        Self::new()
    }
}
