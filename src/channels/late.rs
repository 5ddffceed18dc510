//! Side log of late-arriving sequences for listeners that have moved past them.
//!
//! Entries are kept in arrival order. Each listener holds a reference on the
//! entry it last read; the log is purged from the front only up to the first
//! entry still referenced.

use crate::error::{CacheError, Result};
use crate::types::{LogEntry, Sequence};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct LateLogEntry {
    seq: Sequence,
    /// `None` for the initial placeholder.
    entry: Option<Arc<LogEntry>>,
    listeners: AtomicU64,
}

impl LateLogEntry {
    fn placeholder() -> Self {
        Self {
            seq: Sequence::ZERO,
            entry: None,
            listeners: AtomicU64::new(0),
        }
    }

    fn add_listener(&self) {
        self.listeners.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_listener(&self) {
        let _ = self
            .listeners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn listener_count(&self) -> u64 {
        self.listeners.load(Ordering::SeqCst)
    }
}

/// Per-channel backfill log.
pub struct LateSequenceLog {
    entries: RwLock<VecDeque<LateLogEntry>>,
}

impl LateSequenceLog {
    pub fn new() -> Self {
        let mut entries = VecDeque::new();
        entries.push_back(LateLogEntry::placeholder());
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Register a listener at the current end of the log. The returned
    /// sequence is the listener's marker for `get_since`.
    pub fn register_client(&self) -> Sequence {
        let mut entries = self.entries.write();
        if entries.is_empty() {
            entries.push_back(LateLogEntry::placeholder());
        }
        let last = entries.back().map(|e| {
            e.add_listener();
            e.seq
        });
        last.unwrap_or(Sequence::ZERO)
    }

    /// Entries that arrived after the listener's marker. Moves the listener's
    /// reference to the end of the log and returns its new marker.
    pub fn get_since(&self, last_seq: Sequence) -> Result<(Vec<Arc<LogEntry>>, Sequence)> {
        let entries = self.entries.read();
        let start = entries
            .iter()
            .position(|e| e.seq == last_seq)
            .ok_or(CacheError::LateMarkerNotFound(last_seq))?;

        entries[start].remove_listener();
        let last = match entries.back() {
            Some(last) => last,
            None => return Err(CacheError::LateMarkerNotFound(last_seq)),
        };
        last.add_listener();

        let found = entries
            .iter()
            .skip(start + 1)
            .filter_map(|e| e.entry.clone())
            .collect();
        Ok((found, last.seq))
    }

    /// Drop a listener's reference. Returns false if the marker is unknown.
    pub fn release_client(&self, seq: Sequence) -> bool {
        let entries = self.entries.read();
        match entries.iter().find(|e| e.seq == seq) {
            Some(entry) => {
                entry.remove_listener();
                true
            }
            None => false,
        }
    }

    /// Append a late entry, then purge unreferenced entries from the front.
    pub fn add(&self, entry: Arc<LogEntry>) {
        let mut entries = self.entries.write();
        entries.push_back(LateLogEntry {
            seq: entry.sequence,
            entry: Some(entry),
            listeners: AtomicU64::new(0),
        });
        Self::purge_locked(&mut entries);
    }

    /// Remove the unreferenced prefix of the log. The last entry is always
    /// kept as the registration point for new listeners.
    pub fn purge(&self) {
        Self::purge_locked(&mut self.entries.write());
    }

    fn purge_locked(entries: &mut VecDeque<LateLogEntry>) {
        while entries.len() > 1 && entries.front().map_or(false, |e| e.listener_count() == 0) {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the most recent late entry (zero if none).
    pub fn last_sequence(&self) -> Sequence {
        self.entries.read().back().map_or(Sequence::ZERO, |e| e.seq)
    }

    /// (sequence, listener count) for every entry, front to back.
    pub fn snapshot(&self) -> Vec<(Sequence, u64)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.seq, e.listener_count()))
            .collect()
    }
}

impl Default for LateSequenceLog {
    fn default() -> Self {
        Self::new()
    }
}
