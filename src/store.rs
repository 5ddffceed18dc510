//! Storage collaborator consulted when the in-memory caches cannot answer.

use crate::error::Result;
use crate::types::{ChannelId, EntryKind, LogEntry, Sequence};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Queries the cache issues against document storage.
pub trait ChangeStore: Send + Sync {
    /// Current entries in `channel` with `start <= sequence <= end`, ascending.
    fn query_channel(&self, channel: &ChannelId, start: Sequence, end: Sequence)
        -> Result<Vec<LogEntry>>;

    /// Entries whose current sequence is one of `sequences`, in any collection.
    fn query_sequences(&self, sequences: &[Sequence]) -> Result<Vec<LogEntry>>;
}

/// In-memory store holding the current revision of each document.
pub struct MemoryChangeStore {
    entries: RwLock<BTreeMap<Sequence, LogEntry>>,
    /// (collection, doc id) -> current sequence.
    docs: RwLock<HashMap<(u32, String), Sequence>>,
    channel_queries: AtomicU64,
    sequence_queries: AtomicU64,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            docs: RwLock::new(HashMap::new()),
            channel_queries: AtomicU64::new(0),
            sequence_queries: AtomicU64::new(0),
        }
    }

    /// Store an entry, replacing the document's previous revision.
    pub fn put(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        if entry.kind == EntryKind::Document {
            let key = (entry.collection_id, entry.doc_id.clone());
            if let Some(prev) = self.docs.write().insert(key, entry.sequence) {
                if prev < entry.sequence {
                    entries.remove(&prev);
                }
            }
        }
        entries.insert(entry.sequence, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `query_channel` calls served.
    pub fn channel_query_count(&self) -> u64 {
        self.channel_queries.load(Ordering::SeqCst)
    }

    /// Number of `query_sequences` calls served.
    pub fn sequence_query_count(&self) -> u64 {
        self.sequence_queries.load(Ordering::SeqCst)
    }
}

impl Default for MemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeStore for MemoryChangeStore {
    fn query_channel(
        &self,
        channel: &ChannelId,
        start: Sequence,
        end: Sequence,
    ) -> Result<Vec<LogEntry>> {
        self.channel_queries.fetch_add(1, Ordering::SeqCst);
        if start > end {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        Ok(entries
            .range(start..=end)
            .map(|(_, entry)| entry)
            .filter(|entry| entry.kind == EntryKind::Document)
            .filter(|entry| entry.collection_id == channel.collection_id)
            .filter(|entry| channel.is_star() || entry.active_channels().any(|c| c == channel.name))
            .cloned()
            .collect())
    }

    fn query_sequences(&self, sequences: &[Sequence]) -> Result<Vec<LogEntry>> {
        self.sequence_queries.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.read();
        Ok(sequences
            .iter()
            .filter_map(|seq| entries.get(seq).cloned())
            .collect())
    }
}
