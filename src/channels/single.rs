//! Bounded, ordered cache of recent entries for one channel.

use super::late::LateSequenceLog;
use super::query::QueryCoalescer;
use crate::config::ChannelCacheConfig;
use crate::context::Context;
use crate::error::Result;
use crate::stats::CacheCounters;
use crate::store::ChangeStore;
use crate::types::{ChannelId, LogEntry, Sequence};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

struct CacheState {
    /// Strictly ascending by sequence.
    logs: VecDeque<Arc<LogEntry>>,
    /// Doc id -> sequence of its entry in `logs`.
    doc_ids: HashMap<String, Sequence>,
    /// Lowest sequence the cache is complete from.
    valid_from: Sequence,
}

impl CacheState {
    fn position(&self, seq: Sequence) -> std::result::Result<usize, usize> {
        self.logs.binary_search_by_key(&seq, |e| e.sequence)
    }

    fn remove_seq(&mut self, seq: Sequence) -> Option<usize> {
        let idx = self.position(seq).ok()?;
        self.logs.remove(idx);
        Some(idx)
    }

    fn pop_front(&mut self) -> Option<Arc<LogEntry>> {
        let entry = self.logs.pop_front()?;
        if self.doc_ids.get(&entry.doc_id) == Some(&entry.sequence) {
            self.doc_ids.remove(&entry.doc_id);
        }
        self.valid_from = entry.sequence.next();
        Some(entry)
    }
}

/// Cache of one channel's recent changes.
///
/// Entries at or above `valid_from` are complete: any change in the channel
/// with a sequence in that range is either cached or superseded by a newer
/// revision of the same document. Older history comes from storage.
pub struct SingleChannelCache {
    channel: ChannelId,
    config: ChannelCacheConfig,
    state: RwLock<CacheState>,
    late_log: LateSequenceLog,
    queries: QueryCoalescer,
    counters: Arc<CacheCounters>,
}

impl SingleChannelCache {
    /// An empty cache, complete from `valid_from`.
    pub fn new(channel: ChannelId, valid_from: Sequence, config: ChannelCacheConfig) -> Self {
        Self::with_counters(channel, valid_from, config, Arc::new(CacheCounters::default()))
    }

    pub(crate) fn with_counters(
        channel: ChannelId,
        valid_from: Sequence,
        config: ChannelCacheConfig,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self {
            channel,
            config,
            state: RwLock::new(CacheState {
                logs: VecDeque::new(),
                doc_ids: HashMap::new(),
                valid_from,
            }),
            late_log: LateSequenceLog::new(),
            queries: QueryCoalescer::new(),
            counters,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Insert an entry in sequence order. Returns true if the entry is now
    /// cached.
    ///
    /// Entries below `valid_from`, below the current tail, or flagged as
    /// skipped are also recorded in the late log so listeners that already
    /// moved past their position still receive them. A revision older than
    /// the document's cached one is dropped.
    pub fn add_to_cache(&self, entry: Arc<LogEntry>) -> bool {
        let mut state = self.state.write();

        if let Some(existing) = state.doc_ids.get(&entry.doc_id).copied() {
            if existing > entry.sequence {
                trace!(
                    channel = %self.channel,
                    seq = entry.sequence.0,
                    newer = existing.0,
                    "dropping stale revision"
                );
                return false;
            }
        }

        if entry.sequence < state.valid_from {
            drop(state);
            trace!(channel = %self.channel, seq = entry.sequence.0, "entry below valid_from");
            self.late_log.add(entry);
            return false;
        }

        let tail = state.logs.back().map(|e| e.sequence);
        let late = match tail {
            Some(tail) if entry.sequence == tail => return false,
            Some(tail) if entry.sequence < tail => {
                let mut idx = match state.position(entry.sequence) {
                    Ok(_) => return false,
                    Err(idx) => idx,
                };
                let existing = state.doc_ids.get(&entry.doc_id).copied();
                if let Some(existing) = existing {
                    if let Some(removed) = state.remove_seq(existing) {
                        if removed < idx {
                            idx -= 1;
                        }
                    }
                }
                debug!(
                    channel = %self.channel,
                    seq = entry.sequence.0,
                    tail = tail.0,
                    "out-of-order entry, inserting"
                );
                state.logs.insert(idx, entry.clone());
                true
            }
            _ => {
                let existing = state.doc_ids.get(&entry.doc_id).copied();
                if let Some(existing) = existing {
                    state.remove_seq(existing);
                }
                state.logs.push_back(entry.clone());
                false
            }
        };
        state.doc_ids.insert(entry.doc_id.clone(), entry.sequence);
        self.prune_locked(&mut state);
        drop(state);

        if late || entry.skipped {
            self.late_log.add(entry);
        }
        true
    }

    fn prune_locked(&self, state: &mut CacheState) {
        let before = state.logs.len();
        if state.logs.len() > self.config.max_length {
            while state.logs.len() > self.config.min_length {
                state.pop_front();
            }
        }
        while state.logs.len() > self.config.min_length
            && state
                .logs
                .front()
                .map_or(false, |e| e.time_received.elapsed() > self.config.max_age)
        {
            state.pop_front();
        }
        let pruned = before - state.logs.len();
        if pruned > 0 {
            debug!(
                channel = %self.channel,
                pruned,
                valid_from = state.valid_from.0,
                "pruned channel cache"
            );
        }
    }

    /// Cached entries with sequence greater than `since`, and the sequence the
    /// cache is valid from. History below `valid_from` must come from storage.
    pub fn get_cached_changes(&self, since: Sequence) -> (Sequence, Vec<Arc<LogEntry>>) {
        let state = self.state.read();
        let start = state.logs.partition_point(|e| e.sequence <= since);
        (state.valid_from, state.logs.range(start..).cloned().collect())
    }

    /// Every change in the channel after `since`, querying `store` for the
    /// part of the range the cache does not cover.
    pub fn get_changes(
        &self,
        ctx: &Context,
        since: Sequence,
        store: &dyn ChangeStore,
    ) -> Result<Vec<Arc<LogEntry>>> {
        let (valid_from, cached) = self.get_cached_changes(since);
        let start = since.next();
        if start >= valid_from {
            CacheCounters::incr(&self.counters.cache_hits);
            return Ok(cached);
        }
        CacheCounters::incr(&self.counters.cache_misses);

        let end = Sequence(valid_from.0 - 1);
        let queried = self.queries.run(
            ctx,
            start,
            end,
            &self.counters.pending_query_waiters,
            || {
                CacheCounters::incr(&self.counters.channel_queries);
                debug!(channel = %self.channel, start = start.0, end = end.0, "querying storage");
                store.query_channel(&self.channel, start, end)
            },
        )?;
        self.prepend_changes(&queried, start, end);

        let cached_docs: HashSet<&str> = cached.iter().map(|e| e.doc_id.as_str()).collect();
        let mut result: Vec<Arc<LogEntry>> = queried
            .iter()
            .filter(|e| e.sequence < valid_from && !cached_docs.contains(e.doc_id.as_str()))
            .cloned()
            .collect();
        result.extend(cached);
        Ok(result)
    }

    /// Prepend entries queried for `start..=end` when the range ends right
    /// below `valid_from`, newest first while there is room. Lowers
    /// `valid_from` to cover what was added. Returns the number prepended.
    pub fn prepend_changes(&self, entries: &[Arc<LogEntry>], start: Sequence, end: Sequence) -> usize {
        let mut state = self.state.write();
        if state.valid_from != end.next() {
            return 0;
        }
        let room = self.config.max_length.saturating_sub(state.logs.len());
        if room == 0 {
            return 0;
        }

        let mut added = Vec::new();
        let mut complete = true;
        for entry in entries.iter().rev() {
            if entry.sequence < start || entry.sequence > end {
                continue;
            }
            if state.doc_ids.contains_key(&entry.doc_id) {
                continue;
            }
            if added.len() == room {
                complete = false;
                break;
            }
            added.push(entry.clone());
        }

        for entry in &added {
            state.doc_ids.insert(entry.doc_id.clone(), entry.sequence);
            state.logs.push_front(entry.clone());
        }
        state.valid_from = if complete {
            start
        } else {
            added.last().map_or(state.valid_from, |e| e.sequence)
        };
        added.len()
    }

    /// Register a late-sequence listener; returns its starting marker.
    pub fn register_late_client(&self) -> Sequence {
        self.late_log.register_client()
    }

    /// Late entries after `last_seq` and the listener's new marker.
    pub fn get_late_since(&self, last_seq: Sequence) -> Result<(Vec<Arc<LogEntry>>, Sequence)> {
        self.late_log.get_since(last_seq)
    }

    pub fn release_late_client(&self, seq: Sequence) -> bool {
        self.late_log.release_client(seq)
    }

    pub fn late_log(&self) -> &LateSequenceLog {
        &self.late_log
    }

    pub fn len(&self) -> usize {
        self.state.read().logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn valid_from(&self) -> Sequence {
        self.state.read().valid_from
    }

    /// Sequence of the newest cached entry.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.state.read().logs.back().map(|e| e.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChangeStore;
    use crate::types::Timestamp;
    use std::time::Duration;

    fn config(min: usize, max: usize) -> ChannelCacheConfig {
        ChannelCacheConfig {
            min_length: min,
            max_length: max,
            ..Default::default()
        }
    }

    fn cache(min: usize, max: usize) -> SingleChannelCache {
        SingleChannelCache::new(ChannelId::new("ABC", 0), Sequence(1), config(min, max))
    }

    fn entry(seq: u64, doc: &str) -> Arc<LogEntry> {
        Arc::new(LogEntry::document(Sequence(seq), doc, "1-a", &["ABC"], 0))
    }

    fn seqs(entries: &[Arc<LogEntry>]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence.0).collect()
    }

    #[test]
    fn test_append_and_read_since() {
        let cache = cache(5, 10);
        for seq in 1..=4 {
            assert!(cache.add_to_cache(entry(seq, &format!("doc{}", seq))));
        }
        let (valid_from, changes) = cache.get_cached_changes(Sequence(2));
        assert_eq!(valid_from, Sequence(1));
        assert_eq!(seqs(&changes), vec![3, 4]);
    }

    #[test]
    fn test_out_of_order_insert() {
        let cache = cache(5, 10);
        let marker = cache.register_late_client();
        for seq in [1, 2, 5, 6] {
            cache.add_to_cache(entry(seq, &format!("doc{}", seq)));
        }
        cache.add_to_cache(entry(4, "doc4"));
        cache.add_to_cache(entry(3, "doc3"));

        let (_, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![1, 2, 3, 4, 5, 6]);
        // Both inserts went to the late log too
        let (late, last) = cache.get_late_since(marker).unwrap();
        assert_eq!(seqs(&late), vec![4, 3]);
        assert_eq!(last, Sequence(3));
    }

    #[test]
    fn test_duplicate_ignored() {
        let cache = cache(5, 10);
        cache.add_to_cache(entry(1, "a"));
        cache.add_to_cache(entry(3, "b"));
        assert!(!cache.add_to_cache(entry(3, "b")));
        assert!(!cache.add_to_cache(entry(1, "a")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_one_entry_per_doc() {
        let cache = cache(5, 10);
        cache.add_to_cache(entry(1, "doc1"));
        cache.add_to_cache(entry(2, "doc2"));
        cache.add_to_cache(entry(3, "doc1"));

        let (_, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![2, 3]);

        // A late, older revision never displaces the newer one
        cache.add_to_cache(entry(5, "doc3"));
        assert!(!cache.add_to_cache(entry(1, "doc1")));
        let (_, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![2, 3, 5]);
    }

    #[test]
    fn test_stale_revision_not_sent_to_late_log() {
        let cache = cache(5, 10);
        let marker = cache.register_late_client();
        cache.add_to_cache(entry(2, "doc2"));
        cache.add_to_cache(entry(4, "doc1"));

        assert!(!cache.add_to_cache(entry(3, "doc1")));
        let (late, _) = cache.get_late_since(marker).unwrap();
        assert!(late.is_empty());
        let (_, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![2, 4]);
    }

    #[test]
    fn test_prune_hysteresis() {
        let cache = cache(5, 10);
        for seq in 1..=10 {
            cache.add_to_cache(entry(seq, &format!("doc{}", seq)));
        }
        assert_eq!(cache.len(), 10);

        cache.add_to_cache(entry(11, "doc11"));
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.valid_from(), Sequence(7));

        let (valid_from, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(valid_from, Sequence(7));
        assert_eq!(seqs(&changes), vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_age_prune_keeps_min_length() {
        let cache = SingleChannelCache::new(
            ChannelId::new("ABC", 0),
            Sequence(1),
            ChannelCacheConfig {
                min_length: 2,
                max_length: 10,
                max_age: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let old = Timestamp::ago(Duration::from_secs(120));
        for seq in 1..=3 {
            let e = LogEntry::document(Sequence(seq), format!("old{}", seq), "1-a", &["ABC"], 0)
                .with_time_received(old);
            cache.add_to_cache(Arc::new(e));
        }
        assert_eq!(cache.len(), 2);
        cache.add_to_cache(entry(4, "fresh"));
        // Old entries are trimmed down to min_length, fresh ones stay
        let (valid_from, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![3, 4]);
        assert_eq!(valid_from, Sequence(3));
    }

    #[test]
    fn test_below_valid_from_goes_to_late_log() {
        let cache = SingleChannelCache::new(ChannelId::new("ABC", 0), Sequence(10), config(5, 10));
        let marker = cache.register_late_client();
        assert!(!cache.add_to_cache(entry(4, "doc4")));
        assert!(cache.is_empty());

        let (late, _) = cache.get_late_since(marker).unwrap();
        assert_eq!(seqs(&late), vec![4]);
    }

    #[test]
    fn test_get_changes_queries_below_valid_from() {
        let store = MemoryChangeStore::new();
        for seq in 1..=5 {
            store.put(LogEntry::document(Sequence(seq), format!("doc{}", seq), "1-a", &["ABC"], 0));
        }
        let cache = SingleChannelCache::new(ChannelId::new("ABC", 0), Sequence(6), config(5, 10));
        cache.add_to_cache(entry(6, "doc6"));
        cache.add_to_cache(entry(7, "doc7"));

        let ctx = Context::new();
        let changes = cache.get_changes(&ctx, Sequence(2), &store).unwrap();
        assert_eq!(seqs(&changes), vec![3, 4, 5, 6, 7]);
        assert_eq!(store.channel_query_count(), 1);

        // Query results were prepended; the second read is a cache hit
        assert_eq!(cache.valid_from(), Sequence(3));
        let changes = cache.get_changes(&ctx, Sequence(2), &store).unwrap();
        assert_eq!(seqs(&changes), vec![3, 4, 5, 6, 7]);
        assert_eq!(store.channel_query_count(), 1);
    }

    #[test]
    fn test_prepend_respects_room() {
        let cache = SingleChannelCache::new(ChannelId::new("ABC", 0), Sequence(10), config(2, 4));
        cache.add_to_cache(entry(10, "doc10"));
        cache.add_to_cache(entry(11, "doc11"));

        let queried: Vec<Arc<LogEntry>> = (5..=9).map(|s| entry(s, &format!("doc{}", s))).collect();
        assert_eq!(cache.prepend_changes(&queried, Sequence(5), Sequence(9)), 2);
        assert_eq!(cache.valid_from(), Sequence(8));
        let (_, changes) = cache.get_cached_changes(Sequence(0));
        assert_eq!(seqs(&changes), vec![8, 9, 10, 11]);

        // Range no longer adjacent to valid_from
        assert_eq!(cache.prepend_changes(&queried, Sequence(1), Sequence(4)), 0);
    }
}
