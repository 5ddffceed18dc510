//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the cache components.
#[derive(Default)]
pub(crate) struct CacheCounters {
    pub processed: AtomicU64,
    pub late: AtomicU64,
    pub duplicate: AtomicU64,
    pub skipped: AtomicU64,
    pub abandoned: AtomicU64,
    pub recovered: AtomicU64,
    pub malformed: AtomicU64,
    pub max_pending: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub channel_queries: AtomicU64,
    pub pending_query_waiters: AtomicU64,
    pub channels_evicted: AtomicU64,
}

impl CacheCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_pending(&self, len: usize) {
        self.max_pending.fetch_max(len as u64, Ordering::Relaxed);
    }
}

/// Point-in-time cache statistics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    /// Entries dispatched to the channel caches.
    pub processed: u64,
    /// Previously skipped sequences that arrived.
    pub late_sequences: u64,
    /// Redelivered sequences that were discarded.
    pub duplicate_sequences: u64,
    /// Sequences pushed onto the skipped list.
    pub skipped_sequences: u64,
    /// Skipped sequences given up on after a storage lookup.
    pub abandoned_sequences: u64,
    /// Skipped sequences found by a storage lookup.
    pub recovered_sequences: u64,
    pub malformed_events: u64,
    pub max_pending: u64,
    pub channel_cache_hits: u64,
    pub channel_cache_misses: u64,
    /// Fallback storage queries issued by channel caches.
    pub channel_queries: u64,
    /// Callers currently waiting on another caller's query.
    pub pending_query_waiters: u64,
    pub channels_evicted: u64,
    pub skipped_len: usize,
    pub pending_len: usize,
    pub resident_channels: usize,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CacheStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            processed: get(&self.processed),
            late_sequences: get(&self.late),
            duplicate_sequences: get(&self.duplicate),
            skipped_sequences: get(&self.skipped),
            abandoned_sequences: get(&self.abandoned),
            recovered_sequences: get(&self.recovered),
            malformed_events: get(&self.malformed),
            max_pending: get(&self.max_pending),
            channel_cache_hits: get(&self.cache_hits),
            channel_cache_misses: get(&self.cache_misses),
            channel_queries: get(&self.channel_queries),
            pending_query_waiters: get(&self.pending_query_waiters),
            channels_evicted: get(&self.channels_evicted),
            ..Default::default()
        }
    }
}
