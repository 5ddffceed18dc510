//! Registry of per-channel caches, bounded in count.

use super::single::SingleChannelCache;
use crate::config::ChannelCacheConfig;
use crate::context::Context;
use crate::error::Result;
use crate::stats::CacheCounters;
use crate::store::ChangeStore;
use crate::types::{ChannelId, ChannelSet, LogEntry, Sequence};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Lazily populated set of channel caches.
///
/// Holds at most `max_num_channels` caches. Reads promote a cache; feed
/// dispatch does not, so the least recently read cache is evicted first.
pub struct ChannelCache {
    config: ChannelCacheConfig,
    caches: Mutex<LruCache<ChannelId, Arc<SingleChannelCache>>>,
    /// Next sequence the ingestion side will dispatch. New caches are valid
    /// from here.
    cursor: Arc<AtomicU64>,
    counters: Arc<CacheCounters>,
}

impl ChannelCache {
    /// A registry whose caches start valid from sequence 1.
    pub fn new(config: ChannelCacheConfig) -> Self {
        Self::with_shared(
            config,
            Arc::new(AtomicU64::new(1)),
            Arc::new(CacheCounters::default()),
        )
    }

    pub(crate) fn with_shared(
        config: ChannelCacheConfig,
        cursor: Arc<AtomicU64>,
        counters: Arc<CacheCounters>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_num_channels).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            caches: Mutex::new(LruCache::new(capacity)),
            cursor,
            counters,
        }
    }

    /// Resident cache for `channel`, if any.
    pub fn get(&self, channel: &ChannelId) -> Option<Arc<SingleChannelCache>> {
        self.caches.lock().get(channel).cloned()
    }

    /// Resident cache for `channel`, created if absent. Creating a cache may
    /// evict the least recently read one.
    pub fn get_or_create(&self, channel: &ChannelId) -> Arc<SingleChannelCache> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(channel) {
            return cache.clone();
        }

        let valid_from = Sequence(self.cursor.load(Ordering::SeqCst));
        let cache = Arc::new(SingleChannelCache::with_counters(
            channel.clone(),
            valid_from,
            self.config.clone(),
            self.counters.clone(),
        ));
        if let Some((victim, _)) = caches.push(channel.clone(), cache.clone()) {
            CacheCounters::incr(&self.counters.channels_evicted);
            info!(channel = %victim, "evicted channel cache");
        }
        debug!(channel = %channel, valid_from = valid_from.0, "created channel cache");
        cache
    }

    /// Channels an entry belongs to: its active channels plus the star
    /// channel when enabled.
    pub fn channels_for(&self, entry: &LogEntry) -> ChannelSet {
        let mut channels: ChannelSet = entry
            .active_channels()
            .map(|name| ChannelId::new(name, entry.collection_id))
            .collect();
        if self.config.enable_star_channel {
            channels.insert(ChannelId::star(entry.collection_id));
        }
        channels
    }

    /// Add an entry to every resident cache of its channels. Channels with
    /// no resident cache are skipped. Returns every channel the entry
    /// belongs to, resident or not.
    pub fn add_to_cache(&self, entry: &Arc<LogEntry>) -> ChannelSet {
        let channels = self.channels_for(entry);
        let resident: Vec<Arc<SingleChannelCache>> = {
            let caches = self.caches.lock();
            channels
                .iter()
                .filter_map(|channel| caches.peek(channel).cloned())
                .collect()
        };
        for cache in resident {
            cache.add_to_cache(entry.clone());
        }
        channels
    }

    /// Changes in `channel` after `since`, from the cache and, below its
    /// valid range, from `store`.
    pub fn get_changes(
        &self,
        ctx: &Context,
        channel: &ChannelId,
        since: Sequence,
        store: &dyn ChangeStore,
    ) -> Result<Vec<Arc<LogEntry>>> {
        self.get_or_create(channel).get_changes(ctx, since, store)
    }

    /// Drop a channel's cache.
    pub fn remove(&self, channel: &ChannelId) -> bool {
        self.caches.lock().pop(channel).is_some()
    }

    /// Drop every cache.
    pub fn clear(&self) {
        self.caches.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident channels, most recently read first.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.caches.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}
