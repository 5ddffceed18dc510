//! Cache configuration.

use crate::error::{CacheError, Result};
use std::time::Duration;

/// Per-channel cache configuration.
#[derive(Clone, Debug)]
pub struct ChannelCacheConfig {
    /// Length a cache is trimmed down to once it exceeds `max_length`.
    /// Default: 50
    pub min_length: usize,

    /// Length that triggers trimming.
    /// Default: 500
    pub max_length: usize,

    /// Entries older than this are pruned while the cache is above `min_length`.
    /// Default: 60s
    pub max_age: Duration,

    /// Maximum number of resident channel caches.
    /// Default: 50000
    pub max_num_channels: usize,

    /// Cache every document in the `*` channel as well.
    pub enable_star_channel: bool,
}

impl Default for ChannelCacheConfig {
    fn default() -> Self {
        Self {
            min_length: 50,
            max_length: 500,
            max_age: Duration::from_secs(60),
            max_num_channels: 50_000,
            enable_star_channel: true,
        }
    }
}

/// Change cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub channel_cache: ChannelCacheConfig,

    /// Longest an entry may wait in the pending buffer for its predecessors.
    /// Default: 5s
    pub pending_seq_max_wait: Duration,

    /// Pending buffer size that forces a flush.
    /// Default: 10000
    pub pending_seq_max_num: usize,

    /// Age after which a skipped sequence is looked up in storage and, if
    /// absent, abandoned.
    /// Default: 60min
    pub skipped_seq_max_wait: Duration,

    /// How often housekeeping checks the skipped sequence list.
    /// Default: 1min
    pub skipped_seq_clean_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            channel_cache: ChannelCacheConfig::default(),
            pending_seq_max_wait: Duration::from_secs(5),
            pending_seq_max_num: 10_000,
            skipped_seq_max_wait: Duration::from_secs(60 * 60),
            skipped_seq_clean_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        let channels = &self.channel_cache;
        if channels.max_length == 0 {
            return Err(CacheError::InvalidConfig(
                "channel cache max_length must be positive".into(),
            ));
        }
        if channels.min_length > channels.max_length {
            return Err(CacheError::InvalidConfig(format!(
                "channel cache min_length ({}) exceeds max_length ({})",
                channels.min_length, channels.max_length
            )));
        }
        if channels.max_num_channels == 0 {
            return Err(CacheError::InvalidConfig(
                "max_num_channels must be positive".into(),
            ));
        }
        if self.pending_seq_max_num == 0 {
            return Err(CacheError::InvalidConfig(
                "pending_seq_max_num must be positive".into(),
            ));
        }
        if self.pending_seq_max_wait.is_zero()
            || self.skipped_seq_max_wait.is_zero()
            || self.skipped_seq_clean_interval.is_zero()
        {
            return Err(CacheError::InvalidConfig(
                "wait intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
