//! # Change Cache
//!
//! In-memory change cache for a document-sync server. A mutation feed
//! delivers document revisions tagged with a global sequence number, but not
//! necessarily in sequence order. The cache restores that order and keeps a
//! recent window of changes per channel so readers can ask "what changed in
//! channel X since sequence N" without touching storage.
//!
//! ## Core Concepts
//!
//! - **Change cache**: Buffers out-of-order arrivals, skips gaps that stay
//!   open too long, and backfills them when they eventually arrive
//! - **Channel caches**: Bounded, ordered per-channel windows with storage
//!   fallback for older history
//! - **Late sequence logs**: Per-channel record of backfilled arrivals for
//!   consumers already past them
//! - **Notifier**: Wakes consumers blocked on channels that changed
//!
//! ## Example
//!
//! ```ignore
//! use change_cache::{CacheConfig, ChangeCache, ChangeListener, Context, MemoryChangeStore};
//!
//! let listener = Arc::new(ChangeListener::new());
//! let cache = ChangeCache::new(
//!     CacheConfig::default(),
//!     Arc::new(MemoryChangeStore::new()),
//!     listener.clone(),
//! )?;
//! cache.start(Sequence::ZERO)?;
//!
//! // Feed events as they arrive
//! cache.doc_changed(event);
//!
//! // Read a channel
//! let changes = cache.get_changes(&Context::new(), &ChannelId::new("ABC", 0), since)?;
//! ```

pub mod change_cache;
pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod insertions;
pub mod notify;
pub mod sequences;
pub mod stats;
pub mod store;
pub mod types;

// Re-exports
pub use change_cache::{CacheState, ChangeCache};
pub use channels::{ChannelCache, LateSequenceLog, SingleChannelCache};
pub use config::{CacheConfig, ChannelCacheConfig};
pub use context::Context;
pub use error::{CacheError, Result};
pub use feed::{parse_feed_event, FeedChange, FeedEvent, FeedOpcode, SyncData};
pub use insertions::PendingInsertions;
pub use notify::{ChangeListener, ChangeNotifier, ChangeWaiter, NoopNotifier, WaitOutcome};
pub use sequences::{SkippedSequence, SkippedSequenceList};
pub use stats::CacheStats;
pub use store::{ChangeStore, MemoryChangeStore};
pub use types::*;
