//! Ingestion of the mutation feed into ordered channel caches.
//!
//! `ChangeCache` owns the global sequence cursor. Feed events arrive out of
//! order; entries ahead of the cursor wait in a pending buffer until their
//! predecessors arrive or the buffer's bounds force the gap to be skipped.
//! Skipped sequences that later arrive are delivered as late entries.

mod housekeeping;
mod watch;

use crate::channels::ChannelCache;
use crate::config::CacheConfig;
use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::feed::{parse_feed_event, FeedChange, FeedEvent, SyncData};
use crate::insertions::PendingInsertions;
use crate::notify::ChangeNotifier;
use crate::sequences::{PendingBuffer, SkippedSequenceList};
use crate::stats::{CacheCounters, CacheStats};
use crate::store::ChangeStore;
use crate::types::{ChannelId, ChannelSet, EntryKind, LogEntry, Sequence, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use watch::SequenceWatch;

/// Lifecycle of a change cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Stopped,
    Initializing,
    Running,
}

struct IngestState {
    /// Next sequence expected from the feed.
    next_sequence: Sequence,
    /// Last sequence that existed before the cache started.
    initial_sequence: Sequence,
    pending: PendingBuffer,
}

/// A decoded `_sync:unusedSeqs` range.
struct UnusedRange {
    from: Sequence,
    to: Sequence,
    collection_id: u32,
    time_received: Timestamp,
}

/// Channels and principals touched while processing, notified after the
/// ingest lock is released.
#[derive(Default)]
struct Changed {
    channels: ChannelSet,
    principals: BTreeSet<String>,
}

pub(crate) struct Shared {
    config: CacheConfig,
    store: Arc<dyn ChangeStore>,
    notifier: Arc<dyn ChangeNotifier>,
    channel_cache: ChannelCache,
    skipped: SkippedSequenceList,
    ingest: Mutex<IngestState>,
    /// Published copy of `next_sequence` for readers.
    cursor: Arc<AtomicU64>,
    watch: SequenceWatch,
    state: RwLock<CacheState>,
    /// Cancelled on stop.
    lifecycle: Mutex<Context>,
    /// Held shared by storage maintenance; `stop` takes it exclusively.
    maintenance: RwLock<()>,
    counters: Arc<CacheCounters>,
    insertions: PendingInsertions,
}

#[derive(Debug)]
struct WorkerHandle {
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn stop(&mut self) {
        if let Some(handle) = self.join.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

/// The change cache for one database.
pub struct ChangeCache {
    shared: Arc<Shared>,
    worker: Mutex<WorkerHandle>,
}

impl ChangeCache {
    /// A stopped cache. Call [`start`](Self::start) before feeding events.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn ChangeStore>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let counters = Arc::new(CacheCounters::default());
        let cursor = Arc::new(AtomicU64::new(1));
        let channel_cache = ChannelCache::with_shared(
            config.channel_cache.clone(),
            cursor.clone(),
            counters.clone(),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                notifier,
                channel_cache,
                skipped: SkippedSequenceList::new(),
                ingest: Mutex::new(IngestState {
                    next_sequence: Sequence(1),
                    initial_sequence: Sequence::ZERO,
                    pending: PendingBuffer::new(),
                }),
                cursor,
                watch: SequenceWatch::new(),
                state: RwLock::new(CacheState::Stopped),
                lifecycle: Mutex::new(Context::new()),
                maintenance: RwLock::new(()),
                counters,
                insertions: PendingInsertions::new(),
            }),
            worker: Mutex::new(WorkerHandle { join: None }),
        })
    }

    /// Start ingesting after `initial_sequence`, the last sequence already
    /// in storage, and launch housekeeping.
    pub fn start(&self, initial_sequence: Sequence) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if *state != CacheState::Stopped {
                return Err(CacheError::InvalidState(format!(
                    "cannot start change cache in state {:?}",
                    *state
                )));
            }
            *state = CacheState::Initializing;
        }

        let next = initial_sequence.next();
        {
            let mut ingest = self.shared.ingest.lock();
            ingest.initial_sequence = initial_sequence;
            ingest.next_sequence = next;
            ingest.pending.clear();
        }
        self.shared.cursor.store(next.0, Ordering::SeqCst);
        self.shared.watch.reset(next);
        // Nothing from a previous run survives a restart.
        self.shared.skipped.clear();
        self.shared.channel_cache.clear();

        let ctx = Context::new();
        *self.shared.lifecycle.lock() = ctx.clone();

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("change-cache-housekeeping".into())
            .spawn(move || housekeeping::run(shared, ctx));
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                *self.shared.state.write() = CacheState::Stopped;
                self.shared.watch.close();
                return Err(CacheError::Io(e));
            }
        };
        self.worker.lock().join = Some(join);

        *self.shared.state.write() = CacheState::Running;
        info!(initial_sequence = initial_sequence.0, "change cache started");
        Ok(())
    }

    /// Stop ingesting and wait for housekeeping to exit. No storage query is
    /// issued by the cache once this returns. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.write();
            if *state == CacheState::Stopped {
                return;
            }
            *state = CacheState::Stopped;
        }
        self.shared.lifecycle.lock().cancel();
        // Waits out a storage lookup already in progress on any thread.
        drop(self.shared.maintenance.write());
        self.worker.lock().stop();
        self.shared.watch.close();
        info!("change cache stopped");
    }

    pub fn state(&self) -> CacheState {
        *self.shared.state.read()
    }

    /// Ingest one feed event. Undecodable events are logged and dropped.
    pub fn doc_changed(&self, event: FeedEvent) {
        self.shared.doc_changed(event);
    }

    /// Changes in `channel` after `since`, ascending.
    pub fn get_changes(
        &self,
        ctx: &Context,
        channel: &ChannelId,
        since: Sequence,
    ) -> Result<Vec<Arc<LogEntry>>> {
        if self.state() == CacheState::Stopped {
            return Err(CacheError::Stopped);
        }
        self.shared
            .channel_cache
            .get_changes(ctx, channel, since, self.shared.store.as_ref())
    }

    /// Block until every sequence up to `seq` has been dispatched or skipped.
    pub fn wait_for_sequence(&self, ctx: &Context, seq: Sequence, timeout: Duration) -> Result<()> {
        self.shared.watch.wait(ctx, seq, timeout)
    }

    /// Next sequence the cache expects.
    pub fn next_sequence(&self) -> Sequence {
        Sequence(self.shared.cursor.load(Ordering::SeqCst))
    }

    pub fn channel_cache(&self) -> &ChannelCache {
        &self.shared.channel_cache
    }

    pub fn skipped_sequences(&self) -> &SkippedSequenceList {
        &self.shared.skipped
    }

    pub fn pending_insertions(&self) -> &PendingInsertions {
        &self.shared.insertions
    }

    /// Number of entries waiting for their predecessors.
    pub fn pending_len(&self) -> usize {
        self.shared.ingest.lock().pending.len()
    }

    /// Flush pending entries whose wait has expired.
    pub fn clean_pending(&self) {
        self.shared.clean_pending();
    }

    /// Look up expired skipped sequences in storage, delivering the ones
    /// found and abandoning the rest.
    pub fn clean_skipped(&self) -> Result<()> {
        let ctx = self.shared.lifecycle.lock().clone();
        self.shared.clean_skipped(&ctx)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.shared.counters.snapshot();
        stats.skipped_len = self.shared.skipped.len();
        stats.pending_len = self.pending_len();
        stats.resident_channels = self.shared.channel_cache.len();
        stats
    }
}

impl Drop for ChangeCache {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        *self.state.read() == CacheState::Running
    }

    fn doc_changed(&self, event: FeedEvent) {
        if !self.is_running() {
            trace!("change cache not running, ignoring feed event");
            return;
        }
        let change = match parse_feed_event(&event) {
            Ok(change) => change,
            Err(e) => {
                CacheCounters::incr(&self.counters.malformed);
                warn!(
                    key = %String::from_utf8_lossy(&event.key),
                    error = %e,
                    "dropping malformed feed event"
                );
                return;
            }
        };

        let mut changed = Changed::default();
        {
            let mut ingest = self.ingest.lock();
            match change {
                FeedChange::Document { entry, sync } => {
                    if self.insertions.check(&entry.doc_id) {
                        debug!(doc_id = %entry.doc_id, "pending insertion observed on feed");
                    }
                    self.process_document(&mut ingest, entry, &sync, &mut changed);
                }
                FeedChange::Principal { entry } => {
                    self.process_entry(&mut ingest, entry, &mut changed);
                }
                FeedChange::UnusedSequences {
                    from,
                    to,
                    collection_id,
                } => {
                    debug!(from = from.0, to = to.0, "received unused sequences");
                    let range = UnusedRange {
                        from,
                        to,
                        collection_id,
                        time_received: event.time_received,
                    };
                    if let Err(e) = self.process_unused_range(&mut ingest, range, &mut changed) {
                        CacheCounters::incr(&self.counters.malformed);
                        warn!(from = from.0, to = to.0, error = %e, "dropping unused sequence range");
                    }
                }
                FeedChange::Ignored(reason) => {
                    trace!(key = %String::from_utf8_lossy(&event.key), reason, "ignoring feed event");
                }
            }
            self.watch.advance(ingest.next_sequence);
        }
        self.notify(changed);
    }

    fn process_document(
        &self,
        ingest: &mut IngestState,
        entry: LogEntry,
        sync: &SyncData,
        changed: &mut Changed,
    ) {
        // Earlier revisions the feed deduplicated away still consumed their
        // sequences.
        for &seq in &sync.recent_sequences {
            if seq < ingest.next_sequence || seq >= entry.sequence {
                continue;
            }
            debug!(seq = seq.0, doc_id = %entry.doc_id, "deduplicated sequence from recent_sequences");
            let removals = sync.removal_at(seq);
            let recent = if removals.is_empty() {
                LogEntry::unused(seq, entry.collection_id)
            } else {
                LogEntry {
                    sequence: seq,
                    doc_id: entry.doc_id.clone(),
                    rev_id: removals[0].1.rev.clone(),
                    channels: removals
                        .iter()
                        .map(|(name, removal)| (name.to_string(), Some((*removal).clone())))
                        .collect(),
                    time_received: entry.time_received,
                    time_saved: None,
                    deleted: removals.iter().any(|(_, r)| r.deleted),
                    collection_id: entry.collection_id,
                    kind: EntryKind::Document,
                    skipped: false,
                }
            };
            self.process_entry(ingest, recent.with_time_received(entry.time_received), changed);
        }

        let time_received = entry.time_received;
        let collection_id = entry.collection_id;
        self.process_entry(ingest, entry, changed);

        for &seq in &sync.unused_sequences {
            let unused = LogEntry::unused(seq, collection_id).with_time_received(time_received);
            self.process_entry(ingest, unused, changed);
        }
    }

    fn process_entry(&self, ingest: &mut IngestState, mut entry: LogEntry, changed: &mut Changed) {
        let seq = entry.sequence;
        if seq <= ingest.initial_sequence {
            trace!(seq = seq.0, "sequence predates cache start, ignoring");
            return;
        }
        if ingest.pending.contains(seq) {
            CacheCounters::incr(&self.counters.duplicate);
            trace!(seq = seq.0, "sequence already pending");
            return;
        }

        if seq == ingest.next_sequence {
            self.add_to_cache(ingest, Arc::new(entry), changed);
            self.add_pending_logs(ingest, changed);
        } else if seq > ingest.next_sequence {
            debug!(
                seq = seq.0,
                next = ingest.next_sequence.0,
                "deferring out-of-order sequence"
            );
            ingest.pending.push(Arc::new(entry));
            self.counters.record_pending(ingest.pending.len());
            self.add_pending_logs(ingest, changed);
        } else {
            match self.skipped.remove(seq) {
                Ok(()) => {
                    info!(seq = seq.0, doc_id = %entry.doc_id, "received previously skipped sequence");
                    CacheCounters::incr(&self.counters.late);
                    entry.skipped = true;
                    self.add_to_cache(ingest, Arc::new(entry), changed);
                }
                Err(_) => {
                    CacheCounters::incr(&self.counters.duplicate);
                    trace!(seq = seq.0, "duplicate sequence");
                }
            }
        }
    }

    /// Consume an unused range. The part at or below the cursor is settled
    /// without visiting each sequence: skipped members are resolved and the
    /// cursor jumps past `to`. A range entirely ahead of the cursor is
    /// buffered entry by entry, so it may not exceed the pending bound.
    fn process_unused_range(
        &self,
        ingest: &mut IngestState,
        range: UnusedRange,
        changed: &mut Changed,
    ) -> Result<()> {
        let from = range.from.max(ingest.initial_sequence.next());
        let to = range.to;
        if from > to {
            trace!(from = range.from.0, to = to.0, "unused range predates cache start");
            return Ok(());
        }

        if from > ingest.next_sequence {
            let len = to.0 - from.0 + 1;
            if len > self.config.pending_seq_max_num as u64 {
                return Err(CacheError::MalformedInput(format!(
                    "unused range {}..={} ahead of sequence {} exceeds the pending bound",
                    from.0, to.0, ingest.next_sequence.0
                )));
            }
            for seq in from.0..=to.0 {
                let entry = LogEntry::unused(Sequence(seq), range.collection_id)
                    .with_time_received(range.time_received);
                self.process_entry(ingest, entry, changed);
            }
            return Ok(());
        }

        let late = match ingest.next_sequence.prev() {
            Some(last) => self.skipped.remove_range(from, to.min(last)),
            None => 0,
        };
        if late > 0 {
            info!(from = from.0, to = to.0, count = late, "received previously skipped unused sequences");
            CacheCounters::add(&self.counters.late, late);
            CacheCounters::add(&self.counters.processed, late);
        }
        if to >= ingest.next_sequence {
            CacheCounters::add(&self.counters.processed, to.0 - ingest.next_sequence.0 + 1);
            ingest.next_sequence = to.next();
            self.cursor.store(ingest.next_sequence.0, Ordering::SeqCst);
            self.add_pending_logs(ingest, changed);
        }
        Ok(())
    }

    /// Dispatch buffered entries that are now contiguous. When the buffer is
    /// over its size bound or its lowest entry has waited too long, skip the
    /// gap in front of it.
    fn add_pending_logs(&self, ingest: &mut IngestState, changed: &mut Changed) {
        loop {
            let Some(head_seq) = ingest.pending.peek().map(|head| head.sequence) else {
                return;
            };
            let head_wait = ingest.pending.head_wait().unwrap_or_default();
            if head_seq == ingest.next_sequence {
                if let Some(entry) = ingest.pending.pop() {
                    self.add_to_cache(ingest, entry, changed);
                }
            } else if head_seq < ingest.next_sequence {
                ingest.pending.pop();
            } else if ingest.pending.len() > self.config.pending_seq_max_num
                || head_wait >= self.config.pending_seq_max_wait
            {
                self.skip_to(ingest, head_seq);
            } else {
                return;
            }
        }
    }

    /// Record `next_sequence..target` as skipped and move the cursor to
    /// `target`.
    fn skip_to(&self, ingest: &mut IngestState, target: Sequence) {
        let from = ingest.next_sequence;
        let to = Sequence(target.0 - 1);
        match self.skipped.push_range(from, to, Timestamp::now()) {
            Ok(count) => {
                CacheCounters::add(&self.counters.skipped, count);
                info!(from = from.0, to = to.0, "skipping missing sequences");
            }
            Err(e) => warn!(from = from.0, to = to.0, error = %e, "could not record skipped sequences"),
        }
        ingest.next_sequence = target;
        self.cursor.store(target.0, Ordering::SeqCst);
    }

    /// Advance the cursor past `entry` (unless it is late) and dispatch it.
    fn add_to_cache(&self, ingest: &mut IngestState, entry: Arc<LogEntry>, changed: &mut Changed) {
        if entry.sequence >= ingest.next_sequence {
            ingest.next_sequence = entry.sequence.next();
            // Published before dispatch so a cache created meanwhile starts
            // above this entry.
            self.cursor.store(ingest.next_sequence.0, Ordering::SeqCst);
        }
        CacheCounters::incr(&self.counters.processed);
        trace!(seq = entry.sequence.0, kind = ?entry.kind, "dispatching entry");

        match entry.kind {
            EntryKind::Document => {
                let channels = self.channel_cache.add_to_cache(&entry);
                changed.channels.extend(channels);
            }
            EntryKind::Principal => {
                changed.principals.insert(entry.doc_id.clone());
            }
            EntryKind::Unused => {}
        }
    }

    fn notify(&self, changed: Changed) {
        if changed.channels.is_empty() && changed.principals.is_empty() {
            return;
        }
        let ctx = self.lifecycle.lock().clone();
        if !changed.channels.is_empty() {
            self.notifier.notify_change(&ctx, &changed.channels);
        }
        if !changed.principals.is_empty() {
            self.notifier.notify_principals(&ctx, &changed.principals);
        }
    }

    fn clean_pending(&self) {
        let mut changed = Changed::default();
        {
            let mut ingest = self.ingest.lock();
            if ingest.pending.is_empty() {
                return;
            }
            self.add_pending_logs(&mut ingest, &mut changed);
            self.watch.advance(ingest.next_sequence);
        }
        self.notify(changed);
    }

    fn clean_skipped(&self, ctx: &Context) -> Result<()> {
        let changed = {
            let _guard = self.maintenance.read();
            if !self.is_running() {
                return Err(CacheError::Stopped);
            }
            self.resolve_skipped(ctx)?
        };
        self.notify(changed);
        Ok(())
    }

    fn resolve_skipped(&self, ctx: &Context) -> Result<Changed> {
        let outcome = self
            .skipped
            .clean(self.config.skipped_seq_max_wait, ctx, |seqs| {
                debug!(count = seqs.len(), "looking up expired skipped sequences");
                self.store.query_sequences(seqs)
            })?;

        for seq in &outcome.abandoned {
            warn!(seq = seq.0, "abandoning skipped sequence not found in storage");
        }
        CacheCounters::add(&self.counters.abandoned, outcome.abandoned.len() as u64);

        let mut changed = Changed::default();
        if outcome.found.is_empty() {
            return Ok(changed);
        }
        let recovered = outcome.found.len() as u64;
        {
            let mut ingest = self.ingest.lock();
            for entry in outcome.found {
                info!(seq = entry.sequence.0, doc_id = %entry.doc_id, "recovered skipped sequence from storage");
                self.process_entry(&mut ingest, entry, &mut changed);
            }
            self.watch.advance(ingest.next_sequence);
        }
        CacheCounters::add(&self.counters.recovered, recovered);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelCacheConfig;
    use crate::notify::NoopNotifier;
    use crate::store::MemoryChangeStore;

    fn doc_event(doc_id: &str, seq: u64, channels: &[&str]) -> FeedEvent {
        let sync = SyncData::new("1-a", Sequence(seq), channels);
        FeedEvent::document(doc_id, &sync, b"{}").unwrap()
    }

    fn started(config: CacheConfig) -> ChangeCache {
        let cache = ChangeCache::new(
            config,
            Arc::new(MemoryChangeStore::new()),
            Arc::new(NoopNotifier),
        )
        .unwrap();
        cache.start(Sequence::ZERO).unwrap();
        cache
    }

    fn channel_seqs(cache: &ChangeCache, name: &str) -> Vec<u64> {
        let abc = ChannelId::new(name, 0);
        let cached = cache.channel_cache().get_or_create(&abc);
        cached
            .get_cached_changes(Sequence::ZERO)
            .1
            .iter()
            .map(|e| e.sequence.0)
            .collect()
    }

    #[test]
    fn test_in_order_dispatch() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));
        for seq in 1..=3 {
            cache.doc_changed(doc_event(&format!("doc{}", seq), seq, &["ABC"]));
        }
        assert_eq!(channel_seqs(&cache, "ABC"), vec![1, 2, 3]);
        assert_eq!(cache.next_sequence(), Sequence(4));
        assert_eq!(cache.stats().processed, 3);
    }

    #[test]
    fn test_out_of_order_buffered() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));
        cache.doc_changed(doc_event("doc3", 3, &["ABC"]));
        cache.doc_changed(doc_event("doc2", 2, &["ABC"]));
        assert_eq!(cache.pending_len(), 2);
        assert!(channel_seqs(&cache, "ABC").is_empty());

        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(channel_seqs(&cache, "ABC"), vec![1, 2, 3]);
    }

    #[test]
    fn test_pending_max_num_forces_skip() {
        let config = CacheConfig {
            pending_seq_max_num: 2,
            ..Default::default()
        };
        let cache = started(config);
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));
        for seq in [3, 4, 5] {
            cache.doc_changed(doc_event(&format!("doc{}", seq), seq, &["ABC"]));
        }
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.skipped_sequences().sequences(), vec![Sequence(1), Sequence(2)]);
        assert_eq!(channel_seqs(&cache, "ABC"), vec![3, 4, 5]);

        // Late arrival resolves the skip
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        assert_eq!(cache.skipped_sequences().sequences(), vec![Sequence(2)]);
        assert_eq!(channel_seqs(&cache, "ABC"), vec![1, 3, 4, 5]);
        assert_eq!(cache.stats().late_sequences, 1);
    }

    #[test]
    fn test_redelivery_is_noop() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        cache.doc_changed(doc_event("doc3", 3, &["ABC"]));
        cache.doc_changed(doc_event("doc3", 3, &["ABC"]));

        assert_eq!(channel_seqs(&cache, "ABC"), vec![1]);
        assert_eq!(cache.pending_len(), 1);
        assert_eq!(cache.stats().duplicate_sequences, 2);
    }

    #[test]
    fn test_recent_sequences_fill_gaps() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));

        let mut sync = SyncData::new("3-c", Sequence(3), &["ABC"]);
        sync.recent_sequences = vec![Sequence(1), Sequence(2), Sequence(3)];
        cache.doc_changed(FeedEvent::document("doc1", &sync, b"{}").unwrap());

        assert_eq!(cache.next_sequence(), Sequence(4));
        assert!(cache.skipped_sequences().is_empty());
        assert_eq!(channel_seqs(&cache, "ABC"), vec![3]);
    }

    #[test]
    fn test_removal_in_recent_sequences() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("NBC", 0));

        let mut sync = SyncData::new("3-c", Sequence(3), &["ABC"]);
        sync.recent_sequences = vec![Sequence(1), Sequence(2), Sequence(3)];
        sync.channels.insert(
            "NBC".into(),
            Some(crate::types::ChannelRemoval {
                seq: Sequence(2),
                rev: "2-b".into(),
                deleted: false,
            }),
        );
        cache.doc_changed(FeedEvent::document("doc1", &sync, b"{}").unwrap());

        // The removal at 2 is cached in NBC; the revision at 3 is not
        assert_eq!(channel_seqs(&cache, "NBC"), vec![2]);
    }

    #[test]
    fn test_unused_sequences_consumed() {
        let cache = started(CacheConfig::default());
        cache.doc_changed(FeedEvent::mutation("_sync:unusedSeqs:1:3", Vec::new()));
        assert_eq!(cache.next_sequence(), Sequence(4));

        let mut sync = SyncData::new("1-a", Sequence(4), &["ABC"]);
        sync.unused_sequences = vec![Sequence(5)];
        cache.doc_changed(FeedEvent::document("doc4", &sync, b"{}").unwrap());
        assert_eq!(cache.next_sequence(), Sequence(6));
    }

    #[test]
    fn test_unused_range_behind_cursor_resolves_skipped() {
        let config = CacheConfig {
            pending_seq_max_num: 1,
            ..Default::default()
        };
        let cache = started(config);
        cache.doc_changed(doc_event("doc5", 5, &["ABC"]));
        cache.doc_changed(doc_event("doc6", 6, &["ABC"]));
        assert_eq!(
            cache.skipped_sequences().sequences(),
            vec![Sequence(1), Sequence(2), Sequence(3), Sequence(4)]
        );

        cache.doc_changed(FeedEvent::mutation("_sync:unusedSeqs:2:9", Vec::new()));
        assert_eq!(cache.skipped_sequences().sequences(), vec![Sequence(1)]);
        assert_eq!(cache.next_sequence(), Sequence(10));
        let stats = cache.stats();
        assert_eq!(stats.late_sequences, 3);
        assert_eq!(stats.processed, 2 + 3 + 3);
    }

    #[test]
    fn test_huge_unused_range_jumps_cursor() {
        let cache = started(CacheConfig::default());
        cache.doc_changed(doc_event("doc3", 3, &["ABC"]));
        cache.doc_changed(FeedEvent::mutation(
            "_sync:unusedSeqs:1:18446744073709551614",
            Vec::new(),
        ));

        assert_eq!(cache.next_sequence(), Sequence::MAX);
        // The buffered entry was inside the range
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.stats().malformed_events, 0);
    }

    #[test]
    fn test_oversized_unused_range_ahead_rejected() {
        let config = CacheConfig {
            pending_seq_max_num: 4,
            ..Default::default()
        };
        let cache = started(config);
        cache.doc_changed(FeedEvent::mutation("_sync:unusedSeqs:3:7", Vec::new()));
        assert_eq!(cache.stats().malformed_events, 1);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.next_sequence(), Sequence(1));

        // A range within the bound is buffered as usual
        cache.doc_changed(FeedEvent::mutation("_sync:unusedSeqs:2:4", Vec::new()));
        assert_eq!(cache.pending_len(), 3);
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        assert_eq!(cache.next_sequence(), Sequence(5));
    }

    #[test]
    fn test_principal_consumes_sequence() {
        let cache = started(CacheConfig::default());
        cache.channel_cache().get_or_create(&ChannelId::new("ABC", 0));
        cache.doc_changed(doc_event("doc2", 2, &["ABC"]));
        cache.doc_changed(FeedEvent::mutation(
            "_sync:user:naomi",
            br#"{"name":"naomi","sequence":1}"#.to_vec(),
        ));
        assert_eq!(channel_seqs(&cache, "ABC"), vec![2]);
        assert_eq!(cache.next_sequence(), Sequence(3));
    }

    #[test]
    fn test_malformed_event_counted() {
        let cache = started(CacheConfig::default());
        let mut event = doc_event("doc1", 1, &["ABC"]);
        event.value.truncate(3);
        cache.doc_changed(event);
        assert_eq!(cache.stats().malformed_events, 1);
        assert_eq!(cache.next_sequence(), Sequence(1));
    }

    #[test]
    fn test_events_before_start_ignored() {
        let cache = ChangeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryChangeStore::new()),
            Arc::new(NoopNotifier),
        )
        .unwrap();
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        assert_eq!(cache.state(), CacheState::Stopped);
        assert_eq!(cache.stats().processed, 0);
    }

    #[test]
    fn test_initial_sequence() {
        let cache = ChangeCache::new(
            CacheConfig::default(),
            Arc::new(MemoryChangeStore::new()),
            Arc::new(NoopNotifier),
        )
        .unwrap();
        cache.start(Sequence(10)).unwrap();
        assert_eq!(cache.next_sequence(), Sequence(11));
        assert!(cache.start(Sequence(10)).is_err());

        cache.doc_changed(doc_event("doc1", 5, &["ABC"]));
        assert_eq!(cache.stats().processed, 0);
        cache.doc_changed(doc_event("doc2", 11, &["ABC"]));
        assert_eq!(cache.next_sequence(), Sequence(12));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            channel_cache: ChannelCacheConfig {
                min_length: 10,
                max_length: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = ChangeCache::new(
            config,
            Arc::new(MemoryChangeStore::new()),
            Arc::new(NoopNotifier),
        );
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_stop_then_restart() {
        let cache = started(CacheConfig::default());
        cache.stop();
        cache.stop();
        assert_eq!(cache.state(), CacheState::Stopped);
        assert!(matches!(
            cache.get_changes(&Context::new(), &ChannelId::new("ABC", 0), Sequence::ZERO),
            Err(CacheError::Stopped)
        ));

        cache.start(Sequence(4)).unwrap();
        assert_eq!(cache.state(), CacheState::Running);
        assert_eq!(cache.next_sequence(), Sequence(5));
    }

    #[test]
    fn test_restart_discards_previous_run() {
        let config = CacheConfig {
            pending_seq_max_num: 1,
            ..Default::default()
        };
        let cache = started(config);
        let abc = ChannelId::new("ABC", 0);
        cache.channel_cache().get_or_create(&abc);
        cache.doc_changed(doc_event("doc3", 3, &["ABC"]));
        cache.doc_changed(doc_event("doc4", 4, &["ABC"]));
        assert_eq!(cache.skipped_sequences().sequences(), vec![Sequence(1), Sequence(2)]);

        cache.stop();
        cache.start(Sequence::ZERO).unwrap();
        assert!(cache.skipped_sequences().is_empty());
        assert!(cache.channel_cache().is_empty());

        cache.channel_cache().get_or_create(&abc);
        cache.doc_changed(doc_event("doc1", 1, &["ABC"]));
        assert!(!cache.skipped_sequences().contains(Sequence(1)));
        assert_eq!(channel_seqs(&cache, "ABC"), vec![1]);
        assert_eq!(cache.next_sequence(), Sequence(2));

        // Gaps in the new run are tracked again
        cache.doc_changed(doc_event("doc4", 4, &["ABC"]));
        cache.doc_changed(doc_event("doc5", 5, &["ABC"]));
        assert_eq!(cache.skipped_sequences().sequences(), vec![Sequence(2), Sequence(3)]);
    }
}
