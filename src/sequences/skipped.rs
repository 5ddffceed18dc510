//! Sequences known to be missing from the feed.

use crate::context::Context;
use crate::error::{CacheError, Result};
use crate::types::{LogEntry, Sequence, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// A sequence that was passed over while it had not yet arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkippedSequence {
    pub seq: Sequence,
    pub timestamp: Timestamp,
}

/// Result of a [`SkippedSequenceList::clean`] pass.
#[derive(Debug, Default)]
pub struct CleanOutcome {
    /// Expired sequences found in storage; still listed until redelivered.
    pub found: Vec<LogEntry>,
    /// Expired sequences not found in storage, now removed from the list.
    pub abandoned: Vec<Sequence>,
}

struct SkippedInner {
    entries: BTreeMap<Sequence, Timestamp>,
    /// Cached minimum of `entries`.
    oldest: Option<Sequence>,
}

/// Ascending, duplicate-free list of skipped sequences.
///
/// Only accepts sequences above the current maximum, so insertion order and
/// sequence order always agree.
pub struct SkippedSequenceList {
    inner: Mutex<SkippedInner>,
}

impl SkippedSequenceList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SkippedInner {
                entries: BTreeMap::new(),
                oldest: None,
            }),
        }
    }

    /// Append a sequence. Fails without modifying the list unless `seq` is
    /// greater than every tracked sequence.
    pub fn push(&self, skipped: SkippedSequence) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some((&max, _)) = inner.entries.last_key_value() {
            if skipped.seq <= max {
                return Err(CacheError::OrderingViolation {
                    seq: skipped.seq,
                    max,
                });
            }
        }
        inner.entries.insert(skipped.seq, skipped.timestamp);
        if inner.oldest.is_none() {
            inner.oldest = Some(skipped.seq);
        }
        Ok(())
    }

    /// Append every sequence in `from..=to`. Returns the number pushed.
    pub fn push_range(&self, from: Sequence, to: Sequence, timestamp: Timestamp) -> Result<u64> {
        let mut pushed = 0;
        for seq in from.0..=to.0 {
            self.push(SkippedSequence {
                seq: Sequence(seq),
                timestamp,
            })?;
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Remove a tracked sequence.
    pub fn remove(&self, seq: Sequence) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.remove(&seq).is_none() {
            return Err(CacheError::SequenceNotFound(seq));
        }
        if inner.oldest == Some(seq) {
            inner.oldest = inner.entries.keys().next().copied();
        }
        Ok(())
    }

    /// Remove every tracked sequence in `from..=to`. Returns the number
    /// removed.
    pub fn remove_range(&self, from: Sequence, to: Sequence) -> u64 {
        if from > to {
            return 0;
        }
        let mut inner = self.inner.lock();
        let found: Vec<Sequence> = inner.entries.range(from..=to).map(|(&seq, _)| seq).collect();
        for seq in &found {
            inner.entries.remove(seq);
        }
        inner.oldest = inner.entries.keys().next().copied();
        found.len() as u64
    }

    /// Forget every tracked sequence.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.oldest = None;
    }

    pub fn contains(&self, seq: Sequence) -> bool {
        self.inner.lock().entries.contains_key(&seq)
    }

    /// Lowest tracked sequence.
    pub fn get_oldest(&self) -> Option<Sequence> {
        self.inner.lock().oldest
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked sequences in ascending order.
    pub fn sequences(&self) -> Vec<Sequence> {
        self.inner.lock().entries.keys().copied().collect()
    }

    /// Sequences skipped longer than `max_wait` ago, scanning from the oldest
    /// and stopping at the first one still within the window.
    pub fn expired(&self, max_wait: Duration) -> Vec<Sequence> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .take_while(|(_, ts)| ts.elapsed() >= max_wait)
            .map(|(&seq, _)| seq)
            .collect()
    }

    /// Look up expired sequences with `lookup` and abandon the ones it does
    /// not return.
    ///
    /// `lookup` runs without the list lock held and is never called once `ctx`
    /// is cancelled. A lookup error leaves the list untouched.
    pub fn clean<F>(&self, max_wait: Duration, ctx: &Context, lookup: F) -> Result<CleanOutcome>
    where
        F: FnOnce(&[Sequence]) -> Result<Vec<LogEntry>>,
    {
        let expired = self.expired(max_wait);
        if expired.is_empty() {
            return Ok(CleanOutcome::default());
        }

        ctx.check()?;
        let found = lookup(&expired)?;
        ctx.check()?;

        let expired_set: HashSet<Sequence> = expired.iter().copied().collect();
        let found: Vec<LogEntry> = found
            .into_iter()
            .filter(|entry| expired_set.contains(&entry.sequence))
            .collect();
        let found_set: HashSet<Sequence> = found.iter().map(|e| e.sequence).collect();

        let mut abandoned = Vec::new();
        for seq in expired {
            if found_set.contains(&seq) {
                continue;
            }
            // Arrived between the scan and now; nothing to abandon.
            if self.remove(seq).is_ok() {
                abandoned.push(seq);
            }
        }
        debug!(
            found = found.len(),
            abandoned = abandoned.len(),
            "cleaned skipped sequence list"
        );

        Ok(CleanOutcome { found, abandoned })
    }
}

impl Default for SkippedSequenceList {
    fn default() -> Self {
        Self::new()
    }
}
