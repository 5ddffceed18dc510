//! Core types for the change cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Position in the global mutation feed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    /// Reserved upper bound. Never assigned to a change, so `next()` of any
    /// real sequence is representable.
    pub const MAX: Sequence = Sequence(u64::MAX);

    /// The following sequence, saturating at `MAX`.
    pub fn next(self) -> Self {
        Sequence(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// A timestamp `age` before now.
    pub fn ago(age: Duration) -> Self {
        Timestamp(Self::now().0 - age.as_micros() as i64)
    }

    /// Time elapsed since this timestamp (zero if it lies in the future).
    pub fn elapsed(&self) -> Duration {
        let delta = Self::now().0 - self.0;
        Duration::from_micros(delta.max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Channel scoped to a collection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub collection_id: u32,
    pub name: String,
}

/// Name of the channel every document belongs to.
pub const STAR_CHANNEL: &str = "*";

impl ChannelId {
    pub fn new(name: impl Into<String>, collection_id: u32) -> Self {
        Self {
            collection_id,
            name: name.into(),
        }
    }

    /// The all-documents channel for a collection.
    pub fn star(collection_id: u32) -> Self {
        Self::new(STAR_CHANNEL, collection_id)
    }

    pub fn is_star(&self) -> bool {
        self.name == STAR_CHANNEL
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({}.{})", self.collection_id, self.name)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection_id, self.name)
    }
}

/// Set of channels touched by a change.
pub type ChannelSet = BTreeSet<ChannelId>;

/// Marker recording that a document left a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRemoval {
    /// Sequence at which the document was removed.
    pub seq: Sequence,
    /// Revision that removed it.
    #[serde(default)]
    pub rev: String,
    /// Whether the removal was a deletion.
    #[serde(default, rename = "del")]
    pub deleted: bool,
}

/// Channel name to optional removal marker.
pub type ChannelMap = BTreeMap<String, Option<ChannelRemoval>>;

/// What produced a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EntryKind {
    /// A document revision.
    #[default]
    Document,
    /// A user or role document; consumes a sequence, never cached in channels.
    Principal,
    /// A sequence with no visible change (unused or deduplicated).
    Unused,
}

/// A single change in the feed, immutable once dispatched.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub sequence: Sequence,
    pub doc_id: String,
    pub rev_id: String,
    pub channels: ChannelMap,
    pub time_received: Timestamp,
    pub time_saved: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub collection_id: u32,
    pub kind: EntryKind,
    /// Arrived after its sequence had been recorded as skipped.
    pub skipped: bool,
}

impl LogEntry {
    /// A document entry in the given channels.
    pub fn document(
        sequence: Sequence,
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        channels: &[&str],
        collection_id: u32,
    ) -> Self {
        Self {
            sequence,
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            channels: channels.iter().map(|c| (c.to_string(), None)).collect(),
            time_received: Timestamp::now(),
            time_saved: None,
            deleted: false,
            collection_id,
            kind: EntryKind::Document,
            skipped: false,
        }
    }

    /// An entry that only consumes a sequence.
    pub fn unused(sequence: Sequence, collection_id: u32) -> Self {
        Self {
            sequence,
            doc_id: String::new(),
            rev_id: String::new(),
            channels: ChannelMap::new(),
            time_received: Timestamp::now(),
            time_saved: None,
            deleted: false,
            collection_id,
            kind: EntryKind::Unused,
            skipped: false,
        }
    }

    /// An entry for a user or role document.
    pub fn principal(sequence: Sequence, name: impl Into<String>) -> Self {
        Self {
            doc_id: name.into(),
            kind: EntryKind::Principal,
            ..Self::unused(sequence, 0)
        }
    }

    pub fn with_time_received(mut self, time_received: Timestamp) -> Self {
        self.time_received = time_received;
        self
    }

    /// True if this entry removed the document from `channel`.
    pub fn removed_from(&self, channel: &str) -> bool {
        matches!(
            self.channels.get(channel),
            Some(Some(removal)) if removal.seq == self.sequence
        )
    }

    /// Channels this entry should be cached in, with removals at other sequences excluded.
    pub fn active_channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().filter_map(move |(name, removal)| match removal {
            Some(r) if r.seq != self.sequence => None,
            _ => Some(name.as_str()),
        })
    }
}

/// Compound sequence used by feed consumers to express backfill provenance.
///
/// Formats as `seq`, `triggered_by:seq`, `low_seq::seq` or
/// `low_seq:triggered_by:seq`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequenceId {
    pub seq: u64,
    pub triggered_by: u64,
    pub low_seq: u64,
}

impl SequenceId {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    /// Ordering used by feeds: by the sequence that made the entry visible,
    /// then by its own sequence.
    pub fn before(&self, other: &SequenceId) -> bool {
        let a = if self.triggered_by > 0 { self.triggered_by } else { self.seq };
        let b = if other.triggered_by > 0 { other.triggered_by } else { other.seq };
        if a != b {
            return a < b;
        }
        self.seq < other.seq
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceId({})", self)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.low_seq, self.triggered_by) {
            (0, 0) => write!(f, "{}", self.seq),
            (0, t) => write!(f, "{}:{}", t, self.seq),
            (l, 0) => write!(f, "{}::{}", l, self.seq),
            (l, t) => write!(f, "{}:{}:{}", l, t, self.seq),
        }
    }
}

impl FromStr for SequenceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            if part.is_empty() {
                Ok(0)
            } else {
                part.parse::<u64>()
                    .map_err(|e| format!("invalid sequence component {:?}: {}", part, e))
            }
        };
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [seq] => Ok(SequenceId::new(parse(seq)?)),
            [triggered_by, seq] => Ok(SequenceId {
                seq: parse(seq)?,
                triggered_by: parse(triggered_by)?,
                low_seq: 0,
            }),
            [low_seq, triggered_by, seq] => Ok(SequenceId {
                seq: parse(seq)?,
                triggered_by: parse(triggered_by)?,
                low_seq: parse(low_seq)?,
            }),
            _ => Err(format!("invalid sequence id: {:?}", s)),
        }
    }
}
