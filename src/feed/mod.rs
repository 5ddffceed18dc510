//! Decoding of raw feed events into log entries.

mod event;
mod sync_data;
mod xattr;

pub use event::{FeedEvent, FeedOpcode, DATA_TYPE_JSON, DATA_TYPE_XATTR};
pub use sync_data::{AccessMap, SyncData, FLAG_DELETED, SYNC_XATTR_NAME};
pub use xattr::{decode_xattrs, encode_xattrs, parse_xattr_stream_data, XattrFrame, XattrValues};

use crate::error::{CacheError, Result};
use crate::types::{EntryKind, LogEntry, Sequence};
use serde::Deserialize;

/// Prefix of internal documents.
pub const SYNC_PREFIX: &str = "_sync:";
pub const USER_PREFIX: &str = "_sync:user:";
pub const ROLE_PREFIX: &str = "_sync:role:";
pub const UNUSED_SEQ_PREFIX: &str = "_sync:unusedSeq:";
pub const UNUSED_SEQS_PREFIX: &str = "_sync:unusedSeqs:";

/// Notification key prefix for roles; users are keyed by bare name.
pub const ROLE_KEY_PREFIX: &str = "role:";

/// What a feed event means for the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedChange {
    /// A document revision.
    Document { entry: LogEntry, sync: SyncData },
    /// A user or role document.
    Principal { entry: LogEntry },
    /// Sequences released without a document, inclusive.
    UnusedSequences {
        from: Sequence,
        to: Sequence,
        collection_id: u32,
    },
    /// Nothing for the cache to do.
    Ignored(&'static str),
}

#[derive(Deserialize)]
struct PrincipalDoc {
    #[serde(default)]
    sequence: Sequence,
}

fn parse_seq(value: &str) -> Result<Sequence> {
    let seq = value
        .parse::<u64>()
        .map(Sequence)
        .map_err(|e| CacheError::MalformedInput(format!("invalid sequence {:?}: {}", value, e)))?;
    check_seq(seq)
}

/// Reject the reserved `Sequence::MAX`.
fn check_seq(seq: Sequence) -> Result<Sequence> {
    if seq == Sequence::MAX {
        return Err(CacheError::MalformedInput(format!(
            "sequence {} is out of range",
            seq
        )));
    }
    Ok(seq)
}

/// Sync metadata and body of a document event. Metadata comes from the sync
/// xattr when present, otherwise from the `_sync` body property.
fn extract_sync_data(event: &FeedEvent) -> Result<Option<SyncData>> {
    let body = if event.has_xattrs() {
        let values = parse_xattr_stream_data(SYNC_XATTR_NAME, "", &event.value)?;
        if let Some(raw) = values.sync {
            return Ok(Some(serde_json::from_slice(raw)?));
        }
        values.body
    } else {
        event.value.as_slice()
    };

    if body.is_empty() {
        return Ok(None);
    }
    let doc: serde_json::Value = match serde_json::from_slice(body) {
        Ok(doc) => doc,
        // Binary documents carry no metadata.
        Err(_) => return Ok(None),
    };
    match doc.get(SYNC_XATTR_NAME) {
        Some(meta) => Ok(Some(SyncData::deserialize(meta)?)),
        None => Ok(None),
    }
}

fn parse_unused(key: &str, collection_id: u32) -> Result<FeedChange> {
    if let Some(range) = key.strip_prefix(UNUSED_SEQS_PREFIX) {
        let (from, to) = range.split_once(':').ok_or_else(|| {
            CacheError::MalformedInput(format!("invalid unused sequence range {:?}", key))
        })?;
        let (from, to) = (parse_seq(from)?, parse_seq(to)?);
        if from > to {
            return Err(CacheError::MalformedInput(format!(
                "inverted unused sequence range {:?}",
                key
            )));
        }
        return Ok(FeedChange::UnusedSequences {
            from,
            to,
            collection_id,
        });
    }
    let seq = parse_seq(key.trim_start_matches(UNUSED_SEQ_PREFIX))?;
    Ok(FeedChange::UnusedSequences {
        from: seq,
        to: seq,
        collection_id,
    })
}

fn parse_principal(event: &FeedEvent, notify_key: String) -> Result<FeedChange> {
    let doc: PrincipalDoc = serde_json::from_slice(&event.value)?;
    check_seq(doc.sequence)?;
    if doc.sequence == Sequence::ZERO {
        return Ok(FeedChange::Ignored("principal without sequence"));
    }
    let entry =
        LogEntry::principal(doc.sequence, notify_key).with_time_received(event.time_received);
    Ok(FeedChange::Principal { entry })
}

/// Decode a feed event.
///
/// Errors only for payloads that claim a known shape but cannot be decoded;
/// everything the cache has no use for is `Ignored`.
pub fn parse_feed_event(event: &FeedEvent) -> Result<FeedChange> {
    if let FeedOpcode::Other(_) = event.opcode {
        return Ok(FeedChange::Ignored("unsupported opcode"));
    }
    let key = std::str::from_utf8(&event.key)
        .map_err(|e| CacheError::MalformedInput(format!("feed key: {}", e)))?;

    if key.starts_with(SYNC_PREFIX) {
        if key.starts_with(UNUSED_SEQ_PREFIX) || key.starts_with(UNUSED_SEQS_PREFIX) {
            return parse_unused(key, event.collection_id);
        }
        if event.opcode != FeedOpcode::Mutation {
            return Ok(FeedChange::Ignored("internal document removed"));
        }
        if let Some(name) = key.strip_prefix(USER_PREFIX) {
            return parse_principal(event, name.to_string());
        }
        if let Some(name) = key.strip_prefix(ROLE_PREFIX) {
            return parse_principal(event, format!("{}{}", ROLE_KEY_PREFIX, name));
        }
        return Ok(FeedChange::Ignored("internal document"));
    }

    if event.value.is_empty() {
        return Ok(FeedChange::Ignored("no document metadata"));
    }
    let sync = match extract_sync_data(event)? {
        Some(sync) if sync.sequence > Sequence::ZERO => sync,
        _ => return Ok(FeedChange::Ignored("no document metadata")),
    };
    check_seq(sync.sequence)?;
    for &seq in sync.recent_sequences.iter().chain(&sync.unused_sequences) {
        check_seq(seq)?;
    }

    let entry = LogEntry {
        sequence: sync.sequence,
        doc_id: key.to_string(),
        rev_id: sync.rev.clone(),
        channels: sync.channels.clone(),
        time_received: event.time_received,
        time_saved: sync.time_saved,
        deleted: sync.is_deleted(),
        collection_id: event.collection_id,
        kind: EntryKind::Document,
        skipped: false,
    };
    Ok(FeedChange::Document { entry, sync })
}
