//! Synchronization metadata attached to documents.

use crate::types::{ChannelMap, ChannelRemoval, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the xattr (and body property) holding sync metadata.
pub const SYNC_XATTR_NAME: &str = "_sync";

/// Flag bit set on deleted revisions.
pub const FLAG_DELETED: u8 = 0x01;

/// Principal name -> channel (or role) -> sequence of the grant.
pub type AccessMap = BTreeMap<String, BTreeMap<String, Sequence>>;

/// Sync metadata of a document revision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub sequence: Sequence,
    /// Sequences assigned to recent revisions, including ones the feed may
    /// have deduplicated away.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_sequences: Vec<Sequence>,
    /// Sequences allocated for this write but never used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unused_sequences: Vec<Sequence>,
    #[serde(default)]
    pub channels: ChannelMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub access: AccessMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_access: AccessMap,
    #[serde(default)]
    pub flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_saved: Option<DateTime<Utc>>,
}

impl SyncData {
    pub fn new(rev: impl Into<String>, sequence: Sequence, channels: &[&str]) -> Self {
        Self {
            rev: rev.into(),
            sequence,
            recent_sequences: vec![sequence],
            channels: channels.iter().map(|c| (c.to_string(), None)).collect(),
            ..Default::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// Channel removed at `seq`, if any, per the channel map.
    pub fn removal_at(&self, seq: Sequence) -> Vec<(&str, &ChannelRemoval)> {
        self.channels
            .iter()
            .filter_map(|(name, removal)| match removal {
                Some(r) if r.seq == seq => Some((name.as_str(), r)),
                _ => None,
            })
            .collect()
    }
}
