//! Raw events from the mutation feed.

use super::sync_data::{SyncData, SYNC_XATTR_NAME};
use super::xattr::encode_xattrs;
use crate::error::Result;
use crate::types::Timestamp;

/// Value is JSON.
pub const DATA_TYPE_JSON: u8 = 0x01;
/// Value is prefixed with xattr framing.
pub const DATA_TYPE_XATTR: u8 = 0x04;

/// Kind of mutation an event reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedOpcode {
    Mutation,
    Deletion,
    Expiration,
    Other(u8),
}

/// One event from the change-data-capture source.
#[derive(Clone, Debug)]
pub struct FeedEvent {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub collection_id: u32,
    pub cas: u64,
    pub expiry: u32,
    pub opcode: FeedOpcode,
    pub data_type: u8,
    pub time_received: Timestamp,
}

impl FeedEvent {
    /// A plain JSON mutation.
    pub fn mutation(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            collection_id: 0,
            cas: 0,
            expiry: 0,
            opcode: FeedOpcode::Mutation,
            data_type: DATA_TYPE_JSON,
            time_received: Timestamp::now(),
        }
    }

    /// A document mutation carrying `sync` in the sync xattr ahead of `body`.
    pub fn document(doc_id: &str, sync: &SyncData, body: &[u8]) -> Result<Self> {
        let meta = serde_json::to_vec(sync)?;
        let value = encode_xattrs(&[(SYNC_XATTR_NAME, meta.as_slice())], body);
        Ok(Self {
            data_type: DATA_TYPE_JSON | DATA_TYPE_XATTR,
            ..Self::mutation(doc_id, value)
        })
    }

    pub fn with_collection(mut self, collection_id: u32) -> Self {
        self.collection_id = collection_id;
        self
    }

    pub fn with_opcode(mut self, opcode: FeedOpcode) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_time_received(mut self, time_received: Timestamp) -> Self {
        self.time_received = time_received;
        self
    }

    pub fn has_xattrs(&self) -> bool {
        self.data_type & DATA_TYPE_XATTR != 0
    }
}
