//! Decoding of raw feed payloads.

use change_cache::feed::{decode_xattrs, encode_xattrs, parse_xattr_stream_data, FLAG_DELETED};
use change_cache::{
    parse_feed_event, CacheConfig, CacheError, ChangeCache, FeedChange, FeedEvent, FeedOpcode,
    MemoryChangeStore, NoopNotifier, Sequence, SyncData,
};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_xattr_stream_with_user_xattr() {
    let sync = serde_json::to_vec(&json!({"rev": "2-b", "sequence": 9})).unwrap();
    let user = serde_json::to_vec(&json!({"owner": "alice"})).unwrap();
    let body = serde_json::to_vec(&json!({"title": "hello"})).unwrap();
    let framed = encode_xattrs(
        &[("_sync", sync.as_slice()), ("channels", user.as_slice())],
        &body,
    );

    let values = parse_xattr_stream_data("_sync", "channels", &framed).unwrap();
    assert_eq!(values.sync, Some(sync.as_slice()));
    assert_eq!(values.user, Some(user.as_slice()));
    assert_eq!(values.body, body.as_slice());

    // Unrequested user xattr is not returned
    let values = parse_xattr_stream_data("_sync", "", &framed).unwrap();
    assert!(values.user.is_none());

    let frame = decode_xattrs(&framed).unwrap();
    assert_eq!(frame.xattrs.len(), 2);
    assert_eq!(frame.get("channels"), Some(user.as_slice()));
}

#[test]
fn test_invalid_xattr_streams() {
    // Declared length past the end of the value
    let mut framed = encode_xattrs(&[("_sync", b"{}".as_slice())], b"");
    framed[3] = 0xFF;
    assert!(matches!(decode_xattrs(&framed), Err(CacheError::MalformedInput(_))));

    // Too short to hold a length
    assert!(matches!(decode_xattrs(&[0, 0]), Err(CacheError::MalformedInput(_))));

    // Pair missing its terminators
    let mut bad = Vec::new();
    bad.extend_from_slice(&9u32.to_be_bytes());
    bad.extend_from_slice(&5u32.to_be_bytes());
    bad.extend_from_slice(b"_sync");
    assert!(matches!(decode_xattrs(&bad), Err(CacheError::MalformedInput(_))));
}

#[test]
fn test_tombstone_keeps_metadata() {
    let mut sync = SyncData::new("3-c", Sequence(12), &["ABC"]);
    sync.flags = FLAG_DELETED;
    let event = FeedEvent::document("doc1", &sync, b"")
        .unwrap()
        .with_opcode(FeedOpcode::Deletion);

    match parse_feed_event(&event).unwrap() {
        FeedChange::Document { entry, .. } => {
            assert!(entry.deleted);
            assert_eq!(entry.sequence, Sequence(12));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_unknown_opcode_ignored() {
    let event = FeedEvent::mutation("doc1", b"{}".to_vec()).with_opcode(FeedOpcode::Other(0x99));
    assert!(matches!(parse_feed_event(&event).unwrap(), FeedChange::Ignored(_)));
}

#[test]
fn test_malformed_events_do_not_stall_ingest() {
    let cache = ChangeCache::new(
        CacheConfig::default(),
        Arc::new(MemoryChangeStore::new()),
        Arc::new(NoopNotifier),
    )
    .unwrap();
    cache.start(Sequence::ZERO).unwrap();

    let good = FeedEvent::document("doc1", &SyncData::new("1-a", Sequence(1), &["ABC"]), b"{}")
        .unwrap();
    let mut broken = good.clone();
    broken.value.truncate(6);

    cache.doc_changed(broken);
    cache.doc_changed(FeedEvent::mutation("_sync:unusedSeqs:9:3", Vec::new()));
    cache.doc_changed(good);

    let stats = cache.stats();
    assert_eq!(stats.malformed_events, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(cache.next_sequence(), Sequence(2));
}
