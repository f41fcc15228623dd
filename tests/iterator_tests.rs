//! Tests for DbIterator
//!
//! These tests verify:
//! - Range bounds, reverse order, limits and keys-only mode
//! - Chunked native reads and early close on a short read
//! - Peek and stream adaptation
//! - Prefixed sessions stay inside their keyspace
//! - Open iterators hold off database close

use std::sync::Arc;

use atlaskv_native::{
    Database, DatabaseOptions, Entry, IteratorOptions, MemoryEngine, Prefixed, RangeOptions,
    SessionOptions,
};
use futures::StreamExt;

// =============================================================================
// Helper Functions
// =============================================================================

const KEYS: [&str; 5] = ["a", "b", "c", "d", "e"];

async fn setup_populated_database(path: &str) -> (Arc<MemoryEngine>, Database) {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::new(engine.clone(), path, DatabaseOptions::default()).unwrap();

    let batch = db.write(Default::default()).unwrap();
    for key in KEYS {
        batch.try_put(key, key.to_uppercase()).unwrap();
    }
    batch.flush().await.unwrap();

    (engine, db)
}

fn keys(entries: &[Entry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| String::from_utf8(e.key.to_vec()).unwrap())
        .collect()
}

async fn collect_keys(db: &Database, range: RangeOptions, options: IteratorOptions) -> Vec<String> {
    let entries = db.iterator(range, options).unwrap().collect().await.unwrap();
    keys(&entries)
}

// =============================================================================
// Range Tests
// =============================================================================

#[tokio::test]
async fn test_full_scan() {
    let (_engine, db) = setup_populated_database("mem/it-full").await;

    let entries = db
        .iterator(RangeOptions::new(), IteratorOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(keys(&entries), KEYS);
    assert_eq!(&entries[0].value[..], b"A");
    assert_eq!(&entries[4].value[..], b"E");
}

#[tokio::test]
async fn test_inclusive_and_exclusive_bounds() {
    let (_engine, db) = setup_populated_database("mem/it-bounds").await;

    let got = collect_keys(&db, RangeOptions::new().gte("b").lt("d"), Default::default()).await;
    assert_eq!(got, ["b", "c"]);

    let got = collect_keys(&db, RangeOptions::new().gt("b").lte("d"), Default::default()).await;
    assert_eq!(got, ["c", "d"]);

    let got = collect_keys(&db, RangeOptions::new().gt("bb"), Default::default()).await;
    assert_eq!(got, ["c", "d", "e"]);
}

#[tokio::test]
async fn test_strict_bound_wins() {
    let (_engine, db) = setup_populated_database("mem/it-strict").await;

    let range = RangeOptions::new().gt("b").gte("a").lt("d").lte("e");
    let got = collect_keys(&db, range, Default::default()).await;

    assert_eq!(got, ["c"]);
}

#[tokio::test]
async fn test_empty_range() {
    let (_engine, db) = setup_populated_database("mem/it-empty").await;

    let got = collect_keys(&db, RangeOptions::new().gte("d").lt("b"), Default::default()).await;
    assert!(got.is_empty());

    let got = collect_keys(&db, RangeOptions::new().gt("c").lt("c"), Default::default()).await;
    assert!(got.is_empty());
}

#[tokio::test]
async fn test_reverse() {
    let (_engine, db) = setup_populated_database("mem/it-reverse").await;

    let options = IteratorOptions::default().reverse(true);

    let got = collect_keys(&db, RangeOptions::new(), options).await;
    assert_eq!(got, ["e", "d", "c", "b", "a"]);

    let got = collect_keys(&db, RangeOptions::new().gte("b").lte("d"), options).await;
    assert_eq!(got, ["d", "c", "b"]);
}

// =============================================================================
// Limit and Mode Tests
// =============================================================================

#[tokio::test]
async fn test_limit() {
    let (_engine, db) = setup_populated_database("mem/it-limit").await;

    let got = collect_keys(&db, RangeOptions::new(), IteratorOptions::default().limit(2)).await;
    assert_eq!(got, ["a", "b"]);

    let got = collect_keys(
        &db,
        RangeOptions::new(),
        IteratorOptions::default().limit(2).reverse(true),
    )
    .await;
    assert_eq!(got, ["e", "d"]);

    let got = collect_keys(&db, RangeOptions::new(), IteratorOptions::default().limit(-1)).await;
    assert_eq!(got.len(), KEYS.len());

    let got = collect_keys(&db, RangeOptions::new(), IteratorOptions::default().limit(0)).await;
    assert!(got.is_empty());
}

#[tokio::test]
async fn test_keys_only() {
    let (_engine, db) = setup_populated_database("mem/it-keys-only").await;

    let entries = db
        .key_iterator(RangeOptions::new(), IteratorOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(keys(&entries), KEYS);
    assert!(entries.iter().all(|e| e.value.is_empty()));
}

// =============================================================================
// Chunking Tests
// =============================================================================

#[tokio::test]
async fn test_reads_in_chunks() {
    let (engine, db) = setup_populated_database("mem/it-chunks").await;

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default().capacity(2))
        .unwrap();

    let mut seen = Vec::new();
    while let Some(entry) = iterator.next().await {
        seen.push(entry.unwrap());
    }

    // 2 + 2 + 1: the short third read ends the scan
    assert_eq!(keys(&seen), KEYS);
    assert_eq!(engine.stats().iterator_reads, 3);
    assert!(iterator.is_closed());
    assert_eq!(engine.stats().live_iterators, 0);
}

#[tokio::test]
async fn test_limit_caps_native_read() {
    let (engine, db) = setup_populated_database("mem/it-limit-read").await;

    let got = collect_keys(&db, RangeOptions::new(), IteratorOptions::default().limit(3)).await;

    assert_eq!(got, ["a", "b", "c"]);
    assert_eq!(engine.stats().iterator_reads, 1);
}

#[tokio::test]
async fn test_iterator_sees_state_at_open() {
    let (_engine, db) = setup_populated_database("mem/it-consistent").await;

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default().capacity(1))
        .unwrap();
    let first = iterator.next().await.unwrap().unwrap();
    assert_eq!(&first.key[..], b"a");

    db.put(b"bb", b"new").await.unwrap();
    db.delete(b"c").await.unwrap();

    let rest = iterator.collect().await.unwrap();
    assert_eq!(keys(&rest), ["b", "c", "d", "e"]);
}

// =============================================================================
// Peek and Stream Tests
// =============================================================================

#[tokio::test]
async fn test_peek() {
    let (engine, db) = setup_populated_database("mem/it-peek").await;

    let entry = db
        .peek(RangeOptions::new().gte("c"), IteratorOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&entry.key[..], b"c");
    assert_eq!(&entry.value[..], b"C");

    let entry = db
        .peek(RangeOptions::new(), IteratorOptions::default().reverse(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&entry.key[..], b"e");

    let entry = db
        .peek(RangeOptions::new().gt("e"), IteratorOptions::default())
        .await
        .unwrap();
    assert_eq!(entry, None);

    assert_eq!(engine.stats().live_iterators, 0);
}

#[tokio::test]
async fn test_into_stream() {
    let (_engine, db) = setup_populated_database("mem/it-stream").await;

    let stream = db
        .iterator(RangeOptions::new().gte("c"), IteratorOptions::default())
        .unwrap()
        .into_stream();

    let entries: Vec<Entry> = stream.map(|entry| entry.unwrap()).collect().await;
    assert_eq!(keys(&entries), ["c", "d", "e"]);
}

// =============================================================================
// Codec Tests
// =============================================================================

#[tokio::test]
async fn test_prefixed_session_stays_in_keyspace() {
    let (_engine, db) = setup_populated_database("mem/it-prefixed").await;

    let users = db
        .session(SessionOptions::default().key_codec(Prefixed::new("users/")))
        .unwrap();
    users.put(b"alice", b"1").await.unwrap();
    users.put(b"bob", b"2").await.unwrap();
    db.put(b"users0", b"outside").await.unwrap();
    db.put(b"user", b"outside").await.unwrap();

    let got = collect_keys(&users, RangeOptions::new(), Default::default()).await;
    assert_eq!(got, ["alice", "bob"]);

    let got = collect_keys(&users, RangeOptions::new(), IteratorOptions::default().reverse(true)).await;
    assert_eq!(got, ["bob", "alice"]);

    let got = collect_keys(&users, RangeOptions::new().gt("alice"), Default::default()).await;
    assert_eq!(got, ["bob"]);

    assert_eq!(db.get(b"users/alice").await.unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(users.get(b"alice").await.unwrap().as_deref(), Some(&b"1"[..]));
}

// =============================================================================
// Close Interaction Tests
// =============================================================================

#[tokio::test]
async fn test_open_iterator_holds_close() {
    let (engine, db) = setup_populated_database("mem/it-holds-close").await;

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default().capacity(1))
        .unwrap();
    iterator.next().await.unwrap().unwrap();
    assert!(iterator.is_open());
    assert_eq!(engine.stats().live_iterators, 1);

    let mut close = Box::pin(db.close());
    assert!(futures::poll!(close.as_mut()).is_pending());

    iterator.close().await.unwrap();
    close.await.unwrap();

    assert_eq!(engine.stats().live_iterators, 0);
    assert!(db.state().is_closed());
}

#[tokio::test]
async fn test_iterator_after_close_fails() {
    let (_engine, db) = setup_populated_database("mem/it-after-close").await;

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default())
        .unwrap();
    db.close().await.unwrap();

    assert!(iterator.next().await.unwrap().is_err());
    assert!(iterator.next().await.is_none());
    assert!(db.iterator(RangeOptions::new(), IteratorOptions::default()).is_err());
}

#[tokio::test]
async fn test_dropped_iterator_releases_handle() {
    let (engine, db) = setup_populated_database("mem/it-drop").await;

    {
        let mut iterator = db
            .iterator(RangeOptions::new(), IteratorOptions::default().capacity(1))
            .unwrap();
        iterator.next().await.unwrap().unwrap();
    }

    // The cursor is closed by a spawned task
    db.close().await.unwrap();
    assert_eq!(engine.stats().live_iterators, 0);
}

#[tokio::test]
async fn test_next_dropped_during_open_releases_cursor() {
    let (engine, db) = setup_populated_database("mem/it-drop-open").await;

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default())
        .unwrap();

    let mut next = Box::pin(iterator.next());
    assert!(futures::poll!(next.as_mut()).is_pending());
    assert_eq!(engine.stats().live_iterators, 1);

    drop(next);
    drop(iterator);

    db.close().await.unwrap();
    assert_eq!(engine.stats().live_iterators, 0);
}
