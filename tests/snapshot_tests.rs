//! Tests for snapshot sessions
//!
//! These tests verify:
//! - Reads and iterators through a snapshot see the state at creation
//! - Snapshots taken before open are created at open
//! - Reference counting across derived sessions

use std::sync::Arc;

use atlaskv_native::{
    AtlasError, Database, DatabaseOptions, IteratorOptions, MemoryEngine, RangeOptions, SessionOptions,
};

// =============================================================================
// Helper Functions
// =============================================================================

async fn setup_open_database(path: &str) -> (Arc<MemoryEngine>, Database) {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::new(engine.clone(), path, DatabaseOptions::default()).unwrap();
    db.ready().await.unwrap();
    (engine, db)
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_isolates_reads() {
    let (_engine, db) = setup_open_database("mem/snap-reads").await;
    db.put(b"key", b"old").await.unwrap();

    let snapshot = db.snapshot().unwrap();

    db.put(b"key", b"new").await.unwrap();
    db.put(b"later", b"x").await.unwrap();

    assert_eq!(snapshot.get(b"key").await.unwrap().as_deref(), Some(&b"old"[..]));
    assert_eq!(snapshot.get(b"later").await.unwrap(), None);
    assert_eq!(db.get(b"key").await.unwrap().as_deref(), Some(&b"new"[..]));
}

#[tokio::test]
async fn test_snapshot_isolates_iterators() {
    let (_engine, db) = setup_open_database("mem/snap-iter").await;
    db.put(b"a", b"1").await.unwrap();
    db.put(b"b", b"2").await.unwrap();

    let snapshot = db.snapshot().unwrap();
    db.delete(b"a").await.unwrap();
    db.put(b"c", b"3").await.unwrap();

    let entries = snapshot
        .iterator(RangeOptions::new(), IteratorOptions::default())
        .unwrap()
        .collect()
        .await
        .unwrap();

    let keys: Vec<&[u8]> = entries.iter().map(|e| &e.key[..]).collect();
    assert_eq!(keys, [&b"a"[..], &b"b"[..]]);
}

#[tokio::test]
async fn test_snapshot_session_can_still_write() {
    let (_engine, db) = setup_open_database("mem/snap-write").await;

    let snapshot = db.snapshot().unwrap();
    snapshot.put(b"key", b"value").await.unwrap();

    // Writes go to the live database; snapshot reads do not see them
    assert_eq!(db.get(b"key").await.unwrap().as_deref(), Some(&b"value"[..]));
    assert_eq!(snapshot.get(b"key").await.unwrap(), None);
}

// =============================================================================
// Deferred Creation Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_before_open_is_created_at_open() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::new(engine.clone(), "mem/snap-deferred", DatabaseOptions::default()).unwrap();

    let snapshot = db.snapshot().unwrap();
    assert!(snapshot.snapshot_ref().unwrap().is_pending());
    assert_eq!(engine.stats().live_snapshots, 0);

    db.put(b"key", b"value").await.unwrap();

    let native = snapshot.snapshot_ref().unwrap();
    assert!(!native.is_pending());
    assert!(native.handle().is_some());
    assert_eq!(engine.stats().live_snapshots, 1);

    // Taken at open, before the put
    assert_eq!(snapshot.get(b"key").await.unwrap(), None);
}

// =============================================================================
// Reference Counting Tests
// =============================================================================

#[tokio::test]
async fn test_derived_sessions_share_snapshot() {
    let (engine, db) = setup_open_database("mem/snap-refs").await;

    let snapshot = db.snapshot().unwrap();
    let child = snapshot.session(SessionOptions::default()).unwrap();
    assert!(matches!(
        child.column_family("other"),
        Err(AtlasError::UnknownColumnFamily(_))
    ));

    let native = snapshot.snapshot_ref().unwrap().clone();
    assert_eq!(native.ref_count(), 2);
    assert_eq!(child.snapshot_ref().unwrap().handle(), native.handle());

    child.close().await.unwrap();
    assert_eq!(native.ref_count(), 1);
    assert!(!native.is_destroyed());

    snapshot.close().await.unwrap();
    assert!(native.is_destroyed());
    assert_eq!(engine.stats().live_snapshots, 0);
    assert_eq!(db.state().snapshot_count(), 0);
}

#[tokio::test]
async fn test_fresh_snapshot_from_snapshot_session() {
    let (engine, db) = setup_open_database("mem/snap-fresh").await;
    db.put(b"key", b"v1").await.unwrap();

    let first = db.snapshot().unwrap();
    db.put(b"key", b"v2").await.unwrap();
    let second = first.snapshot().unwrap();

    assert_eq!(first.get(b"key").await.unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(second.get(b"key").await.unwrap().as_deref(), Some(&b"v2"[..]));
    assert_eq!(engine.stats().live_snapshots, 2);
    assert_eq!(first.snapshot_ref().unwrap().ref_count(), 1);
}

#[tokio::test]
async fn test_dropped_snapshot_session_releases_snapshot() {
    let (engine, db) = setup_open_database("mem/snap-drop").await;

    {
        let _snapshot = db.snapshot().unwrap();
        assert_eq!(engine.stats().live_snapshots, 1);
    }

    assert_eq!(engine.stats().live_snapshots, 0);
}
