//! Tests for suspend / resume
//!
//! These tests verify:
//! - Suspend and resume are idempotent and coalesced
//! - Operations started while suspended wait for resume
//! - Close while suspended aborts waiting operations
//! - A failed resume leaves the database suspended

use std::sync::Arc;
use std::time::Duration;

use atlaskv_native::{
    AtlasError, BatchOptions, Database, DatabaseOptions, FlushOptions, IteratorOptions,
    MemoryEngine, Phase, RangeOptions,
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
// State Machine Tests
// =============================================================================

#[tokio::test]
async fn test_suspend_resume_round_trip() {
    let (engine, db) = setup_open_database("mem/sr-round-trip").await;
    assert_eq!(db.state().phase(), Phase::Resumed);

    db.suspend().await.unwrap();
    assert_eq!(db.state().phase(), Phase::Suspended);

    db.resume().await.unwrap();
    assert_eq!(db.state().phase(), Phase::Resumed);

    let stats = engine.stats();
    assert_eq!(stats.suspends, 1);
    assert_eq!(stats.resumes, 1);
}

#[tokio::test]
async fn test_suspend_and_resume_are_idempotent() {
    let (engine, db) = setup_open_database("mem/sr-idempotent").await;

    db.resume().await.unwrap();
    assert_eq!(engine.stats().resumes, 0);

    db.suspend().await.unwrap();
    db.suspend().await.unwrap();
    assert_eq!(engine.stats().suspends, 1);

    db.resume().await.unwrap();
    db.resume().await.unwrap();
    assert_eq!(engine.stats().resumes, 1);
}

#[tokio::test]
async fn test_concurrent_suspends_share_one_transition() {
    let (engine, db) = setup_open_database("mem/sr-coalesce").await;

    let (a, b) = tokio::join!(db.suspend(), db.suspend());
    a.unwrap();
    b.unwrap();
    assert_eq!(engine.stats().suspends, 1);

    let (a, b) = tokio::join!(db.resume(), db.resume());
    a.unwrap();
    b.unwrap();
    assert_eq!(engine.stats().resumes, 1);
}

#[tokio::test]
async fn test_resume_waits_for_running_suspend() {
    let (engine, db) = setup_open_database("mem/sr-ordered").await;

    let (suspended, resumed) = tokio::join!(db.suspend(), db.resume());
    suspended.unwrap();
    resumed.unwrap();

    assert_eq!(db.state().phase(), Phase::Resumed);
    assert_eq!(engine.stats().suspends, 1);
    assert_eq!(engine.stats().resumes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_transitions_on_many_threads() {
    let (_engine, db) = setup_open_database("mem/sr-threads").await;
    let state = db.state().clone();

    let mut tasks = Vec::new();
    for _ in 0..500 {
        let suspender = state.clone();
        tasks.push(tokio::spawn(async move { suspender.suspend().await }));
        let resumer = state.clone();
        tasks.push(tokio::spawn(async move { resumer.resume().await }));
    }

    let all = futures::future::join_all(tasks);
    let results = tokio::time::timeout(Duration::from_secs(30), all)
        .await
        .expect("suspend and resume deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    db.resume().await.unwrap();
    assert_eq!(db.state().phase(), Phase::Resumed);
    db.put(b"k", b"v").await.unwrap();
}

#[tokio::test]
async fn test_suspend_opens_first() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::new(engine.clone(), "mem/sr-unopened", DatabaseOptions::default()).unwrap();

    db.suspend().await.unwrap();

    assert!(db.is_opened());
    assert_eq!(db.state().phase(), Phase::Suspended);
    assert_eq!(engine.stats().opens, 1);
}

// =============================================================================
// Gating Tests
// =============================================================================

#[tokio::test]
async fn test_flush_waits_for_resume() {
    let (engine, db) = setup_open_database("mem/sr-gate").await;
    db.put(b"a", b"1").await.unwrap();
    db.suspend().await.unwrap();

    let batch = db.read(BatchOptions::default()).unwrap();
    let value = batch.get(b"a").unwrap();
    let reads_before = engine.stats().reads;

    let mut flush = Box::pin(batch.flush());
    assert!(futures::poll!(flush.as_mut()).is_pending());
    assert!(!db.is_idle());
    assert_eq!(engine.stats().reads, reads_before);

    db.resume().await.unwrap();
    flush.await.unwrap();

    assert_eq!(value.await.unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(engine.stats().reads, reads_before + 1);
}

#[tokio::test]
async fn test_write_waits_for_resume() {
    let (_engine, db) = setup_open_database("mem/sr-gate-write").await;
    db.suspend().await.unwrap();

    let mut put = Box::pin(db.put(b"k", b"v"));
    assert!(futures::poll!(put.as_mut()).is_pending());

    let (put, resumed) = tokio::join!(put, db.resume());
    put.unwrap();
    resumed.unwrap();

    assert_eq!(db.get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn test_iterator_pull_waits_for_resume() {
    let (_engine, db) = setup_open_database("mem/sr-gate-iterator").await;
    for key in ["a", "b", "c"] {
        db.put(key, key).await.unwrap();
    }

    let mut iterator = db
        .iterator(RangeOptions::new(), IteratorOptions::default().capacity(1))
        .unwrap();
    let first = iterator.next().await.unwrap().unwrap();
    assert_eq!(&first.key[..], b"a");

    db.suspend().await.unwrap();

    let mut next = Box::pin(iterator.next());
    assert!(futures::poll!(next.as_mut()).is_pending());

    db.resume().await.unwrap();
    let second = next.await.unwrap().unwrap();
    assert_eq!(&second.key[..], b"b");
}

#[tokio::test]
async fn test_maintenance_waits_for_resume() {
    let (engine, db) = setup_open_database("mem/sr-gate-flush").await;
    db.suspend().await.unwrap();

    let mut flush = Box::pin(db.flush(FlushOptions::default()));
    assert!(futures::poll!(flush.as_mut()).is_pending());
    assert_eq!(engine.stats().flushes, 0);

    db.resume().await.unwrap();
    flush.await.unwrap();
    assert_eq!(engine.stats().flushes, 1);
}

// =============================================================================
// Close While Suspended Tests
// =============================================================================

#[tokio::test]
async fn test_close_while_suspended_aborts_waiters() {
    let (_engine, db) = setup_open_database("mem/sr-close").await;
    db.suspend().await.unwrap();

    let batch = db.write(BatchOptions::default()).unwrap();
    let done = batch.put(b"k", b"v").unwrap();

    let mut flush = Box::pin(batch.flush());
    assert!(futures::poll!(flush.as_mut()).is_pending());

    // Close also waits for the batch itself to be destroyed
    let aborted = async {
        let flushed = flush.await;
        batch.destroy().unwrap();
        flushed
    };
    let (flushed, closed) = tokio::join!(aborted, db.close());

    let err = flushed.unwrap_err();
    assert_eq!(err, AtlasError::NotResumed);
    assert!(err.is_suspend_abort());
    assert_eq!(done.await.unwrap_err(), AtlasError::BatchDestroyed);
    closed.unwrap();
    assert!(db.state().is_closed());
}

#[tokio::test]
async fn test_suspend_after_close_fails() {
    let (_engine, db) = setup_open_database("mem/sr-after-close").await;
    db.close().await.unwrap();

    assert_eq!(db.state().suspend().await.unwrap_err(), AtlasError::DatabaseClosed);
    assert_eq!(db.state().resume().await.unwrap_err(), AtlasError::DatabaseClosed);
}

// =============================================================================
// Lock Handover Tests
// =============================================================================

#[tokio::test]
async fn test_suspended_database_releases_lock() {
    let engine = Arc::new(MemoryEngine::new());
    let first = Database::new(engine.clone(), "mem/sr-handover", DatabaseOptions::default()).unwrap();
    first.put(b"k", b"first").await.unwrap();
    first.suspend().await.unwrap();

    let second = Database::new(engine.clone(), "mem/sr-handover", DatabaseOptions::default()).unwrap();
    assert_eq!(second.get(b"k").await.unwrap().as_deref(), Some(&b"first"[..]));
    second.put(b"k", b"second").await.unwrap();

    // The lock now belongs to the second handle
    let err = first.resume().await.unwrap_err();
    match &err {
        AtlasError::Engine(msg) => assert!(msg.contains("LOCK")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(first.state().phase(), Phase::Suspended);

    second.close().await.unwrap();
    first.resume().await.unwrap();
    assert_eq!(first.get(b"k").await.unwrap().as_deref(), Some(&b"second"[..]));

    first.close().await.unwrap();
}
