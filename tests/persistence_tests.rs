//! Tests for the persistent memory engine
//!
//! These tests verify:
//! - Data and column families survive close and reopen
//! - Suspend leaves a readable image behind
//! - Corrupt images are reported, not loaded
//! - create_if_missing against an empty directory

use std::fs;
use std::sync::Arc;

use atlaskv_native::{AtlasError, Database, DatabaseOptions, FlushOptions, MemoryEngine};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_persistent(dir: &TempDir, options: DatabaseOptions) -> Database {
    let engine = Arc::new(MemoryEngine::persistent());
    Database::new(engine, dir.path().join("db"), options).unwrap()
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[tokio::test]
async fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    db.put(b"hello", b"world").await.unwrap();
    db.put(b"gone", b"soon").await.unwrap();
    db.delete(b"gone").await.unwrap();
    db.close().await.unwrap();

    assert!(temp_dir.path().join("db").join("IMAGE").is_file());

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    assert_eq!(db.get(b"hello").await.unwrap().as_deref(), Some(&b"world"[..]));
    assert_eq!(db.get(b"gone").await.unwrap(), None);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_column_families_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    let logs = db.column_family("logs").unwrap();
    logs.put(b"k", b"log").await.unwrap();
    db.close().await.unwrap();

    // The family exists now, so it opens without create_missing_column_families
    let options = DatabaseOptions::builder()
        .create_missing_column_families(false)
        .column_family_named("logs")
        .build();
    let db = open_persistent(&temp_dir, options);
    let logs = db.column_family("logs").unwrap();
    assert_eq!(logs.get(b"k").await.unwrap().as_deref(), Some(&b"log"[..]));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_writes_image() {
    let temp_dir = TempDir::new().unwrap();
    let image = temp_dir.path().join("db").join("IMAGE");

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    db.put(b"k", b"v").await.unwrap();
    assert!(!image.exists());

    db.flush(FlushOptions::default()).await.unwrap();
    assert!(image.is_file());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_suspended_image_is_readable_elsewhere() {
    let temp_dir = TempDir::new().unwrap();

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    db.put(b"k", b"v").await.unwrap();
    db.suspend().await.unwrap();

    // A separate engine instance stands in for another process
    let options = DatabaseOptions::builder().read_only(true).build();
    let other = open_persistent(&temp_dir, options);
    assert_eq!(other.get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));

    other.close().await.unwrap();
    db.close().await.unwrap();
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_corrupt_image_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("db");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("IMAGE"), vec![0xabu8; 64]).unwrap();

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    let err = db.ready().await.unwrap_err();

    match err {
        AtlasError::Engine(msg) => assert!(msg.starts_with("Corruption")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_length_field_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("db");
    fs::create_dir_all(&dir).unwrap();

    let mut raw = Vec::new();
    raw.extend_from_slice(b"ATKN");
    raw.extend_from_slice(&1u16.to_le_bytes());
    raw.extend_from_slice(&u64::MAX.to_le_bytes());
    raw.extend_from_slice(&0u32.to_le_bytes());
    fs::write(dir.join("IMAGE"), raw).unwrap();

    let db = open_persistent(&temp_dir, DatabaseOptions::default());
    let err = db.ready().await.unwrap_err();

    match err {
        AtlasError::Engine(msg) => assert!(msg.starts_with("Corruption")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_directory_without_create() {
    let temp_dir = TempDir::new().unwrap();

    let options = DatabaseOptions::builder().create_if_missing(false).build();
    let db = open_persistent(&temp_dir, options);
    let err = db.ready().await.unwrap_err();

    match err {
        AtlasError::Engine(msg) => assert!(msg.contains("create_if_missing is false")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!temp_dir.path().join("db").exists());
}
