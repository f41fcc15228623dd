//! Engine Module
//!
//! The native call boundary. Everything above this module (State, sessions,
//! batches, iterators) reaches the storage engine only through the
//! [`NativeEngine`] trait.
//!
//! ## Responsibilities
//! - Define the opaque handle types the engine hands out
//! - Define the operation records submitted in one batched call
//! - Define the fixed set of entry points an engine binding must provide
//!
//! ## Completion Model
//! Synchronous entry points allocate or release resources. Asynchronous
//! entry points model a request whose completion callback fires exactly
//! once; the returned future resolves with that completion. Errors cross the
//! boundary as opaque strings and are wrapped by the caller.

pub mod memory;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::column_family::ColumnFamilyOptions;
use crate::config::EngineOptions;

pub use memory::{EngineStats, MemoryEngine};

/// Result of a native call: engine errors are opaque strings
pub type NativeResult<T> = std::result::Result<T, String>;

// =============================================================================
// Opaque Handles
// =============================================================================

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

native_handle!(
    /// Database instance handle, valid from `init` until `close` completes
    DbHandle
);
native_handle!(
    /// Column family handle, bound to a database on `open`
    ColumnFamilyHandle
);
native_handle!(
    /// Point-in-time view handle
    SnapshotHandle
);
native_handle!(
    /// Read or write batch buffer handle
    BatchHandle
);
native_handle!(
    /// Iterator cursor handle
    IteratorHandle
);

// =============================================================================
// Operation Records
// =============================================================================

/// One keyed read inside a read batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOp {
    Get {
        column_family: ColumnFamilyHandle,
        key: Bytes,
    },
}

/// One keyed mutation inside a write batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column_family: ColumnFamilyHandle,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        column_family: ColumnFamilyHandle,
        key: Bytes,
    },
    /// Removes every key in `[start, end)`
    DeleteRange {
        column_family: ColumnFamilyHandle,
        start: Bytes,
        end: Bytes,
    },
}

/// Key range in engine encoding. `gt` wins over `gte`, `lt` over `lte`;
/// `None` on both sides of a bound means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeRange {
    pub gt: Option<Bytes>,
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub lte: Option<Bytes>,
}

/// Options for opening an iterator cursor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeIteratorOptions {
    pub reverse: bool,
    pub keys_only: bool,
    pub snapshot: Option<SnapshotHandle>,
}

/// Options for an approximate size query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeOptions {
    pub include_memtables: bool,
    pub include_files: bool,
    pub files_size_error_margin: f64,
}

impl Default for SizeOptions {
    fn default() -> Self {
        Self {
            include_memtables: false,
            include_files: true,
            files_size_error_margin: -1.0,
        }
    }
}

// =============================================================================
// Native Entry Points
// =============================================================================

/// The fixed set of entry points an embedded engine binding provides
#[async_trait]
pub trait NativeEngine: Send + Sync + 'static {
    // -------------------------------------------------------------------------
    // Database Lifecycle
    // -------------------------------------------------------------------------

    /// Allocate a database instance with the given options
    fn init(&self, options: &EngineOptions) -> DbHandle;

    /// Open the database at `path` with the given column families bound
    async fn open(
        &self,
        db: DbHandle,
        path: &Path,
        column_families: &[ColumnFamilyHandle],
    ) -> NativeResult<()>;

    /// Close the database and release the instance
    async fn close(&self, db: DbHandle) -> NativeResult<()>;

    /// Release file handles and locks, pausing all I/O
    async fn suspend(&self, db: DbHandle) -> NativeResult<()>;

    /// Re-acquire what `suspend` released
    async fn resume(&self, db: DbHandle) -> NativeResult<()>;

    // -------------------------------------------------------------------------
    // Column Families and Snapshots
    // -------------------------------------------------------------------------

    fn column_family_init(&self, name: &str, options: &ColumnFamilyOptions) -> ColumnFamilyHandle;

    fn column_family_destroy(&self, column_family: ColumnFamilyHandle);

    fn snapshot_create(&self, db: DbHandle) -> SnapshotHandle;

    fn snapshot_destroy(&self, snapshot: SnapshotHandle);

    // -------------------------------------------------------------------------
    // Batches
    // -------------------------------------------------------------------------

    fn read_init(&self) -> BatchHandle;

    fn write_init(&self) -> BatchHandle;

    /// (Re)allocate the batch's operation buffer for `capacity` operations
    fn batch_buffer(&self, batch: BatchHandle, capacity: usize);

    fn batch_destroy(&self, batch: BatchHandle);

    /// Execute every read in one call. One result per operation, in order;
    /// a zero-length value means the key is absent.
    async fn read(
        &self,
        db: DbHandle,
        batch: BatchHandle,
        ops: Vec<ReadOp>,
        snapshot: Option<SnapshotHandle>,
    ) -> Vec<NativeResult<Bytes>>;

    /// Apply every mutation atomically in one call
    async fn write(&self, db: DbHandle, batch: BatchHandle, ops: Vec<WriteOp>) -> NativeResult<()>;

    // -------------------------------------------------------------------------
    // Iterators
    // -------------------------------------------------------------------------

    fn iterator_init(&self) -> IteratorHandle;

    /// (Re)allocate the iterator's entry buffer for `capacity` entries
    fn iterator_buffer(&self, iterator: IteratorHandle, capacity: usize);

    async fn iterator_open(
        &self,
        db: DbHandle,
        iterator: IteratorHandle,
        column_family: ColumnFamilyHandle,
        range: NativeRange,
        options: NativeIteratorOptions,
    ) -> NativeResult<()>;

    /// Read up to `count` entries. Fewer than `count` means the range is
    /// exhausted.
    async fn iterator_read(
        &self,
        iterator: IteratorHandle,
        count: usize,
    ) -> NativeResult<Vec<(Bytes, Bytes)>>;

    async fn iterator_close(&self, iterator: IteratorHandle) -> NativeResult<()>;

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    async fn flush(&self, db: DbHandle, column_family: ColumnFamilyHandle) -> NativeResult<()>;

    async fn compact_range(
        &self,
        db: DbHandle,
        column_family: ColumnFamilyHandle,
        start: Option<Bytes>,
        end: Option<Bytes>,
        exclusive: bool,
    ) -> NativeResult<()>;

    async fn approximate_size(
        &self,
        db: DbHandle,
        column_family: ColumnFamilyHandle,
        start: Bytes,
        end: Bytes,
        options: SizeOptions,
    ) -> NativeResult<u64>;
}
