//! Database Sessions
//!
//! [`Database`] is the handle callers hold. The handle returned by
//! [`Database::new`] is the root session; `session()`, `column_family()`
//! and `snapshot()` derive further sessions that share the same State but
//! may target another column family, read through a snapshot, or encode
//! keys and values differently.
//!
//! ```text
//!   Database (root) ──┬── column_family("logs") ──── snapshot()
//!                     └── session(Prefixed("users/"))
//!                             │
//!                             ▼
//!                       State (shared) ──► NativeEngine
//! ```
//!
//! Closing a derived session releases only that session. Closing the root
//! closes the whole database, and every session with it.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::batch::{BatchOptions, ReadBatch, WriteBatch};
use crate::codec::{Codec, Raw};
use crate::column_family::{ColumnFamily, ColumnFamilyRef};
use crate::config::DatabaseOptions;
use crate::engine::{ColumnFamilyHandle, NativeEngine, NativeRange, SizeOptions, SnapshotHandle};
use crate::error::{AtlasError, Result};
use crate::iterator::{DbIterator, Entry, IteratorOptions, RangeOptions};
use crate::refcounter::RefGuard;
use crate::snapshot::Snapshot;
use crate::state::State;

const UNREGISTERED: usize = usize::MAX;

// =============================================================================
// Options
// =============================================================================

/// Overrides for a derived session; unset fields inherit from the parent
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub column_family: Option<ColumnFamilyRef>,

    /// Read through a fresh snapshot instead of the parent's
    pub snapshot: bool,

    pub key_codec: Option<Arc<dyn Codec>>,
    pub value_codec: Option<Arc<dyn Codec>>,
}

impl SessionOptions {
    pub fn column_family(mut self, column_family: impl Into<ColumnFamilyRef>) -> Self {
        self.column_family = Some(column_family.into());
        self
    }

    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn key_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    pub fn value_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlushOptions {
    /// Defaults to the session's column family
    pub column_family: Option<ColumnFamilyRef>,
}

#[derive(Debug, Clone, Default)]
pub struct CompactRangeOptions {
    /// Defaults to the session's column family
    pub column_family: Option<ColumnFamilyRef>,

    /// Run as an exclusive manual compaction
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ApproximateSizeOptions {
    /// Defaults to the session's column family
    pub column_family: Option<ColumnFamilyRef>,

    pub size: SizeOptions,
}

// =============================================================================
// Session Internals
// =============================================================================

/// What batches and iterators need from the session that created them
pub(crate) struct SessionInner {
    state: Arc<State>,
    column_family: ColumnFamily,
    snapshot: Option<Snapshot>,
    key_codec: Arc<dyn Codec>,
    value_codec: Arc<dyn Codec>,
    root: bool,

    closed: AtomicBool,
    /// Position in the State's session list
    index: AtomicUsize,
    handle_ref: Mutex<Option<RefGuard>>,
}

impl SessionInner {
    pub(crate) fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn column_family_handle(&self) -> Result<ColumnFamilyHandle> {
        self.column_family
            .handle()
            .ok_or_else(|| AtlasError::UnknownColumnFamily(self.column_family.name().to_string()))
    }

    pub(crate) fn snapshot_handle(&self) -> Option<SnapshotHandle> {
        self.snapshot.as_ref().and_then(Snapshot::handle)
    }

    pub(crate) fn key_codec(&self) -> &Arc<dyn Codec> {
        &self.key_codec
    }

    pub(crate) fn value_codec(&self) -> &Arc<dyn Codec> {
        &self.value_codec
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::SeqCst);
    }

    pub(crate) fn take_index(&self) -> Option<usize> {
        match self.index.swap(UNREGISTERED, Ordering::SeqCst) {
            UNREGISTERED => None,
            index => Some(index),
        }
    }

    /// Close this session only. Idempotent.
    pub(crate) fn close_local(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state.remove_session(self);
        if let Some(snapshot) = &self.snapshot {
            snapshot.unref();
        }
        self.handle_ref.lock().take();

        tracing::trace!(column_family = self.column_family.name(), "session closed");
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to an embedded database
pub struct Database {
    inner: Arc<SessionInner>,
}

impl Database {
    /// Create a database at `path`. Nothing is opened until [`ready`] or
    /// the first operation.
    ///
    /// [`ready`]: Database::ready
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        path: impl AsRef<Path>,
        options: DatabaseOptions,
    ) -> Result<Self> {
        let state = State::new(engine, path, options)?;
        let column_family = state.default_column_family();
        Ok(Self::attach(
            state,
            column_family,
            None,
            Arc::new(Raw),
            Arc::new(Raw),
            true,
        ))
    }

    fn attach(
        state: Arc<State>,
        column_family: ColumnFamily,
        snapshot: Option<Snapshot>,
        key_codec: Arc<dyn Codec>,
        value_codec: Arc<dyn Codec>,
        root: bool,
    ) -> Self {
        let handle_ref = state.handles().acquire();
        let inner = Arc::new(SessionInner {
            state,
            column_family,
            snapshot,
            key_codec,
            value_codec,
            root,
            closed: AtomicBool::new(false),
            index: AtomicUsize::new(UNREGISTERED),
            handle_ref: Mutex::new(Some(handle_ref)),
        });
        inner.state.add_session(&inner);

        Self { inner }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(AtlasError::SessionClosed);
        }
        if self.inner.state.is_closing() {
            return Err(AtlasError::DatabaseClosed);
        }
        Ok(())
    }

    /// Io guard for a direct engine call, taken once the database is open
    /// and resumed
    async fn enter(&self) -> Result<RefGuard> {
        self.check_open()?;

        let state = &self.inner.state;
        let io = state.io_guard()?;
        state.ready().await?;
        if !state.wait_resumed().await {
            return Err(AtlasError::NotResumed);
        }
        Ok(io)
    }

    fn resolve_column_family(&self, selector: Option<&ColumnFamilyRef>) -> Result<ColumnFamily> {
        match selector {
            Some(selector) => self.inner.state.column_family(selector),
            None => Ok(self.inner.column_family.clone()),
        }
    }

    fn bound_handle(family: &ColumnFamily) -> Result<ColumnFamilyHandle> {
        family
            .handle()
            .ok_or_else(|| AtlasError::UnknownColumnFamily(family.name().to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the database if it is not open yet
    pub async fn ready(&self) -> Result<()> {
        self.check_open()?;
        self.inner.state.ready().await
    }

    /// Close this session. On the root session this closes the database and
    /// every session derived from it.
    pub async fn close(&self) -> Result<()> {
        if self.inner.root {
            self.inner.state.close().await
        } else {
            self.inner.close_local();
            Ok(())
        }
    }

    pub fn is_opened(&self) -> bool {
        self.inner.state.is_opened()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_root(&self) -> bool {
        self.inner.root
    }

    pub fn path(&self) -> &Path {
        self.inner.state.path()
    }

    /// The State shared by every session of this database
    pub fn state(&self) -> &Arc<State> {
        &self.inner.state
    }

    /// Column family this session targets
    pub fn column_family_descriptor(&self) -> &ColumnFamily {
        &self.inner.column_family
    }

    /// Snapshot this session reads through, if any
    pub fn snapshot_ref(&self) -> Option<&Snapshot> {
        self.inner.snapshot.as_ref()
    }

    // =========================================================================
    // Derived Sessions
    // =========================================================================

    /// Derive a session sharing this database
    pub fn session(&self, options: SessionOptions) -> Result<Database> {
        self.check_open()?;

        let column_family = self.resolve_column_family(options.column_family.as_ref())?;

        let snapshot = if options.snapshot {
            Some(self.inner.state.create_snapshot())
        } else {
            self.inner.snapshot.clone().map(|snapshot| {
                snapshot.add_ref();
                snapshot
            })
        };

        Ok(Self::attach(
            Arc::clone(&self.inner.state),
            column_family,
            snapshot,
            options
                .key_codec
                .unwrap_or_else(|| Arc::clone(&self.inner.key_codec)),
            options
                .value_codec
                .unwrap_or_else(|| Arc::clone(&self.inner.value_codec)),
            false,
        ))
    }

    /// Session targeting another column family. Unknown names are created
    /// with the default tuning until the database opens.
    pub fn column_family(&self, column_family: impl Into<ColumnFamilyRef>) -> Result<Database> {
        self.session(SessionOptions::default().column_family(column_family))
    }

    /// Session reading through a new point-in-time snapshot
    pub fn snapshot(&self) -> Result<Database> {
        self.session(SessionOptions::default().snapshot(true))
    }

    // =========================================================================
    // Batches
    // =========================================================================

    pub fn read(&self, options: BatchOptions) -> Result<ReadBatch> {
        self.check_open()?;
        Ok(self
            .inner
            .state
            .create_read_batch(Arc::clone(&self.inner), options))
    }

    pub fn write(&self, options: BatchOptions) -> Result<WriteBatch> {
        self.check_open()?;
        Ok(self
            .inner
            .state
            .create_write_batch(Arc::clone(&self.inner), options))
    }

    fn single() -> BatchOptions {
        BatchOptions::default().capacity(1).auto_destroy(true)
    }

    /// Read one key; `None` if absent
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let batch = self.read(Self::single())?;
        let value = batch.get(key)?;
        batch.flush().await?;
        value.await
    }

    /// Read several keys in one native call
    pub async fn get_many<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Option<Bytes>>> {
        let batch = self.read(
            BatchOptions::default()
                .capacity(keys.len())
                .auto_destroy(true),
        )?;
        let pending = keys
            .iter()
            .map(|key| batch.get(key))
            .collect::<Result<Vec<_>>>()?;
        batch.flush().await?;

        let mut values = Vec::with_capacity(pending.len());
        for value in pending {
            values.push(value.await?);
        }
        Ok(values)
    }

    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(Self::single())?;
        let done = batch.put(key, value)?;
        Self::applied(batch.flush().await, done).await
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(Self::single())?;
        let done = batch.delete(key)?;
        Self::applied(batch.flush().await, done).await
    }

    /// Remove every key in `[start, end)`
    pub async fn delete_range(&self, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(Self::single())?;
        let done = batch.delete_range(start, end)?;
        Self::applied(batch.flush().await, done).await
    }

    /// Surface the engine's own message when a single-op write fails
    async fn applied(flushed: Result<()>, done: crate::batch::Pending<()>) -> Result<()> {
        match flushed {
            Ok(()) | Err(AtlasError::BatchNotApplied(_)) => done.await,
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    fn encode_range(&self, range: &RangeOptions) -> Result<NativeRange> {
        let codec = &self.inner.key_codec;
        let encode = |key: &Option<Bytes>| key.as_ref().map(|k| codec.encode(k)).transpose();

        let mut native = NativeRange {
            gt: encode(&range.gt)?,
            gte: encode(&range.gte)?,
            lt: encode(&range.lt)?,
            lte: encode(&range.lte)?,
        };

        // Unset sides stay inside the codec's keyspace
        let (lower, upper) = codec.bounds();
        if native.gt.is_none() && native.gte.is_none() {
            native.gte = lower;
        }
        if native.lt.is_none() && native.lte.is_none() {
            native.lt = upper;
        }

        Ok(native)
    }

    /// Cursor over `range` in this session's column family
    pub fn iterator(&self, range: RangeOptions, options: IteratorOptions) -> Result<DbIterator> {
        self.check_open()?;
        let range = self.encode_range(&range)?;
        Ok(DbIterator::new(Arc::clone(&self.inner), range, options))
    }

    /// Cursor yielding keys with empty values
    pub fn key_iterator(&self, range: RangeOptions, options: IteratorOptions) -> Result<DbIterator> {
        self.iterator(range, options.keys_only(true))
    }

    /// First entry of `range`, if any
    pub async fn peek(&self, range: RangeOptions, options: IteratorOptions) -> Result<Option<Entry>> {
        let mut iterator = self.iterator(range, options.limit(1).capacity(1))?;
        let entry = iterator.next().await.transpose();
        let closed = iterator.close().await;

        let entry = entry?;
        closed?;
        Ok(entry)
    }

    // =========================================================================
    // Suspension and Idle Tracking
    // =========================================================================

    pub async fn suspend(&self) -> Result<()> {
        self.check_open()?;
        self.inner.state.suspend().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.check_open()?;
        self.inner.state.resume().await
    }

    /// True when no native I/O is in flight
    pub fn is_idle(&self) -> bool {
        self.inner.state.io().is_idle()
    }

    /// Resolve once no native I/O is in flight
    pub async fn idle(&self) {
        self.inner.state.io().idle().await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flush memtables of a column family to disk
    pub async fn flush(&self, options: FlushOptions) -> Result<()> {
        let family = self.resolve_column_family(options.column_family.as_ref())?;
        let _io = self.enter().await?;
        let state = &self.inner.state;

        state
            .engine()
            .flush(state.db_handle(), Self::bound_handle(&family)?)
            .await
            .map_err(AtlasError::Engine)
    }

    /// Compact `[start, end]`; an unset side covers the session's keyspace
    pub async fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: CompactRangeOptions,
    ) -> Result<()> {
        let family = self.resolve_column_family(options.column_family.as_ref())?;

        let codec = &self.inner.key_codec;
        let (lower, upper) = codec.bounds();
        let start = match start {
            Some(key) => Some(codec.encode(key)?),
            None => lower,
        };
        let end = match end {
            Some(key) => Some(codec.encode(key)?),
            None => upper,
        };

        let _io = self.enter().await?;
        let state = &self.inner.state;

        state
            .engine()
            .compact_range(
                state.db_handle(),
                Self::bound_handle(&family)?,
                start,
                end,
                options.exclusive,
            )
            .await
            .map_err(AtlasError::Engine)
    }

    /// Estimated on-disk bytes used by keys in `[start, end)`
    pub async fn approximate_size(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
        options: ApproximateSizeOptions,
    ) -> Result<u64> {
        let family = self.resolve_column_family(options.column_family.as_ref())?;

        let codec = &self.inner.key_codec;
        let start = codec.encode(start.as_ref())?;
        let end = codec.encode(end.as_ref())?;

        let _io = self.enter().await?;
        let state = &self.inner.state;

        state
            .engine()
            .approximate_size(
                state.db_handle(),
                Self::bound_handle(&family)?,
                start,
                end,
                options.size,
            )
            .await
            .map_err(AtlasError::Engine)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.inner.is_closed() {
            return;
        }

        if !self.inner.root {
            self.inner.close_local();
            return;
        }

        let state = Arc::clone(&self.inner.state);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = state.close().await {
                        tracing::warn!(error = %err, "close on drop failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    path = %state.path().display(),
                    "database dropped outside a runtime without close"
                );
                self.inner.close_local();
            }
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.state.path())
            .field("column_family", &self.inner.column_family.name())
            .field("root", &self.inner.root)
            .field("snapshot", &self.inner.snapshot.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
