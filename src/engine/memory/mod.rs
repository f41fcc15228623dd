//! Memory Engine
//!
//! Reference [`NativeEngine`] keeping every column family in an ordered
//! in-memory table. Used by the test suite and by hosts that want the
//! coordination layer without a native library.
//!
//! ## Behaviour
//! - One store per database path, shared by every handle opened on it
//! - A read-write open takes the path's write lock; `suspend` releases it
//!   and `resume` takes it back (failing if another handle grabbed it)
//! - Snapshots and iterator cursors pin a copy-on-write view of the tables
//! - `MemoryEngine::persistent()` writes a checksummed image on `flush`,
//!   `suspend` and `close`, and loads it on `open`
//!
//! Every asynchronous entry point yields once before completing, so
//! completions are always observed after the call that issued them.

mod image;
mod table;

pub use table::{KeyRange, Table};

use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    BatchHandle, ColumnFamilyHandle, DbHandle, IteratorHandle, NativeEngine,
    NativeIteratorOptions, NativeRange, NativeResult, ReadOp, SizeOptions, SnapshotHandle,
    WriteOp,
};
use crate::column_family::{ColumnFamilyOptions, DEFAULT_COLUMN_FAMILY};
use crate::config::EngineOptions;

/// Counters describing the work an engine has done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub opens: u64,
    pub reads: u64,
    pub writes: u64,
    pub batch_resizes: u64,
    pub iterator_reads: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub suspends: u64,
    pub resumes: u64,

    /// Batch handles currently allocated
    pub live_batches: usize,
    /// Iterator handles currently allocated
    pub live_iterators: usize,
    /// Snapshot handles currently allocated
    pub live_snapshots: usize,
    /// Column family handles currently allocated
    pub live_column_families: usize,
}

/// In-memory storage engine
pub struct MemoryEngine {
    persistent: bool,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    databases: HashMap<u64, DbSlot>,
    column_families: HashMap<u64, CfSlot>,
    snapshots: HashMap<u64, HashMap<String, Table>>,
    batches: HashMap<u64, BatchSlot>,
    iterators: HashMap<u64, IteratorSlot>,
    stores: HashMap<PathBuf, Store>,
    stats: EngineStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbStatus {
    Init,
    Open,
    Suspended,
}

struct DbSlot {
    options: EngineOptions,
    path: Option<PathBuf>,
    status: DbStatus,
}

struct CfSlot {
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Read,
    Write,
}

struct BatchSlot {
    kind: BatchKind,
    capacity: usize,
}

struct IteratorSlot {
    capacity: usize,
    cursor: Option<Cursor>,
}

struct Cursor {
    db: u64,
    table: Table,
    range: KeyRange,
    reverse: bool,
    keys_only: bool,
    last: Option<Bytes>,
    done: bool,
}

#[derive(Default)]
struct Store {
    tables: HashMap<String, Table>,
    writer: Option<u64>,
    open_handles: usize,
}

impl MemoryEngine {
    /// Volatile engine: stores live as long as the engine
    pub fn new() -> Self {
        Self {
            persistent: false,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Engine that mirrors every store to an image under its path
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Snapshot of the engine's counters
    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.lock();
        EngineStats {
            live_batches: inner.batches.len(),
            live_iterators: inner.iterators.len(),
            live_snapshots: inner.snapshots.len(),
            live_column_families: inner.column_families.len(),
            ..inner.stats
        }
    }

    /// Capacity of a batch buffer, if the handle is live
    pub fn batch_capacity(&self, batch: BatchHandle) -> Option<usize> {
        self.inner.lock().batches.get(&batch.0).map(|b| b.capacity)
    }

    /// Capacity of an iterator buffer, if the handle is live
    pub fn iterator_capacity(&self, iterator: IteratorHandle) -> Option<usize> {
        self.inner.lock().iterators.get(&iterator.0).map(|i| i.capacity)
    }

    fn persist(&self, path: &Path, tables: &HashMap<String, Table>) -> NativeResult<()> {
        if !self.persistent {
            return Ok(());
        }
        image::write(path, tables).map_err(io_error)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Path of a database that is open and not suspended
    fn active_path(&self, db: DbHandle) -> NativeResult<PathBuf> {
        let slot = self
            .databases
            .get(&db.0)
            .ok_or_else(|| "Invalid argument: Unknown database handle".to_string())?;

        match (slot.status, &slot.path) {
            (DbStatus::Open, Some(path)) => Ok(path.clone()),
            (DbStatus::Suspended, _) => Err(suspended()),
            _ => Err("Invalid argument: Database is not open".to_string()),
        }
    }

    fn column_family_name(&self, column_family: ColumnFamilyHandle) -> NativeResult<&str> {
        self.column_families
            .get(&column_family.0)
            .map(|cf| cf.name.as_str())
            .ok_or_else(|| "Invalid argument: Invalid column family".to_string())
    }

    fn table(&self, path: &Path, column_family: ColumnFamilyHandle) -> NativeResult<&Table> {
        let name = self.column_family_name(column_family)?;
        self.stores
            .get(path)
            .and_then(|store| store.tables.get(name))
            .ok_or_else(|| format!("Invalid argument: Column family not found: {}", name))
    }
}

fn fail_all(err: String, n: usize) -> Vec<NativeResult<Bytes>> {
    (0..n).map(|_| Err(err.clone())).collect()
}

fn suspended() -> String {
    "Invalid argument: Database is suspended".to_string()
}

fn lock_error(path: &Path) -> String {
    format!(
        "IO error: While lock file: {}/LOCK: Resource temporarily unavailable",
        path.display()
    )
}

fn io_error(err: std::io::Error) -> String {
    let msg = err.to_string();
    if msg.starts_with("Corruption") {
        msg
    } else {
        format!("IO error: {}", msg)
    }
}

#[async_trait]
impl NativeEngine for MemoryEngine {
    // =========================================================================
    // Database Lifecycle
    // =========================================================================

    fn init(&self, options: &EngineOptions) -> DbHandle {
        let mut inner = self.inner.lock();
        let id = inner.alloc();
        inner.databases.insert(
            id,
            DbSlot {
                options: options.clone(),
                path: None,
                status: DbStatus::Init,
            },
        );
        DbHandle(id)
    }

    async fn open(
        &self,
        db: DbHandle,
        path: &Path,
        column_families: &[ColumnFamilyHandle],
    ) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let options = match inner.databases.get(&db.0) {
            Some(slot) if slot.status == DbStatus::Init => slot.options.clone(),
            Some(_) => return Err("Invalid argument: Database is already open".to_string()),
            None => return Err("Invalid argument: Unknown database handle".to_string()),
        };

        let mut names = Vec::with_capacity(column_families.len());
        for handle in column_families {
            names.push(inner.column_family_name(*handle)?.to_string());
        }

        // Load or create the store unless another handle already has it live
        let live = inner
            .stores
            .get(path)
            .map(|s| s.open_handles > 0 || !self.persistent)
            .unwrap_or(false);

        let mut created = false;
        if !live {
            let loaded = if self.persistent {
                image::read(path).map_err(io_error)?
            } else {
                None
            };

            match loaded {
                Some(tables) => {
                    let store = inner.stores.entry(path.to_path_buf()).or_default();
                    store.tables = tables;
                }
                None if options.create_if_missing => {
                    if self.persistent {
                        std::fs::create_dir_all(path).map_err(io_error)?;
                    }
                    let store = inner.stores.entry(path.to_path_buf()).or_default();
                    store.tables.clear();
                    created = true;
                }
                None => {
                    return Err(format!(
                        "Invalid argument: {}: does not exist (create_if_missing is false)",
                        path.display()
                    ));
                }
            }
        }

        let store = inner.stores.entry(path.to_path_buf()).or_default();

        if !options.read_only {
            if let Some(writer) = store.writer {
                if writer != db.0 {
                    return Err(lock_error(path));
                }
            }
        }

        for name in &names {
            if store.tables.contains_key(name) {
                continue;
            }
            let fresh_default = created && name == DEFAULT_COLUMN_FAMILY;
            if !fresh_default && !options.create_missing_column_families {
                return Err(format!(
                    "Invalid argument: Column family not found: {}",
                    name
                ));
            }
            if options.read_only {
                return Err(format!(
                    "Invalid argument: Column family not found: {}",
                    name
                ));
            }
            store.tables.insert(name.clone(), Table::new());
        }

        if !options.read_only {
            store.writer = Some(db.0);
        }
        store.open_handles += 1;

        if let Some(slot) = inner.databases.get_mut(&db.0) {
            slot.path = Some(path.to_path_buf());
            slot.status = DbStatus::Open;
        }
        inner.stats.opens += 1;

        tracing::debug!(
            db = db.0,
            path = %path.display(),
            read_only = options.read_only,
            "memory engine opened"
        );
        Ok(())
    }

    async fn close(&self, db: DbHandle) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let slot = match inner.databases.remove(&db.0) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        inner
            .iterators
            .retain(|_, it| it.cursor.as_ref().map(|c| c.db != db.0).unwrap_or(true));

        let path = match (slot.status, slot.path) {
            (DbStatus::Open | DbStatus::Suspended, Some(path)) => path,
            _ => return Ok(()),
        };

        let mut result = Ok(());
        if let Some(store) = inner.stores.get_mut(&path) {
            if store.writer == Some(db.0) {
                store.writer = None;
            }
            store.open_handles = store.open_handles.saturating_sub(1);

            if !slot.options.read_only {
                result = self.persist(&path, &store.tables);
            }
        }

        tracing::debug!(db = db.0, path = %path.display(), "memory engine closed");
        result
    }

    async fn suspend(&self, db: DbHandle) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let (path, read_only) = match inner.databases.get(&db.0) {
            Some(slot) if slot.status == DbStatus::Suspended => return Ok(()),
            Some(DbSlot {
                status: DbStatus::Open,
                path: Some(path),
                options,
            }) => (path.clone(), options.read_only),
            _ => return Err("Invalid argument: Database is not open".to_string()),
        };

        if let Some(store) = inner.stores.get_mut(&path) {
            if !read_only {
                self.persist(&path, &store.tables)?;
            }
            if store.writer == Some(db.0) {
                store.writer = None;
            }
        }

        if let Some(slot) = inner.databases.get_mut(&db.0) {
            slot.status = DbStatus::Suspended;
        }
        inner.stats.suspends += 1;

        Ok(())
    }

    async fn resume(&self, db: DbHandle) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let (path, read_only) = match inner.databases.get(&db.0) {
            Some(slot) if slot.status == DbStatus::Open => return Ok(()),
            Some(DbSlot {
                status: DbStatus::Suspended,
                path: Some(path),
                options,
            }) => (path.clone(), options.read_only),
            _ => return Err("Invalid argument: Database is not open".to_string()),
        };

        if !read_only {
            let store = inner.stores.entry(path.clone()).or_default();
            match store.writer {
                Some(other) if other != db.0 => return Err(lock_error(&path)),
                _ => store.writer = Some(db.0),
            }
        }

        if let Some(slot) = inner.databases.get_mut(&db.0) {
            slot.status = DbStatus::Open;
        }
        inner.stats.resumes += 1;

        Ok(())
    }

    // =========================================================================
    // Column Families and Snapshots
    // =========================================================================

    fn column_family_init(&self, name: &str, _options: &ColumnFamilyOptions) -> ColumnFamilyHandle {
        let mut inner = self.inner.lock();
        let id = inner.alloc();
        inner.column_families.insert(
            id,
            CfSlot {
                name: name.to_string(),
            },
        );
        ColumnFamilyHandle(id)
    }

    fn column_family_destroy(&self, column_family: ColumnFamilyHandle) {
        self.inner.lock().column_families.remove(&column_family.0);
    }

    fn snapshot_create(&self, db: DbHandle) -> SnapshotHandle {
        let mut inner = self.inner.lock();

        let view = inner
            .databases
            .get(&db.0)
            .and_then(|slot| slot.path.as_ref())
            .and_then(|path| inner.stores.get(path))
            .map(|store| store.tables.clone())
            .unwrap_or_default();

        let id = inner.alloc();
        inner.snapshots.insert(id, view);
        SnapshotHandle(id)
    }

    fn snapshot_destroy(&self, snapshot: SnapshotHandle) {
        self.inner.lock().snapshots.remove(&snapshot.0);
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn read_init(&self) -> BatchHandle {
        let mut inner = self.inner.lock();
        let id = inner.alloc();
        inner.batches.insert(
            id,
            BatchSlot {
                kind: BatchKind::Read,
                capacity: 0,
            },
        );
        BatchHandle(id)
    }

    fn write_init(&self) -> BatchHandle {
        let mut inner = self.inner.lock();
        let id = inner.alloc();
        inner.batches.insert(
            id,
            BatchSlot {
                kind: BatchKind::Write,
                capacity: 0,
            },
        );
        BatchHandle(id)
    }

    fn batch_buffer(&self, batch: BatchHandle, capacity: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(slot) = inner.batches.get_mut(&batch.0) {
            slot.capacity = capacity;
            inner.stats.batch_resizes += 1;
        }
    }

    fn batch_destroy(&self, batch: BatchHandle) {
        self.inner.lock().batches.remove(&batch.0);
    }

    async fn read(
        &self,
        db: DbHandle,
        batch: BatchHandle,
        ops: Vec<ReadOp>,
        snapshot: Option<SnapshotHandle>,
    ) -> Vec<NativeResult<Bytes>> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        match inner.batches.get(&batch.0) {
            Some(slot) if slot.kind == BatchKind::Read => {}
            _ => return fail_all("Invalid argument: Invalid read batch".to_string(), ops.len()),
        }

        let path = match inner.active_path(db) {
            Ok(path) => path,
            Err(err) => return fail_all(err, ops.len()),
        };

        let view = match snapshot {
            Some(handle) => match inner.snapshots.get(&handle.0) {
                Some(view) => Some(view),
                None => {
                    return fail_all("Invalid argument: Invalid snapshot".to_string(), ops.len())
                }
            },
            None => None,
        };

        let results: Vec<NativeResult<Bytes>> = ops
            .iter()
            .map(|op| match op {
                ReadOp::Get { column_family, key } => {
                    let table = match view {
                        Some(view) => {
                            let name = inner.column_family_name(*column_family)?;
                            view.get(name)
                        }
                        None => Some(inner.table(&path, *column_family)?),
                    };
                    Ok(table.and_then(|t| t.get(key)).unwrap_or_default())
                }
            })
            .collect();

        inner.stats.reads += 1;
        results
    }

    async fn write(&self, db: DbHandle, batch: BatchHandle, ops: Vec<WriteOp>) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        match inner.batches.get(&batch.0) {
            Some(slot) if slot.kind == BatchKind::Write => {}
            _ => return Err("Invalid argument: Invalid write batch".to_string()),
        }

        let path = inner.active_path(db)?;

        if inner
            .databases
            .get(&db.0)
            .map(|slot| slot.options.read_only)
            .unwrap_or(false)
        {
            return Err("Not supported operation in read-only mode".to_string());
        }

        // Resolve every column family first so the batch applies all or nothing
        let mut resolved = Vec::with_capacity(ops.len());
        for op in ops {
            let column_family = match &op {
                WriteOp::Put { column_family, .. }
                | WriteOp::Delete { column_family, .. }
                | WriteOp::DeleteRange { column_family, .. } => *column_family,
            };
            inner.table(&path, column_family)?;
            let name = inner.column_family_name(column_family)?.to_string();
            resolved.push((name, op));
        }

        let store = inner
            .stores
            .get_mut(&path)
            .ok_or_else(|| "Invalid argument: Database is not open".to_string())?;

        for (name, op) in resolved {
            let Some(table) = store.tables.get_mut(&name) else {
                continue;
            };
            match op {
                WriteOp::Put { key, value, .. } => table.put(key, value),
                WriteOp::Delete { key, .. } => table.delete(&key),
                WriteOp::DeleteRange { start, end, .. } => table.delete_range(&start, &end),
            }
        }

        inner.stats.writes += 1;
        Ok(())
    }

    // =========================================================================
    // Iterators
    // =========================================================================

    fn iterator_init(&self) -> IteratorHandle {
        let mut inner = self.inner.lock();
        let id = inner.alloc();
        inner.iterators.insert(
            id,
            IteratorSlot {
                capacity: 0,
                cursor: None,
            },
        );
        IteratorHandle(id)
    }

    fn iterator_buffer(&self, iterator: IteratorHandle, capacity: usize) {
        if let Some(slot) = self.inner.lock().iterators.get_mut(&iterator.0) {
            slot.capacity = capacity;
        }
    }

    async fn iterator_open(
        &self,
        db: DbHandle,
        iterator: IteratorHandle,
        column_family: ColumnFamilyHandle,
        range: NativeRange,
        options: NativeIteratorOptions,
    ) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let path = inner.active_path(db)?;

        let table = match options.snapshot {
            Some(snapshot) => {
                let name = inner.column_family_name(column_family)?;
                inner
                    .snapshots
                    .get(&snapshot.0)
                    .ok_or_else(|| "Invalid argument: Invalid snapshot".to_string())?
                    .get(name)
                    .cloned()
                    .unwrap_or_default()
            }
            None => inner.table(&path, column_family)?.clone(),
        };

        let slot = inner
            .iterators
            .get_mut(&iterator.0)
            .ok_or_else(|| "Invalid argument: Unknown iterator handle".to_string())?;

        slot.cursor = Some(Cursor {
            db: db.0,
            table,
            range: KeyRange::from_native(&range),
            reverse: options.reverse,
            keys_only: options.keys_only,
            last: None,
            done: false,
        });

        Ok(())
    }

    async fn iterator_read(
        &self,
        iterator: IteratorHandle,
        count: usize,
    ) -> NativeResult<Vec<(Bytes, Bytes)>> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();

        let db = inner
            .iterators
            .get(&iterator.0)
            .and_then(|slot| slot.cursor.as_ref())
            .map(|cursor| cursor.db)
            .ok_or_else(|| "Invalid argument: Iterator is not open".to_string())?;

        match inner.databases.get(&db).map(|slot| slot.status) {
            Some(DbStatus::Open) => {}
            Some(DbStatus::Suspended) => return Err(suspended()),
            _ => return Err("Invalid argument: Database is not open".to_string()),
        }

        inner.stats.iterator_reads += 1;

        let cursor = inner
            .iterators
            .get_mut(&iterator.0)
            .and_then(|slot| slot.cursor.as_mut())
            .ok_or_else(|| "Invalid argument: Iterator is not open".to_string())?;

        if cursor.done {
            return Ok(Vec::new());
        }

        let (lower, upper) = match (&cursor.last, cursor.reverse) {
            (Some(last), false) => (
                Bound::Excluded(&last[..]),
                table::borrow_bound(&cursor.range.upper),
            ),
            (Some(last), true) => (
                table::borrow_bound(&cursor.range.lower),
                Bound::Excluded(&last[..]),
            ),
            (None, _) => (
                table::borrow_bound(&cursor.range.lower),
                table::borrow_bound(&cursor.range.upper),
            ),
        };

        let mut entries = cursor.table.scan(lower, upper, cursor.reverse, count);

        if entries.len() < count {
            cursor.done = true;
        }
        if let Some((key, _)) = entries.last() {
            cursor.last = Some(key.clone());
        }
        if cursor.keys_only {
            for entry in entries.iter_mut() {
                entry.1 = Bytes::new();
            }
        }

        Ok(entries)
    }

    async fn iterator_close(&self, iterator: IteratorHandle) -> NativeResult<()> {
        tokio::task::yield_now().await;
        self.inner.lock().iterators.remove(&iterator.0);
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    async fn flush(&self, db: DbHandle, column_family: ColumnFamilyHandle) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();
        let path = inner.active_path(db)?;
        inner.table(&path, column_family)?;

        let read_only = inner
            .databases
            .get(&db.0)
            .map(|slot| slot.options.read_only)
            .unwrap_or(true);

        if !read_only {
            if let Some(store) = inner.stores.get(&path) {
                self.persist(&path, &store.tables)?;
            }
        }

        inner.stats.flushes += 1;
        Ok(())
    }

    async fn compact_range(
        &self,
        db: DbHandle,
        column_family: ColumnFamilyHandle,
        start: Option<Bytes>,
        end: Option<Bytes>,
        exclusive: bool,
    ) -> NativeResult<()> {
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();
        let path = inner.active_path(db)?;
        inner.table(&path, column_family)?;

        tracing::trace!(
            db = db.0,
            start = ?start.as_deref(),
            end = ?end.as_deref(),
            exclusive,
            "compact range"
        );

        inner.stats.compactions += 1;
        Ok(())
    }

    async fn approximate_size(
        &self,
        db: DbHandle,
        column_family: ColumnFamilyHandle,
        start: Bytes,
        end: Bytes,
        options: SizeOptions,
    ) -> NativeResult<u64> {
        tokio::task::yield_now().await;

        if !options.include_memtables && !options.include_files {
            return Err(
                "Invalid argument: Invalid options: include_memtables or include_files must be set"
                    .to_string(),
            );
        }

        let inner = self.inner.lock();
        let path = inner.active_path(db)?;
        let table = inner.table(&path, column_family)?;

        Ok(table.approximate_size(&start, &end))
    }
}
