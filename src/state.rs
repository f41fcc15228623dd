//! Database State
//!
//! The central coordinator shared by every session of one database.
//!
//! ## Responsibilities
//! - Own the native database handle from `init` to `close`
//! - Keep the column family list (open to upserts until the first open)
//! - Track sessions, snapshots and the batch buffer pools
//! - Run the suspend/resume state machine and gate I/O on it
//! - Count in-flight I/O (`io`) and open handles (`handles`) so close
//!   never tears down under a live operation
//!
//! ## Suspend / Resume
//! ```text
//!   Resumed ──suspend()──► Suspending ──native done──► Suspended
//!      ▲                                                   │
//!      └──native done── Resuming ◄──────resume()───────────┘
//! ```
//! Concurrent callers share one in-flight transition; `resume` waits for a
//! running `suspend` and vice versa. A failed suspend falls back to
//! `Resumed`, a failed resume stays `Suspended`. Operations arriving in any
//! phase but `Resumed` wait; closing the database wakes them with a refusal.
//!
//! ## Close Order
//! ```text
//!   wake resume waiters ──► io idle ──► close sessions (newest first)
//!        ──► handles idle ──► destroy snapshots + column families
//!        ──► native close ──► unregister
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::batch::{BatchOptions, ReadBatch, WriteBatch};
use crate::column_family::{ColumnFamily, ColumnFamilyRef};
use crate::config::DatabaseOptions;
use crate::engine::{DbHandle, NativeEngine, ReadOp, WriteOp};
use crate::error::{AtlasError, Result};
use crate::pool::SlabPool;
use crate::refcounter::{RefCounter, RefGuard};
use crate::session::SessionInner;
use crate::snapshot::{Snapshot, SnapshotSet};

/// A lifecycle transition shared by every caller that asks for it
type Transition = Shared<BoxFuture<'static, Result<()>>>;

/// Suspend/resume phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resumed,
    Suspending,
    Suspended,
    Resuming,
}

#[derive(Default)]
struct Lifecycle {
    opening: Option<Transition>,
    closing: Option<Transition>,
    suspending: Option<Transition>,
    resuming: Option<Transition>,
}

struct ColumnFamilies {
    list: Vec<ColumnFamily>,
    frozen: bool,
}

/// Shared state behind every session of one database
pub struct State {
    engine: Arc<dyn NativeEngine>,
    path: PathBuf,
    options: DatabaseOptions,
    db: DbHandle,

    io: RefCounter,
    handles: RefCounter,

    column_families: Mutex<ColumnFamilies>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    snapshots: Arc<SnapshotSet>,

    read_pool: SlabPool<ReadOp, Option<Bytes>>,
    write_pool: SlabPool<WriteOp, ()>,

    lifecycle: Mutex<Lifecycle>,
    phase: watch::Sender<Phase>,
    opened: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl State {
    /// Allocate the native instance and register the initial column
    /// families. Nothing touches the disk until the first `ready()`.
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        path: impl AsRef<Path>,
        options: DatabaseOptions,
    ) -> Result<Arc<Self>> {
        options.validate()?;

        let db = engine.init(&options.engine);

        let mut list = vec![options.default_family()];
        list.extend(options.column_families.iter().cloned());
        for family in &list {
            family.bind(&engine);
        }

        let (phase, _) = watch::channel(Phase::Resumed);

        Ok(Arc::new(Self {
            snapshots: SnapshotSet::new(Arc::clone(&engine), db),
            read_pool: SlabPool::new(Arc::clone(&engine), |e| e.read_init()),
            write_pool: SlabPool::new(Arc::clone(&engine), |e| e.write_init()),
            engine,
            path: path.as_ref().to_path_buf(),
            options,
            db,
            io: RefCounter::new(),
            handles: RefCounter::new(),
            column_families: Mutex::new(ColumnFamilies {
                list,
                frozen: false,
            }),
            sessions: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            phase,
            opened: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub fn db_handle(&self) -> DbHandle {
        self.db
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// In-flight native work
    pub fn io(&self) -> &RefCounter {
        &self.io
    }

    /// Open sessions and iterators
    pub fn handles(&self) -> &RefCounter {
        &self.handles
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn read_pool(&self) -> &SlabPool<ReadOp, Option<Bytes>> {
        &self.read_pool
    }

    pub(crate) fn write_pool(&self) -> &SlabPool<WriteOp, ()> {
        &self.write_pool
    }

    /// Buffers currently parked in the (read, write) pools
    pub fn pooled_batches(&self) -> (usize, usize) {
        (self.read_pool.len(), self.write_pool.len())
    }

    // =========================================================================
    // Open
    // =========================================================================

    /// Open the database, once. Every caller shares the same outcome.
    pub async fn ready(self: &Arc<Self>) -> Result<()> {
        let opening = {
            let mut lifecycle = self.lifecycle.lock();
            match &lifecycle.opening {
                Some(opening) => opening.clone(),
                None => {
                    if self.is_closing() {
                        return Err(AtlasError::DatabaseClosed);
                    }
                    let opening = Arc::clone(self).open_inner().boxed().shared();
                    lifecycle.opening = Some(opening.clone());
                    opening
                }
            }
        };

        opening.await
    }

    async fn open_inner(self: Arc<Self>) -> Result<()> {
        let handles: Vec<_> = {
            let mut families = self.column_families.lock();
            families.frozen = true;
            families
                .list
                .iter()
                .map(|family| family.bind(&self.engine))
                .collect()
        };

        tracing::debug!(
            path = %self.path.display(),
            column_families = handles.len(),
            "opening database"
        );

        if let Err(msg) = self.engine.open(self.db, &self.path, &handles).await {
            tracing::warn!(path = %self.path.display(), error = %msg, "open failed");
            return Err(AtlasError::Engine(msg));
        }

        self.snapshots.open();
        self.opened.store(true, Ordering::SeqCst);

        if let Some(registry) = &self.options.registry {
            registry.register(&self);
        }

        tracing::info!(path = %self.path.display(), "database opened");
        Ok(())
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the database, once. Safe to call during suspend or resume.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        let closing = {
            let mut lifecycle = self.lifecycle.lock();
            match &lifecycle.closing {
                Some(closing) => closing.clone(),
                None => {
                    self.closing.store(true, Ordering::SeqCst);
                    let closing = Arc::clone(self).close_inner().boxed().shared();
                    lifecycle.closing = Some(closing.clone());
                    closing
                }
            }
        };

        closing.await
    }

    async fn close_inner(self: Arc<Self>) -> Result<()> {
        tracing::debug!(path = %self.path.display(), "closing database");

        // Anything parked on the resume gate re-checks and sees `closing`
        self.phase.send_modify(|_| {});

        let (opening, suspending, resuming) = {
            let lifecycle = self.lifecycle.lock();
            (
                lifecycle.opening.clone(),
                lifecycle.suspending.clone(),
                lifecycle.resuming.clone(),
            )
        };

        if let Some(opening) = opening {
            let _ = opening.await;
        }
        if let Some(suspending) = suspending {
            let _ = suspending.await;
        }
        if let Some(resuming) = resuming {
            let _ = resuming.await;
        }

        self.io.idle().await;

        // Closing a session can close others, so work from a copy
        let sessions: Vec<Arc<SessionInner>> = self
            .sessions
            .lock()
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .collect();
        for session in sessions {
            session.close_local();
        }

        self.handles.idle().await;

        self.snapshots.destroy_all();
        for family in self.column_families.lock().list.iter() {
            family.destroy();
        }
        self.read_pool.close();
        self.write_pool.close();

        let result = self.engine.close(self.db).await.map_err(AtlasError::Engine);

        if let Some(registry) = &self.options.registry {
            registry.unregister(&self);
        }
        self.closed.store(true, Ordering::SeqCst);

        match &result {
            Ok(()) => tracing::info!(path = %self.path.display(), "database closed"),
            Err(err) => tracing::warn!(path = %self.path.display(), error = %err, "close failed"),
        }
        result
    }

    // =========================================================================
    // Suspend / Resume
    // =========================================================================

    /// Release the engine's files and locks. Idempotent; concurrent callers
    /// share one transition.
    pub async fn suspend(self: &Arc<Self>) -> Result<()> {
        let suspending = {
            let mut lifecycle = self.lifecycle.lock();
            if self.is_closing() {
                return Err(AtlasError::DatabaseClosed);
            }
            match &lifecycle.suspending {
                Some(suspending) => suspending.clone(),
                None => {
                    // Only the later of a suspend/resume pair waits on the other
                    let after = lifecycle.resuming.clone();
                    let suspending = Arc::clone(self).suspend_inner(after).boxed().shared();
                    lifecycle.suspending = Some(suspending.clone());
                    suspending
                }
            }
        };

        suspending.await
    }

    async fn suspend_inner(self: Arc<Self>, after: Option<Transition>) -> Result<()> {
        let result = self.run_suspend(after).await;
        self.lifecycle.lock().suspending = None;
        result
    }

    async fn run_suspend(self: &Arc<Self>, after: Option<Transition>) -> Result<()> {
        if let Some(resuming) = after {
            let _ = resuming.await;
        }

        self.ready().await?;

        let phase = self.phase();
        if phase == Phase::Suspended {
            return Ok(());
        }

        self.phase.send_replace(Phase::Suspending);

        match self.engine.suspend(self.db).await {
            Ok(()) => {
                self.phase.send_replace(Phase::Suspended);
                tracing::info!(path = %self.path.display(), "database suspended");
                Ok(())
            }
            Err(msg) => {
                self.phase.send_replace(Phase::Resumed);
                tracing::warn!(path = %self.path.display(), error = %msg, "suspend failed");
                Err(AtlasError::Engine(msg))
            }
        }
    }

    /// Re-acquire what `suspend` released. Idempotent; concurrent callers
    /// share one transition.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let resuming = {
            let mut lifecycle = self.lifecycle.lock();
            if self.is_closing() {
                return Err(AtlasError::DatabaseClosed);
            }
            match &lifecycle.resuming {
                Some(resuming) => resuming.clone(),
                None => {
                    let after = lifecycle.suspending.clone();
                    let resuming = Arc::clone(self).resume_inner(after).boxed().shared();
                    lifecycle.resuming = Some(resuming.clone());
                    resuming
                }
            }
        };

        resuming.await
    }

    async fn resume_inner(self: Arc<Self>, after: Option<Transition>) -> Result<()> {
        let result = self.run_resume(after).await;
        self.lifecycle.lock().resuming = None;
        result
    }

    async fn run_resume(self: &Arc<Self>, after: Option<Transition>) -> Result<()> {
        if let Some(suspending) = after {
            let _ = suspending.await;
        }

        self.ready().await?;

        let phase = self.phase();
        if phase == Phase::Resumed {
            return Ok(());
        }

        self.phase.send_replace(Phase::Resuming);

        match self.engine.resume(self.db).await {
            Ok(()) => {
                self.phase.send_replace(Phase::Resumed);
                tracing::info!(path = %self.path.display(), "database resumed");
                Ok(())
            }
            Err(msg) => {
                self.phase.send_replace(Phase::Suspended);
                tracing::warn!(path = %self.path.display(), error = %msg, "resume failed");
                Err(AtlasError::Engine(msg))
            }
        }
    }

    /// Wait until the database is resumed. `false` if it started closing
    /// while not resumed.
    pub(crate) async fn wait_resumed(&self) -> bool {
        let mut phase = self.phase.subscribe();
        loop {
            let current = *phase.borrow_and_update();
            if current == Phase::Resumed {
                return true;
            }
            if self.is_closing() {
                return false;
            }
            if phase.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Count one unit of in-flight I/O; refused once closing has begun
    pub(crate) fn io_guard(&self) -> Result<RefGuard> {
        let guard = self.io.acquire();
        if self.is_closing() {
            return Err(AtlasError::DatabaseClosed);
        }
        Ok(guard)
    }

    // =========================================================================
    // Column Families
    // =========================================================================

    /// The default column family
    pub fn default_column_family(&self) -> ColumnFamily {
        self.column_families.lock().list[0].clone()
    }

    /// Every registered column family, default first
    pub fn column_families(&self) -> Vec<ColumnFamily> {
        self.column_families.lock().list.clone()
    }

    /// Resolve a column family. Before the first open unknown names are
    /// registered with the default's tuning; afterwards they are an error.
    pub fn column_family(&self, selector: &ColumnFamilyRef) -> Result<ColumnFamily> {
        let mut families = self.column_families.lock();

        match selector {
            ColumnFamilyRef::Family(family) => {
                if families.list.iter().any(|c| c.same_as(family)) {
                    return Ok(family.clone());
                }
                if families.frozen {
                    return Err(AtlasError::UnknownColumnFamily(family.name().to_string()));
                }
                if families.list.iter().any(|c| c.name() == family.name()) {
                    return Err(AtlasError::Config(format!(
                        "duplicate column family: {}",
                        family.name()
                    )));
                }

                family.bind(&self.engine);
                families.list.push(family.clone());
                tracing::debug!(name = family.name(), "column family registered");
                Ok(family.clone())
            }
            ColumnFamilyRef::Name(name) => {
                if let Some(family) = families.list.iter().find(|c| c.name() == name) {
                    return Ok(family.clone());
                }
                if families.frozen {
                    return Err(AtlasError::UnknownColumnFamily(name.clone()));
                }

                let family = families.list[0].clone_settings(name.as_str());
                family.bind(&self.engine);
                families.list.push(family.clone());
                tracing::debug!(name = %name, "column family registered");
                Ok(family)
            }
        }
    }

    // =========================================================================
    // Snapshots, Sessions and Batches
    // =========================================================================

    /// New snapshot holding one reference; pending until the database opens
    pub fn create_snapshot(&self) -> Snapshot {
        self.snapshots.create()
    }

    /// Snapshots not yet released
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub(crate) fn add_session(&self, session: &Arc<SessionInner>) {
        let mut sessions = self.sessions.lock();
        session.set_index(sessions.len());
        sessions.push(Arc::downgrade(session));
    }

    /// Swap-remove `session`, re-indexing the session moved into its slot
    pub(crate) fn remove_session(&self, session: &SessionInner) {
        let mut sessions = self.sessions.lock();

        let is_session = |weak: &Weak<SessionInner>| std::ptr::eq(weak.as_ptr(), session);
        let position = match session.take_index() {
            Some(index) if sessions.get(index).map_or(false, is_session) => index,
            _ => match sessions.iter().position(is_session) {
                Some(index) => index,
                None => return,
            },
        };

        sessions.swap_remove(position);
        if let Some(moved) = sessions.get(position).and_then(Weak::upgrade) {
            moved.set_index(position);
        }
    }

    /// Sessions currently registered
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn create_read_batch(
        &self,
        session: Arc<SessionInner>,
        options: BatchOptions,
    ) -> ReadBatch {
        ReadBatch::new(session, options)
    }

    pub(crate) fn create_write_batch(
        &self,
        session: Arc<SessionInner>,
        options: BatchOptions,
    ) -> WriteBatch {
        WriteBatch::new(session, options)
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("path", &self.path)
            .field("db", &self.db)
            .field("phase", &self.phase())
            .field("opened", &self.is_opened())
            .field("closing", &self.is_closing())
            .field("io", &self.io)
            .field("handles", &self.handles)
            .finish()
    }
}
