//! Snapshot
//!
//! Reference-counted point-in-time view. The native handle is created
//! lazily: a snapshot taken before the database is open stays pending until
//! the owning State opens and initializes every pending snapshot in one pass.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::{DbHandle, NativeEngine, SnapshotHandle};

/// Point-in-time view shared by the sessions that read through it
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<Inner>,
}

struct Inner {
    refs: AtomicUsize,
    native: Mutex<Native>,
    engine: Arc<dyn NativeEngine>,
    db: DbHandle,
    set: Weak<SnapshotSet>,
}

enum Native {
    Pending,
    Live(SnapshotHandle),
    Destroyed,
}

impl Snapshot {
    /// Take another reference
    pub(crate) fn add_ref(&self) {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a reference; the last one destroys the native view
    pub(crate) fn unref(&self) {
        let previous = self
            .inner
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        if previous == Ok(1) {
            self.destroy_native();
            if let Some(set) = self.inner.set.upgrade() {
                set.remove(self);
            }
        }
    }

    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::SeqCst)
    }

    /// Native handle; `None` while pending or after destruction
    pub fn handle(&self) -> Option<SnapshotHandle> {
        match &*self.inner.native.lock() {
            Native::Live(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.native.lock(), Native::Pending)
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(&*self.inner.native.lock(), Native::Destroyed)
    }

    fn same_as(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn init(&self) {
        let mut native = self.inner.native.lock();
        if let Native::Pending = &*native {
            *native = Native::Live(self.inner.engine.snapshot_create(self.inner.db));
        }
    }

    fn destroy_native(&self) {
        let mut native = self.inner.native.lock();
        if let Native::Live(handle) = std::mem::replace(&mut *native, Native::Destroyed) {
            self.inner.engine.snapshot_destroy(handle);
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("refs", &self.ref_count())
            .field("handle", &self.handle())
            .finish()
    }
}

/// The State's registry of live snapshots
pub(crate) struct SnapshotSet {
    engine: Arc<dyn NativeEngine>,
    db: DbHandle,
    inner: Mutex<SetInner>,
}

#[derive(Default)]
struct SetInner {
    opened: bool,
    entries: Vec<Snapshot>,
}

impl SnapshotSet {
    pub(crate) fn new(engine: Arc<dyn NativeEngine>, db: DbHandle) -> Arc<Self> {
        Arc::new(Self {
            engine,
            db,
            inner: Mutex::new(SetInner::default()),
        })
    }

    /// Register a new snapshot holding one reference. Initialized now if
    /// the database is open, otherwise when it opens.
    pub(crate) fn create(self: &Arc<Self>) -> Snapshot {
        let snapshot = Snapshot {
            inner: Arc::new(Inner {
                refs: AtomicUsize::new(1),
                native: Mutex::new(Native::Pending),
                engine: Arc::clone(&self.engine),
                db: self.db,
                set: Arc::downgrade(self),
            }),
        };

        let mut inner = self.inner.lock();
        if inner.opened {
            snapshot.init();
        }
        inner.entries.push(snapshot.clone());

        snapshot
    }

    /// Mark the database open and initialize every pending snapshot
    pub(crate) fn open(&self) {
        let mut inner = self.inner.lock();
        inner.opened = true;
        for snapshot in &inner.entries {
            snapshot.init();
        }
    }

    /// Destroy every registered snapshot
    pub(crate) fn destroy_all(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            inner.opened = false;
            std::mem::take(&mut inner.entries)
        };
        for snapshot in entries {
            snapshot.destroy_native();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn remove(&self, snapshot: &Snapshot) {
        self.inner.lock().entries.retain(|s| !s.same_as(snapshot));
    }
}
