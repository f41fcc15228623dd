//! Read and Write Batches
//!
//! A batch accumulates keyed operations and submits them to the engine in a
//! single native call. Each tracked operation hands back a [`Pending`]
//! future that settles only when that call completes.
//!
//! ## Flush Flow
//! ```text
//!   put/get ──► queue (ops + result slots)
//!                 │
//!   flush() ──────┤ in-progress flag set, queue taken
//!                 ▼
//!   io ref ──► ready() ──► wait for resume ──► native read/write
//!                 │                 │                 │
//!                 │          closed: NotResumed       ▼
//!                 │          slots: BatchDestroyed   settle every slot
//!                 ▼
//!   in-progress flag cleared, capacity back to baseline
//!   (also when the flush future is dropped)
//! ```
//!
//! Write completions are batch-wide: one engine status is broadcast to every
//! operation and a failed write returns `BatchNotApplied`. Read completions
//! are per operation; a zero-length value means the key is absent.
//!
//! A batch holds a `handles` reference from creation until it is destroyed
//! or dropped, so database close waits for it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::engine::{BatchHandle, ReadOp, WriteOp};
use crate::error::{AtlasError, Result};
use crate::pool::{Slab, SlabPool, Slot};
use crate::refcounter::RefGuard;
use crate::session::SessionInner;
use crate::state::State;

/// Default number of operations a batch buffer holds before growing
pub const DEFAULT_BATCH_CAPACITY: usize = 8;

/// Options for creating a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Initial operation capacity (doubles on demand)
    pub capacity: usize,

    /// Destroy the batch as soon as a flush completes
    pub auto_destroy: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BATCH_CAPACITY,
            auto_destroy: false,
        }
    }
}

impl BatchOptions {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }
}

// =============================================================================
// Pending Result
// =============================================================================

/// Result of one queued operation, settled by the batch's flush
#[must_use = "a pending result does nothing unless awaited"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped with the batch's queue
            Poll::Ready(Err(_)) => Poll::Ready(Err(AtlasError::BatchDestroyed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Shared Core
// =============================================================================

type PoolOf<O, T> = fn(&State) -> &SlabPool<O, T>;

struct Core<O, T> {
    session: Arc<SessionInner>,
    auto_destroy: bool,
    pool: PoolOf<O, T>,
    inner: Mutex<CoreInner<O, T>>,
}

struct CoreInner<O, T> {
    /// `None` once destroyed
    slab: Option<Slab<O, T>>,
    in_progress: bool,
    /// Holds off database close until the batch is destroyed
    handle_ref: Option<RefGuard>,
}

/// A flush past its synchronous checks
struct Started<'a, O, T> {
    flight: Flight<'a, O, T>,
    ops: Vec<O>,
    handle: BatchHandle,
    _io: RefGuard,
}

/// Result slots taken by an in-flight flush. Dropping it rejects whatever
/// was not settled and clears the in-progress flag.
struct Flight<'a, O, T> {
    core: &'a Core<O, T>,
    slots: Vec<Slot<T>>,
}

impl<O, T> Flight<'_, O, T> {
    fn abort(&mut self, err: AtlasError) {
        for tx in self.slots.drain(..).flatten() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn settle(&mut self, results: impl IntoIterator<Item = Result<T>>) {
        let mut results = results.into_iter();
        for slot in self.slots.drain(..) {
            let result = results
                .next()
                .unwrap_or_else(|| Err(AtlasError::Engine("Missing operation result".to_string())));
            if let Some(tx) = slot {
                let _ = tx.send(result);
            }
        }
    }
}

impl<O, T> Drop for Flight<'_, O, T> {
    fn drop(&mut self) {
        self.abort(AtlasError::BatchDestroyed);

        let mut inner = self.core.inner.lock();
        inner.in_progress = false;
        if let Some(slab) = inner.slab.as_mut() {
            (self.core.pool)(self.core.state()).reset_capacity(slab);
        }
    }
}

impl<O, T> Core<O, T> {
    fn new(
        session: Arc<SessionInner>,
        slab: Slab<O, T>,
        options: BatchOptions,
        pool: PoolOf<O, T>,
    ) -> Self {
        let handle_ref = session.state().handles().acquire();
        Self {
            session,
            auto_destroy: options.auto_destroy,
            pool,
            inner: Mutex::new(CoreInner {
                slab: Some(slab),
                in_progress: false,
                handle_ref: Some(handle_ref),
            }),
        }
    }

    fn state(&self) -> &Arc<State> {
        self.session.state()
    }

    fn enqueue(&self, op: O, tracked: bool) -> Result<Option<Pending<T>>> {
        if self.session.is_closed() {
            return Err(AtlasError::SessionClosed);
        }

        let mut inner = self.inner.lock();
        if inner.in_progress {
            return Err(AtlasError::RequestInProgress);
        }
        let slab = inner.slab.as_mut().ok_or(AtlasError::BatchDestroyed)?;

        let pending = if tracked {
            let (tx, rx) = oneshot::channel();
            slab.slots.push(Some(tx));
            Some(Pending { rx })
        } else {
            slab.slots.push(None);
            None
        };
        slab.ops.push(op);

        let needed = slab.len();
        (self.pool)(self.state()).grow(slab, needed);

        Ok(pending)
    }

    /// Synchronous half of a flush: checks, then take the queue
    fn begin(&self) -> Result<(Vec<O>, Vec<Slot<T>>)> {
        let mut inner = self.inner.lock();

        if inner.slab.is_none() {
            return Err(AtlasError::BatchDestroyed);
        }
        if self.session.is_closed() {
            return Err(AtlasError::SessionClosed);
        }
        if inner.in_progress {
            return Err(AtlasError::RequestInProgress);
        }

        let slab = inner.slab.as_mut().ok_or(AtlasError::BatchDestroyed)?;
        let ops = std::mem::replace(&mut slab.ops, Vec::with_capacity(slab.baseline));
        let slots = std::mem::replace(&mut slab.slots, Vec::with_capacity(slab.baseline));
        inner.in_progress = true;

        Ok((ops, slots))
    }

    /// Everything up to the native call: io ref, open, resume gate, handle
    async fn start(&self) -> Result<Started<'_, O, T>> {
        let (ops, slots) = self.begin()?;
        let mut flight = Flight { core: self, slots };
        let state = self.state();

        let io = match state.io_guard() {
            Ok(guard) => guard,
            Err(err) => {
                flight.abort(err.clone());
                return Err(err);
            }
        };

        if let Err(err) = state.ready().await {
            flight.abort(err.clone());
            return Err(err);
        }

        if !state.wait_resumed().await {
            flight.abort(AtlasError::BatchDestroyed);
            return Err(AtlasError::NotResumed);
        }

        let handle = {
            let mut inner = self.inner.lock();
            inner
                .slab
                .as_mut()
                .map(|slab| (self.pool)(state).ensure_handle(slab))
        };
        let handle = handle.ok_or(AtlasError::BatchDestroyed)?;

        Ok(Started {
            flight,
            ops,
            handle,
            _io: io,
        })
    }

    fn len(&self) -> usize {
        self.inner.lock().slab.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    fn capacity(&self) -> usize {
        self.inner.lock().slab.as_ref().map(|s| s.capacity).unwrap_or(0)
    }

    fn native_handle(&self) -> Option<BatchHandle> {
        self.inner.lock().slab.as_ref().and_then(|s| s.handle)
    }

    fn is_destroyed(&self) -> bool {
        self.inner.lock().slab.is_none()
    }

    fn destroy(&self) -> Result<()> {
        let (slab, handle_ref) = {
            let mut inner = self.inner.lock();
            if inner.in_progress {
                return Err(AtlasError::RequestInProgress);
            }
            match inner.slab.take() {
                Some(slab) => (slab, inner.handle_ref.take()),
                None => return Ok(()),
            }
        };

        // Buffers go back to the pool before close may drain it
        self.release(slab);
        drop(handle_ref);
        Ok(())
    }

    fn release(&self, mut slab: Slab<O, T>) {
        for tx in slab.slots.drain(..).flatten() {
            let _ = tx.send(Err(AtlasError::BatchDestroyed));
        }
        (self.pool)(self.state()).release(slab);
    }
}

impl<O, T> Drop for Core<O, T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let handle_ref = inner.handle_ref.take();
        if let Some(slab) = inner.slab.take() {
            self.release(slab);
        }
        drop(handle_ref);
    }
}

// =============================================================================
// Read Batch
// =============================================================================

/// Batch of point reads against one session
pub struct ReadBatch {
    core: Core<ReadOp, Option<Bytes>>,
}

impl ReadBatch {
    pub(crate) fn new(session: Arc<SessionInner>, options: BatchOptions) -> Self {
        let slab = session.state().read_pool().acquire(options.capacity);
        Self {
            core: Core::new(session, slab, options, State::read_pool),
        }
    }

    fn op(&self, key: &[u8]) -> Result<ReadOp> {
        Ok(ReadOp::Get {
            column_family: self.core.session.column_family_handle()?,
            key: self.core.session.key_codec().encode(key)?,
        })
    }

    /// Queue a read. Resolves to `None` if the key is absent.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Pending<Option<Bytes>>> {
        let op = self.op(key.as_ref())?;
        self.core
            .enqueue(op, true)?
            .ok_or(AtlasError::BatchDestroyed)
    }

    /// Queue a read whose result is not needed
    pub fn try_get(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let op = self.op(key.as_ref())?;
        self.core.enqueue(op, false).map(|_| ())
    }

    /// Submit every queued read in one native call
    ///
    /// Per-read failures reject that read's result only; the flush itself
    /// still succeeds.
    pub async fn flush(&self) -> Result<()> {
        let result = self.submit().await;
        if self.core.auto_destroy {
            let _ = self.core.destroy();
        }
        result
    }

    async fn submit(&self) -> Result<()> {
        let Started {
            mut flight,
            ops,
            handle,
            _io,
        } = self.core.start().await?;

        let session = &self.core.session;
        let state = session.state();
        tracing::trace!(ops = ops.len(), "read batch submitted");

        let results = state
            .engine()
            .read(state.db_handle(), handle, ops, session.snapshot_handle())
            .await;

        let codec = session.value_codec();
        flight.settle(results.into_iter().map(|result| match result {
            Err(msg) => Err(AtlasError::Engine(msg)),
            Ok(value) if value.is_empty() => Ok(None),
            Ok(value) => codec.decode(value).map(Some),
        }));

        Ok(())
    }

    /// Discard queued reads and return the buffers to the pool
    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    /// Number of queued reads
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    /// Native buffer handle, once the first flush has allocated it
    pub fn native_handle(&self) -> Option<BatchHandle> {
        self.core.native_handle()
    }
}

// =============================================================================
// Write Batch
// =============================================================================

/// Batch of mutations applied atomically against one session
pub struct WriteBatch {
    core: Core<WriteOp, ()>,
}

impl WriteBatch {
    pub(crate) fn new(session: Arc<SessionInner>, options: BatchOptions) -> Self {
        let slab = session.state().write_pool().acquire(options.capacity);
        Self {
            core: Core::new(session, slab, options, State::write_pool),
        }
    }

    fn put_op(&self, key: &[u8], value: &[u8]) -> Result<WriteOp> {
        let session = &self.core.session;
        Ok(WriteOp::Put {
            column_family: session.column_family_handle()?,
            key: session.key_codec().encode(key)?,
            value: session.value_codec().encode(value)?,
        })
    }

    fn delete_op(&self, key: &[u8]) -> Result<WriteOp> {
        let session = &self.core.session;
        Ok(WriteOp::Delete {
            column_family: session.column_family_handle()?,
            key: session.key_codec().encode(key)?,
        })
    }

    fn delete_range_op(&self, start: &[u8], end: &[u8]) -> Result<WriteOp> {
        let session = &self.core.session;
        let codec = session.key_codec();
        Ok(WriteOp::DeleteRange {
            column_family: session.column_family_handle()?,
            start: codec.encode(start)?,
            end: codec.encode(end)?,
        })
    }

    fn tracked(&self, op: WriteOp) -> Result<Pending<()>> {
        self.core
            .enqueue(op, true)?
            .ok_or(AtlasError::BatchDestroyed)
    }

    /// Queue a put. An empty value is stored as-is.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Pending<()>> {
        let op = self.put_op(key.as_ref(), value.as_ref())?;
        self.tracked(op)
    }

    pub fn try_put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let op = self.put_op(key.as_ref(), value.as_ref())?;
        self.core.enqueue(op, false).map(|_| ())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<Pending<()>> {
        let op = self.delete_op(key.as_ref())?;
        self.tracked(op)
    }

    pub fn try_delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let op = self.delete_op(key.as_ref())?;
        self.core.enqueue(op, false).map(|_| ())
    }

    /// Queue removal of every key in `[start, end)`
    pub fn delete_range(
        &self,
        start: impl AsRef<[u8]>,
        end: impl AsRef<[u8]>,
    ) -> Result<Pending<()>> {
        let op = self.delete_range_op(start.as_ref(), end.as_ref())?;
        self.tracked(op)
    }

    pub fn try_delete_range(&self, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        let op = self.delete_range_op(start.as_ref(), end.as_ref())?;
        self.core.enqueue(op, false).map(|_| ())
    }

    /// Apply every queued mutation in one native call
    ///
    /// On failure every queued operation rejects with the engine error and
    /// the flush returns `BatchNotApplied`.
    pub async fn flush(&self) -> Result<()> {
        let result = self.submit().await;
        if self.core.auto_destroy {
            let _ = self.core.destroy();
        }
        result
    }

    async fn submit(&self) -> Result<()> {
        let Started {
            mut flight,
            ops,
            handle,
            _io,
        } = self.core.start().await?;

        let state = self.core.state();
        tracing::trace!(ops = ops.len(), "write batch submitted");

        match state.engine().write(state.db_handle(), handle, ops).await {
            Ok(()) => {
                flight.settle(std::iter::repeat(Ok(())));
                Ok(())
            }
            Err(msg) => {
                tracing::debug!(error = %msg, "write batch not applied");
                flight.settle(std::iter::repeat(Err(AtlasError::Engine(msg.clone()))));
                Err(AtlasError::BatchNotApplied(msg))
            }
        }
    }

    /// Discard queued mutations and return the buffers to the pool
    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    /// Number of queued mutations
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    /// Native buffer handle, once the first flush has allocated it
    pub fn native_handle(&self) -> Option<BatchHandle> {
        self.core.native_handle()
    }
}
