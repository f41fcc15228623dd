//! Batch buffer pool
//!
//! Destroyed batches hand their buffers (native handle, operation list and
//! result slots) back here, and the next batch of the same kind picks them
//! up instead of allocating a fresh native handle.
//!
//! ```text
//!   ReadBatch::destroy ──► read pool  ──► State::create_read_batch
//!   WriteBatch::destroy ─► write pool ──► State::create_write_batch
//! ```
//!
//! Each free list is bounded; overflow releases the native handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::oneshot;

use crate::engine::{BatchHandle, NativeEngine};
use crate::error::Result;

/// Most buffers kept per kind
pub const MAX_POOLED_BATCHES: usize = 64;

/// Result slot for one queued operation; `None` for fire-and-forget ops
pub(crate) type Slot<T> = Option<oneshot::Sender<Result<T>>>;

/// Reusable buffers behind one batch
pub(crate) struct Slab<O, T> {
    pub(crate) handle: Option<BatchHandle>,
    pub(crate) capacity: usize,
    /// Capacity the owning batch asked for; growth past it is undone
    /// after each flush
    pub(crate) baseline: usize,
    pub(crate) ops: Vec<O>,
    pub(crate) slots: Vec<Slot<T>>,
}

impl<O, T> Slab<O, T> {
    fn new(capacity: usize) -> Self {
        Self {
            handle: None,
            capacity,
            baseline: capacity,
            ops: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Free list for one batch kind
pub(crate) struct SlabPool<O, T> {
    engine: Arc<dyn NativeEngine>,
    init: fn(&dyn NativeEngine) -> BatchHandle,
    free: ArrayQueue<Slab<O, T>>,
    closed: AtomicBool,
}

impl<O, T> SlabPool<O, T> {
    pub(crate) fn new(
        engine: Arc<dyn NativeEngine>,
        init: fn(&dyn NativeEngine) -> BatchHandle,
    ) -> Self {
        Self {
            engine,
            init,
            free: ArrayQueue::new(MAX_POOLED_BATCHES),
            closed: AtomicBool::new(false),
        }
    }

    /// Take a pooled buffer reset to `capacity`, or allocate one
    pub(crate) fn acquire(&self, capacity: usize) -> Slab<O, T> {
        let capacity = capacity.max(1);

        match self.free.pop() {
            Some(mut slab) => {
                slab.ops.clear();
                slab.slots.clear();
                slab.baseline = capacity;
                if slab.capacity != capacity {
                    slab.capacity = capacity;
                    if let Some(handle) = slab.handle {
                        self.engine.batch_buffer(handle, capacity);
                    }
                }
                tracing::trace!(capacity, "batch pool hit");
                slab
            }
            None => {
                tracing::trace!(capacity, "batch pool miss");
                Slab::new(capacity)
            }
        }
    }

    /// Return a buffer. Queued slots must already be settled.
    pub(crate) fn release(&self, mut slab: Slab<O, T>) {
        slab.ops.clear();
        slab.slots.clear();

        if self.closed.load(Ordering::SeqCst) {
            self.free_native(slab);
            return;
        }

        if let Err(slab) = self.free.push(slab) {
            self.free_native(slab);
        }
    }

    /// Native handle for `slab`, allocated and sized on first use
    pub(crate) fn ensure_handle(&self, slab: &mut Slab<O, T>) -> BatchHandle {
        match slab.handle {
            Some(handle) => handle,
            None => {
                let handle = (self.init)(self.engine.as_ref());
                self.engine.batch_buffer(handle, slab.capacity);
                slab.handle = Some(handle);
                handle
            }
        }
    }

    /// Grow `slab` by doubling until it fits `needed` operations
    pub(crate) fn grow(&self, slab: &mut Slab<O, T>, needed: usize) {
        if needed <= slab.capacity {
            return;
        }

        while needed > slab.capacity {
            slab.capacity *= 2;
        }

        if let Some(handle) = slab.handle {
            self.engine.batch_buffer(handle, slab.capacity);
        }
    }

    /// Shrink an emptied `slab` back to its baseline capacity
    pub(crate) fn reset_capacity(&self, slab: &mut Slab<O, T>) {
        if slab.capacity <= slab.baseline {
            return;
        }

        slab.capacity = slab.baseline;
        slab.ops.shrink_to(slab.baseline);
        slab.slots.shrink_to(slab.baseline);
        if let Some(handle) = slab.handle {
            self.engine.batch_buffer(handle, slab.capacity);
        }
    }

    /// Release every pooled handle and stop pooling
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while let Some(slab) = self.free.pop() {
            self.free_native(slab);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }

    fn free_native(&self, slab: Slab<O, T>) {
        if let Some(handle) = slab.handle {
            self.engine.batch_destroy(handle);
        }
    }
}
