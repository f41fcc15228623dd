//! Iterator
//!
//! Streaming cursor over a key range, pulled from the engine in chunks.
//!
//! ## Lifecycle
//! ```text
//!   Idle ──next()──► Open ──short read / limit hit──► Closed
//!                     │                                 ▲
//!                     └──────────close() / drop─────────┘
//! ```
//! Each pull asks the engine for `min(capacity, remaining limit)` entries.
//! A pull that returns fewer than requested proves the range is exhausted,
//! so the cursor closes itself right away. While open the iterator holds a
//! handle reference on its State, so the database cannot finish closing
//! underneath it.
//!
//! Opening and pulling wait for the database to be resumed; if it closes
//! while suspended the call fails with `NotResumed`.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream};

use crate::engine::{IteratorHandle, NativeIteratorOptions, NativeRange};
use crate::error::{AtlasError, Result};
use crate::refcounter::RefGuard;
use crate::session::SessionInner;

/// Default number of entries pulled per native read
pub const DEFAULT_ITERATOR_CAPACITY: usize = 8;

/// Key range in caller encoding. `gt` wins over `gte`, `lt` over `lte`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub gt: Option<Bytes>,
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub lte: Option<Bytes>,
}

impl RangeOptions {
    /// Unbounded range
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gt = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn gte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gte = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn lt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lt = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn lte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lte = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }
}

/// Iteration knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Descending key order
    pub reverse: bool,

    /// Stop after this many entries; `None` or negative means unbounded
    pub limit: Option<i64>,

    /// Yield keys with empty values
    pub keys_only: bool,

    /// Entries pulled per native read
    pub capacity: usize,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            reverse: false,
            limit: None,
            keys_only: false,
            capacity: DEFAULT_ITERATOR_CAPACITY,
        }
    }
}

impl IteratorOptions {
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn keys_only(mut self, keys_only: bool) -> Self {
        self.keys_only = keys_only;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// One key-value pair; `value` is empty in keys-only mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Open,
    Closed,
}

/// Forward-only cursor over a session's column family
pub struct DbIterator {
    session: Arc<SessionInner>,
    range: NativeRange,
    reverse: bool,
    keys_only: bool,
    capacity: usize,
    remaining: Option<u64>,
    phase: Phase,
    handle: Option<IteratorHandle>,
    buffer: VecDeque<Entry>,
    handle_ref: Option<RefGuard>,
}

impl DbIterator {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        range: NativeRange,
        options: IteratorOptions,
    ) -> Self {
        let remaining = match options.limit {
            Some(limit) if limit >= 0 => Some(limit as u64),
            _ => None,
        };

        Self {
            session,
            range,
            reverse: options.reverse,
            keys_only: options.keys_only,
            capacity: options.capacity.max(1),
            remaining,
            phase: Phase::Idle,
            handle: None,
            buffer: VecDeque::new(),
            handle_ref: None,
        }
    }

    /// True while a native cursor is open
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Next entry, or `None` once the range (or limit) is exhausted
    pub async fn next(&mut self) -> Option<Result<Entry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }

            match self.phase {
                Phase::Closed => return None,
                Phase::Idle => {
                    if self.remaining == Some(0) {
                        self.phase = Phase::Closed;
                        return None;
                    }
                    if let Err(err) = self.open().await {
                        self.phase = Phase::Closed;
                        return Some(Err(err));
                    }
                }
                Phase::Open => {
                    if let Err(err) = self.pull().await {
                        let _ = self.close().await;
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        if self.session.is_closed() {
            return Err(AtlasError::SessionClosed);
        }

        let state = Arc::clone(self.session.state());
        let _io = state.io_guard()?;

        state.ready().await?;
        if !state.wait_resumed().await {
            return Err(AtlasError::NotResumed);
        }

        let column_family = self.session.column_family_handle()?;
        let engine = state.engine();

        let handle = engine.iterator_init();
        engine.iterator_buffer(handle, self.capacity);

        // Owned before the await, so a dropped `next()` still closes it
        self.handle = Some(handle);
        self.handle_ref = Some(state.handles().acquire());

        let options = NativeIteratorOptions {
            reverse: self.reverse,
            keys_only: self.keys_only,
            snapshot: self.session.snapshot_handle(),
        };

        if let Err(msg) = engine
            .iterator_open(
                state.db_handle(),
                handle,
                column_family,
                self.range.clone(),
                options,
            )
            .await
        {
            let _ = self.close().await;
            return Err(AtlasError::Engine(msg));
        }

        self.phase = Phase::Open;

        tracing::trace!(iterator = handle.0, reverse = self.reverse, "iterator opened");
        Ok(())
    }

    async fn pull(&mut self) -> Result<()> {
        let handle = self
            .handle
            .ok_or_else(|| AtlasError::Engine("Iterator is not open".to_string()))?;

        let count = match self.remaining {
            Some(remaining) => (self.capacity as u64).min(remaining) as usize,
            None => self.capacity,
        };

        let state = Arc::clone(self.session.state());
        let entries = {
            let _io = state.io_guard()?;
            if !state.wait_resumed().await {
                return Err(AtlasError::NotResumed);
            }
            state
                .engine()
                .iterator_read(handle, count)
                .await
                .map_err(AtlasError::Engine)?
        };

        let exhausted = entries.len() < count;

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(entries.len() as u64);
        }

        let key_codec = self.session.key_codec();
        let value_codec = self.session.value_codec();
        for (key, value) in entries {
            let key = key_codec.decode(key)?;
            let value = if self.keys_only {
                value
            } else {
                value_codec.decode(value)?
            };
            self.buffer.push_back(Entry { key, value });
        }

        if exhausted || self.remaining == Some(0) {
            self.close().await?;
        }

        Ok(())
    }

    /// Close the native cursor. Entries already buffered are still
    /// returned by `next()`. No-op if never opened or already closed.
    pub async fn close(&mut self) -> Result<()> {
        self.phase = Phase::Closed;

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let result = self
            .session
            .state()
            .engine()
            .iterator_close(handle)
            .await
            .map_err(AtlasError::Engine);

        self.handle_ref = None;
        tracing::trace!(iterator = handle.0, "iterator closed");
        result
    }

    /// Drain the remaining entries
    pub async fn collect(mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Adapt into a `Stream` of entries
    pub fn into_stream(self) -> impl Stream<Item = Result<Entry>> {
        stream::unfold(self, |mut iterator| async move {
            iterator.next().await.map(|entry| (entry, iterator))
        })
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let engine = Arc::clone(self.session.state().engine());
        let guard = self.handle_ref.take();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = engine.iterator_close(handle).await;
                    drop(guard);
                });
            }
            Err(_) => {
                tracing::warn!(
                    iterator = handle.0,
                    "iterator dropped outside a runtime; cursor leaked"
                );
            }
        }
    }
}
