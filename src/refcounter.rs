//! Reference Counter
//!
//! A counter of outstanding users with an awaitable "idle" condition.
//!
//! ## Responsibilities
//! - Track in-flight I/O (`State::io`) and open handles (`State::handles`)
//! - Wake every waiter when the count drops to zero
//! - Hand out RAII guards so release happens on success and failure paths

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counter with idle detection
///
/// Cloning is cheap and yields another view of the same counter.
#[derive(Clone, Default)]
pub struct RefCounter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

impl RefCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter
    pub(crate) fn inc(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the counter, waking idle waiters when it reaches zero.
    /// A decrement at zero is ignored.
    pub(crate) fn dec(&self) {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.inner.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::warn!("RefCounter decremented below zero"),
        }
    }

    /// Current count
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// True when nothing holds a reference
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Resolve once the count is zero
    pub async fn idle(&self) {
        loop {
            // Register interest before checking, so a dec() racing with the
            // check still wakes us.
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }

            notified.await;
        }
    }

    /// Increment and return a guard that decrements on drop
    pub fn acquire(&self) -> RefGuard {
        self.inc();
        RefGuard {
            counter: self.clone(),
        }
    }
}

impl std::fmt::Debug for RefCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCounter")
            .field("count", &self.count())
            .finish()
    }
}

/// Scoped reference: released exactly once, when dropped
#[must_use = "dropping the guard releases the reference immediately"]
#[derive(Debug)]
pub struct RefGuard {
    counter: RefCounter,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.counter.dec();
    }
}
