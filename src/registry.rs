//! Registry
//!
//! Tracks open databases so a host can close all of them at shutdown. A
//! State registers itself once its open succeeds and unregisters when its
//! close finishes. Entries are weak: the registry never keeps a database
//! alive.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::state::State;

#[derive(Default)]
pub struct Registry {
    states: Mutex<Vec<Weak<State>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, state: &Arc<State>) {
        let mut states = self.states.lock();
        states.retain(|weak| weak.strong_count() > 0);
        states.push(Arc::downgrade(state));
    }

    pub(crate) fn unregister(&self, state: &State) {
        self.states
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), state));
    }

    /// Databases currently open
    pub fn len(&self) -> usize {
        self.states
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered database, newest first. Every close runs even
    /// if an earlier one fails; the first failure is returned.
    pub async fn close_all(&self) -> Result<()> {
        let states: Vec<Arc<State>> = self
            .states
            .lock()
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .collect();

        tracing::debug!(count = states.len(), "closing registered databases");

        let mut first_error = None;
        for state in states {
            if let Err(err) = state.close().await {
                tracing::warn!(path = %state.path().display(), error = %err, "close failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("open", &self.len()).finish()
    }
}
