//! Single-assignment completion cell
//!
//! A [`Deferred`] is settled from outside the code awaiting it, which lets
//! callback-style socket events be awaited like ordinary futures.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Settlement state of a [`Deferred`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Fulfilled,
    Rejected,
}

/// A value that is resolved or rejected exactly once and read by any number of waiters
///
/// Only the first call to [`resolve`](Deferred::resolve) or
/// [`reject`](Deferred::reject) takes effect. Later calls return `false` and
/// leave the outcome untouched.
pub struct Deferred<T, E> {
    slot: Arc<watch::Sender<Option<Result<T, E>>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deferred<T, E> {
    /// Create a pending deferred
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Settle as fulfilled. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle as rejected. Returns `false` if already settled.
    pub fn reject(&self, reason: E) -> bool {
        self.settle(Err(reason))
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut outcome = Some(outcome);
        let settled = self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        });
        if !settled {
            debug!("Ignoring settlement of an already settled deferred");
        }
        settled
    }

    /// Current state, without waiting
    pub fn state(&self) -> DeferredState {
        match &*self.slot.borrow() {
            None => DeferredState::Pending,
            Some(Ok(_)) => DeferredState::Fulfilled,
            Some(Err(_)) => DeferredState::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != DeferredState::Pending
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// Wait for settlement and return a copy of the outcome
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            // The sender lives in `self`, so this only returns once the slot changes.
            let _ = rx.changed().await;
        }
    }

    /// The outcome if already settled
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.slot.borrow().clone()
    }
}
