use std::sync::{PoisonError, RwLock};

use anyhow::Error;

/// Error for operations attempted in a state that does not allow them:
/// ticking a bounded bar whose total is zero, activating a second render
/// loop on an already-claimed destination, or interacting with a worker
/// whose thread has terminated.
///
/// Surfaces wrapped in [`crate::Error`]; use `downcast_ref::<InvalidState>`
/// to distinguish it from propagated render failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidState(pub(crate) &'static str);

impl std::fmt::Display for InvalidState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid state: {}", self.0)
    }
}
impl std::error::Error for InvalidState {}

/// Single-slot cross-thread error transport.
///
/// The render worker stores a failure here and parks itself; whichever
/// foreground call next interacts with the worker consumes and rethrows
/// it. At most one error is held at a time: the first writer wins until
/// the slot is consumed.
pub(crate) struct ErrorBox {
    slot: RwLock<Option<Error>>,
}

impl ErrorBox {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Store an error. If the slot is already occupied, the offered error
    /// is handed back: the caller decides what a double fault means.
    pub fn put(&self, error: Error) -> Result<(), Error> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            Some(_) => Err(error),
            None => {
                *slot = Some(error);
                Ok(())
            }
        }
    }

    /// Consume the stored error, leaving the slot empty.
    pub fn take(&self) -> Option<Error> {
        if self.is_empty() {
            // fast path for the spin loops: no exclusive lock
            return None;
        }
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Discard any stored error. Done whenever a task is (re)appointed.
    pub fn clear(&self) {
        let _ = self.take();
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
