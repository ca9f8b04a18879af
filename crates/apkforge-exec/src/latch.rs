//! One-shot latch
//!
//! Counted down exactly once by the thread producing a value and awaited by
//! every other thread that asked for the same value.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::cancel::CancellationToken;

/// Poll interval used while waiting with a cancellation token.
const INTERRUPT_POLL: Duration = Duration::from_millis(20);

/// Single-producer, multi-consumer completion signal.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a latch that is already open (nothing to wait for).
    pub fn released() -> Self {
        Self {
            released: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Open the latch and wake every waiter. Calling it again is a no-op.
    pub fn count_down(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        if !*released {
            *released = true;
            self.cond.notify_all();
        }
    }

    /// Check whether the latch is open.
    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the latch opens.
    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the latch opens or `timeout` elapses.
    ///
    /// Returns `true` if the latch opened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        let (released, _) = self
            .cond
            .wait_timeout_while(released, timeout, |released| !*released)
            .unwrap_or_else(PoisonError::into_inner);
        *released
    }

    /// Block until the latch opens or `token` is cancelled.
    ///
    /// Returns `true` if the latch opened, `false` if the wait was interrupted.
    pub fn wait_interruptible(&self, token: &CancellationToken) -> bool {
        loop {
            if self.wait_timeout(INTERRUPT_POLL) {
                return true;
            }
            if token.is_cancelled() {
                return false;
            }
        }
    }
}
