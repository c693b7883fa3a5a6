//! Timed single-shot signal primitive backing the fixture's milestones.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Manual-reset event: transitions from unsignaled to signaled exactly once
/// and stays signaled. Redundant sets are no-ops.
///
/// The mutex acquire on the wait side pairs with the release on the set
/// side, so any write made before [`set`](Self::set) is visible to a waiter
/// after its wait returns true.
pub struct ManualResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if !*signaled {
            *signaled = true;
            self.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    /// Block until signaled or `timeout` elapses. Returns whether the event
    /// was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.signaled.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap();
        *guard
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}
