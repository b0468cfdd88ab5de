// Copyright (c) 2025 RustySched Contributors
//
// Join state: completion tracking for one parallel loop
//
// A shared counter of outstanding subtasks plus the first error any of them
// reported, guarded by one mutex; a condvar is broadcast when the counter
// reaches zero. The state is reference-counted so it outlives a submitter
// that fails fast while stealing workers are still completing siblings.

use crate::error::SchedError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct JoinInner {
    /// Subtasks not yet completed
    remaining: usize,
    /// First error reported by any subtask; later errors are dropped
    error: Option<SchedError>,
}

/// Completion barrier for one parallel loop
pub struct JoinState {
    inner: Mutex<JoinInner>,
    done: Condvar,
}

impl JoinState {
    pub(crate) fn new(nsubtasks: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JoinInner {
                remaining: nsubtasks,
                error: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Record one subtask's completion, keeping the first error. Broadcasts
    /// when the last subtask finishes.
    pub(crate) fn complete(&self, error: Option<SchedError>) {
        let mut inner = self.inner.lock();
        if let Some(err) = error {
            if inner.error.is_none() {
                inner.error = Some(err);
            }
        }
        debug_assert!(inner.remaining > 0, "join counter underflow");
        inner.remaining -= 1;
        if inner.remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Check completion without blocking
    pub(crate) fn is_complete(&self) -> bool {
        self.inner.lock().remaining == 0
    }

    /// Block until every subtask has completed
    pub(crate) fn wait(&self) {
        let mut inner = self.inner.lock();
        while inner.remaining > 0 {
            self.done.wait(&mut inner);
        }
    }

    /// First error reported by any subtask, if any
    pub(crate) fn first_error(&self) -> Option<SchedError> {
        self.inner.lock().error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counts_down_to_zero() {
        let join = JoinState::new(3);
        assert!(!join.is_complete());

        join.complete(None);
        join.complete(None);
        assert!(!join.is_complete());

        join.complete(None);
        assert!(join.is_complete());
        assert_eq!(join.first_error(), None);
    }

    #[test]
    fn test_first_error_wins() {
        let join = JoinState::new(3);
        join.complete(Some(SchedError::Kernel(7)));
        join.complete(Some(SchedError::Kernel(8)));
        join.complete(None);

        assert_eq!(join.first_error(), Some(SchedError::Kernel(7)));
        assert!(join.is_complete());
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let join = JoinState::new(2);

        let waiter = {
            let join = join.clone();
            thread::spawn(move || {
                join.wait();
                join.first_error()
            })
        };

        thread::sleep(Duration::from_millis(20));
        join.complete(None);
        thread::sleep(Duration::from_millis(20));
        join.complete(Some(SchedError::Kernel(42)));

        assert_eq!(waiter.join().unwrap(), Some(SchedError::Kernel(42)));
    }

    #[test]
    fn test_wait_returns_immediately_when_done() {
        let join = JoinState::new(1);
        join.complete(None);
        join.wait();
    }
}
