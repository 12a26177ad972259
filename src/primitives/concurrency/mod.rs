#![forbid(unsafe_code)]
//! One-shot completion cells for work whose outcome arrives later.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::types::{KindleError, Result};

struct Slot<T> {
    outcome: Option<Result<T>>,
    finished: bool,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cv: Condvar,
}

/// A shareable cell that is completed exactly once and consumed once.
///
/// The first call to [`Completion::finish`] wins; later calls are ignored and
/// report `false`. Waiters block on a condition variable and may bound the
/// wait, in which case an elapsed bound yields [`KindleError::Timeout`].
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates an unfinished cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    finished: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Creates a cell that is already finished with `outcome`.
    pub fn finished(outcome: Result<T>) -> Self {
        let cell = Self::new();
        cell.finish(outcome);
        cell
    }

    /// Publishes the outcome. Returns `false` if the cell was already finished.
    pub fn finish(&self, outcome: Result<T>) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.finished {
            return false;
        }
        slot.outcome = Some(outcome);
        slot.finished = true;
        self.inner.cv.notify_all();
        true
    }

    /// Returns `true` once an outcome has been published.
    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().finished
    }

    /// Blocks until the outcome is available and takes it.
    ///
    /// The outcome can be taken once; a second taker gets `NotFound`.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.inner.slot.lock();
        while !slot.finished {
            self.inner.cv.wait(&mut slot);
        }
        slot.outcome.take().unwrap_or(Err(KindleError::NotFound))
    }

    /// Like [`Completion::wait`] but gives up after `timeout`.
    pub fn wait_for(&self, timeout: Duration, operation: &'static str) -> Result<T> {
        let mut slot = self.lock_finished(timeout, operation)?;
        slot.outcome.take().unwrap_or(Err(KindleError::NotFound))
    }

    /// Waits up to `timeout` for the cell to finish, leaving the outcome in place.
    pub fn wait_finished_for(&self, timeout: Duration, operation: &'static str) -> Result<()> {
        self.lock_finished(timeout, operation).map(|_| ())
    }

    fn lock_finished(
        &self,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, Slot<T>>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while !slot.finished {
            if self.inner.cv.wait_until(&mut slot, deadline).timed_out() && !slot.finished {
                debug!(operation, timeout_ms = timeout.as_millis() as u64, "completion.timeout");
                return Err(KindleError::Timeout {
                    operation,
                    after: timeout,
                });
            }
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_finish_wins() {
        let cell: Completion<u32> = Completion::new();
        assert!(!cell.is_done());
        assert!(cell.finish(Ok(1)));
        assert!(!cell.finish(Ok(2)));
        assert!(cell.is_done());
        assert_eq!(cell.wait().unwrap(), 1);
        assert!(matches!(cell.wait(), Err(KindleError::NotFound)));
    }

    #[test]
    fn waiter_wakes_when_finished_elsewhere() {
        let cell: Completion<&'static str> = Completion::new();
        let producer = cell.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.finish(Ok("done"));
        });
        assert_eq!(cell.wait_for(Duration::from_secs(5), "test").unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let cell: Completion<()> = Completion::new();
        let err = cell
            .wait_for(Duration::from_millis(5), "update future")
            .unwrap_err();
        match err {
            KindleError::Timeout { operation, after } => {
                assert_eq!(operation, "update future");
                assert_eq!(after, Duration::from_millis(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The cell stays usable after a timed-out wait.
        cell.finish(Ok(()));
        cell.wait().unwrap();
    }

    #[test]
    fn error_outcome_is_delivered() {
        let cell: Completion<()> = Completion::finished(Err(KindleError::Corruption("boom")));
        assert!(matches!(cell.wait(), Err(KindleError::Corruption("boom"))));
    }

    #[test]
    fn finished_wait_leaves_the_outcome() {
        let cell: Completion<u8> = Completion::new();
        assert!(matches!(
            cell.wait_finished_for(Duration::from_millis(5), "peek"),
            Err(KindleError::Timeout { .. })
        ));
        cell.finish(Ok(4));
        cell.wait_finished_for(Duration::from_millis(5), "peek").unwrap();
        assert_eq!(cell.wait().unwrap(), 4);
    }
}
