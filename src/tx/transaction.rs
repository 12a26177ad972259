use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::update::TxUpdateResult;
use crate::mvcc::MvccSnapshot;
use crate::types::{KindleError, Result};

/// Tracks query versions held by an optimistic transaction.
pub trait MvccQueryTracker: Send + Sync {
    /// Releases the version held for `xid`. `commit` is `false` on rollback.
    fn on_done(&self, xid: u64, commit: bool);
}

/// The elected MVCC version coordinator, as seen by a transaction.
pub trait MvccCoordinator: Send + Sync {
    /// Tells the coordinator the snapshot's writes will never become visible.
    fn ack_tx_rollback(&self, snapshot: &MvccSnapshot) -> Result<()>;

    /// Tells the coordinator the snapshot's writes are committed.
    fn ack_tx_commit(&self, snapshot: &MvccSnapshot) -> Result<()>;
}

/// The single concurrency-control handle a transaction holds.
#[derive(Clone)]
pub enum ConcurrencyHandle {
    /// Optimistic: a query-version tracker.
    Tracker(Arc<dyn MvccQueryTracker>),
    /// Pessimistic: a coordinator-issued snapshot.
    Snapshot(MvccSnapshot),
}

impl fmt::Debug for ConcurrencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyHandle::Tracker(_) => f.write_str("Tracker"),
            ConcurrencyHandle::Snapshot(snap) => f.debug_tuple("Snapshot").field(snap).finish(),
        }
    }
}

/// Terminal state of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxOutcome {
    /// Writes became visible.
    Committed,
    /// Writes were discarded.
    RolledBack,
}

/// Acknowledgment slot: the handle is armed once and delivered at most once.
#[derive(Debug)]
enum AckSlot {
    Unset,
    Armed(ConcurrencyHandle),
    Delivered,
}

const DEFAULT_UPDATE_WAIT: Duration = Duration::from_secs(30);

/// Near-side transaction state relevant to acknowledgment.
///
/// Neither acknowledgment goes out while a recorded update is still pending
/// on its [`UpdateFuture`](super::update::UpdateFuture).
pub struct NearTx {
    xid: u64,
    slot: Mutex<AckSlot>,
    outcome: Mutex<Option<TxOutcome>>,
    updates: Mutex<Vec<Arc<TxUpdateResult>>>,
    update_wait: Duration,
}

impl NearTx {
    /// Transaction with no concurrency handle yet.
    pub fn new(xid: u64) -> Self {
        Self {
            xid,
            slot: Mutex::new(AckSlot::Unset),
            outcome: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
            update_wait: DEFAULT_UPDATE_WAIT,
        }
    }

    /// Bounds the wait on each pending update before acknowledging.
    /// Normally fed from `TxSection::update_wait_timeout`.
    pub fn with_update_wait_timeout(mut self, timeout: Duration) -> Self {
        self.update_wait = timeout;
        self
    }

    /// Transaction holding `handle`.
    pub fn with_handle(xid: u64, handle: ConcurrencyHandle) -> Self {
        let tx = Self::new(xid);
        *tx.slot.lock() = AckSlot::Armed(handle);
        tx
    }

    /// Transaction id.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Installs the concurrency handle. A transaction holds exactly one.
    pub fn set_handle(&self, handle: ConcurrencyHandle) -> Result<()> {
        let mut slot = self.slot.lock();
        match *slot {
            AckSlot::Unset => {
                *slot = AckSlot::Armed(handle);
                Ok(())
            }
            _ => Err(KindleError::ContractViolation(
                "transaction already holds a concurrency handle",
            )),
        }
    }

    /// Returns `true` once an acknowledgment went out.
    pub fn is_acknowledged(&self) -> bool {
        matches!(*self.slot.lock(), AckSlot::Delivered)
    }

    /// Records the result of one entry update.
    pub fn record_update(&self, result: TxUpdateResult) -> Arc<TxUpdateResult> {
        let result = Arc::new(result);
        self.updates.lock().push(Arc::clone(&result));
        result
    }

    /// Update results recorded so far, in order.
    pub fn updates(&self) -> Vec<Arc<TxUpdateResult>> {
        self.updates.lock().clone()
    }

    /// Marks the transaction terminal. The first outcome sticks.
    pub fn finish(&self, outcome: TxOutcome) -> TxOutcome {
        *self.outcome.lock().get_or_insert(outcome)
    }

    /// Terminal state, once finished.
    pub fn outcome(&self) -> Option<TxOutcome> {
        *self.outcome.lock()
    }

    /// Waits for every pending update future recorded so far.
    ///
    /// Each future gets its own bound; the first one still pending when its
    /// bound elapses yields [`KindleError::Timeout`].
    pub fn wait_for_updates(&self) -> Result<()> {
        for update in self.updates() {
            if let Some(future) = update.update_future() {
                if !future.is_done() {
                    debug!(xid = self.xid, "tx.updates.wait");
                    future.wait_done(self.update_wait)?;
                }
            }
        }
        Ok(())
    }

    /// Takes the armed handle, leaving the slot delivered.
    ///
    /// `Ok(None)` means another path already acknowledged this transaction.
    pub(crate) fn take_handle(&self) -> Result<Option<ConcurrencyHandle>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, AckSlot::Delivered) {
            AckSlot::Armed(handle) => Ok(Some(handle)),
            AckSlot::Delivered => Ok(None),
            AckSlot::Unset => {
                *slot = AckSlot::Unset;
                Err(KindleError::ContractViolation(
                    "transaction has no concurrency handle",
                ))
            }
        }
    }

    /// Commit-path acknowledgment. Returns `false` if the transaction was
    /// already acknowledged.
    ///
    /// Blocks on pending updates first; on timeout the slot stays armed.
    pub fn ack_commit(&self, coordinator: &dyn MvccCoordinator) -> Result<bool> {
        if self.finish(TxOutcome::Committed) != TxOutcome::Committed {
            return Err(KindleError::ContractViolation(
                "transaction already rolled back",
            ));
        }
        self.wait_for_updates()?;
        match self.take_handle()? {
            None => Ok(false),
            Some(ConcurrencyHandle::Tracker(tracker)) => {
                tracker.on_done(self.xid, true);
                debug!(xid = self.xid, "tx.ack.commit.tracker");
                Ok(true)
            }
            Some(ConcurrencyHandle::Snapshot(snapshot)) => {
                coordinator.ack_tx_commit(&snapshot)?;
                debug!(xid = self.xid, "tx.ack.commit.coordinator");
                Ok(true)
            }
        }
    }
}

impl fmt::Debug for NearTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearTx")
            .field("xid", &self.xid)
            .field("slot", &*self.slot.lock())
            .field("outcome", &self.outcome())
            .field("update_wait", &self.update_wait)
            .finish()
    }
}
