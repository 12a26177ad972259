use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::transaction::{ConcurrencyHandle, MvccCoordinator, NearTx, TxOutcome};
use crate::types::{KindleError, Result};

/// Receiving half of a transaction's completion channel.
pub type TxFinished = oneshot::Receiver<Result<TxOutcome>>;

/// Which path a rollback acknowledgment took.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackAck {
    /// The optimistic tracker was released with `commit = false`.
    Tracker,
    /// The coordinator was told to reclaim the snapshot's version.
    Coordinator,
    /// Another path had already acknowledged the transaction.
    AlreadyDelivered,
    /// The transaction committed; acknowledgment belongs to the commit path.
    Committed,
}

/// Delivers the rollback acknowledgment for a transaction that is already
/// terminal. At most one acknowledgment is ever delivered per transaction.
///
/// A committed transaction is left alone with its slot armed. Otherwise the
/// call blocks until pending updates resolve; if one does not resolve in
/// time the error is returned and nothing is acknowledged.
pub fn deliver_rollback_ack(tx: &NearTx, coordinator: &dyn MvccCoordinator) -> Result<RollbackAck> {
    if tx.finish(TxOutcome::RolledBack) == TxOutcome::Committed {
        debug!(xid = tx.xid(), "tx.ack.rollback.committed");
        return Ok(RollbackAck::Committed);
    }
    if let Err(err) = tx.wait_for_updates() {
        warn!(xid = tx.xid(), error = %err, "tx.ack.updates.timeout");
        return Err(err);
    }
    let handle = tx.take_handle().map_err(|err| {
        error!(xid = tx.xid(), error = %err, "tx.ack.rollback");
        err
    })?;
    match handle {
        None => {
            debug!(xid = tx.xid(), "tx.ack.rollback.already_delivered");
            Ok(RollbackAck::AlreadyDelivered)
        }
        Some(ConcurrencyHandle::Tracker(tracker)) => {
            tracker.on_done(tx.xid(), false);
            debug!(xid = tx.xid(), "tx.ack.rollback.tracker");
            Ok(RollbackAck::Tracker)
        }
        Some(ConcurrencyHandle::Snapshot(snapshot)) => {
            if let Err(err) = coordinator.ack_tx_rollback(&snapshot) {
                error!(
                    xid = tx.xid(),
                    snapshot = %snapshot,
                    error = %err,
                    "tx.ack.rollback"
                );
                return Err(err);
            }
            debug!(xid = tx.xid(), snapshot = %snapshot, "tx.ack.rollback.coordinator");
            Ok(RollbackAck::Coordinator)
        }
    }
}

/// Acknowledges a rollback once the transaction's completion channel resolves.
///
/// Spawns onto the current tokio runtime and returns immediately. The
/// acknowledgment happens strictly after `finished` resolves; a dropped
/// sender counts as finished. With a `timeout`, a transaction that does not
/// finish in time yields [`KindleError::Timeout`] and stays unacknowledged.
/// A transaction that finished committed is left to the commit path.
///
/// Must be called from within a tokio runtime.
pub fn ack_coordinator_on_rollback(
    tx: Arc<NearTx>,
    finished: TxFinished,
    coordinator: Arc<dyn MvccCoordinator>,
    timeout: Option<Duration>,
) -> JoinHandle<Result<RollbackAck>> {
    tokio::spawn(async move {
        let outcome = match timeout {
            Some(bound) => match tokio::time::timeout(bound, finished).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        xid = tx.xid(),
                        timeout_ms = bound.as_millis() as u64,
                        "tx.ack.rollback.timeout"
                    );
                    return Err(KindleError::Timeout {
                        operation: "tx finish",
                        after: bound,
                    });
                }
            },
            None => finished.await,
        };
        match outcome {
            Ok(Ok(state)) => {
                if tx.finish(state) == TxOutcome::Committed {
                    debug!(xid = tx.xid(), "tx.ack.rollback.committed");
                    return Ok(RollbackAck::Committed);
                }
            }
            Ok(Err(err)) => {
                debug!(xid = tx.xid(), error = %err, "tx.finished_with_error");
                tx.finish(TxOutcome::RolledBack);
            }
            Err(_) => {
                debug!(xid = tx.xid(), "tx.finish_channel_dropped");
                tx.finish(TxOutcome::RolledBack);
            }
        }
        // Waiting on update futures blocks.
        tokio::task::spawn_blocking(move || deliver_rollback_ack(&tx, coordinator.as_ref()))
            .await
            .map_err(|err| KindleError::Coordinator(format!("rollback ack task failed: {err}")))?
    })
}
