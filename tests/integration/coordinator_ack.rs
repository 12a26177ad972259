#![allow(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use kindle::mvcc::{MvccSnapshot, MvccVersion};
use kindle::tx::{
    ack_coordinator_on_rollback, deliver_rollback_ack, ConcurrencyHandle, MvccCoordinator,
    MvccQueryTracker, NearTx, RollbackAck, TxOutcome, TxUpdateResult, UpdateFuture,
};
use kindle::types::{KindleError, Result};

#[derive(Default)]
struct RecordingCoordinator {
    rollbacks: Mutex<Vec<MvccSnapshot>>,
    commits: Mutex<Vec<MvccSnapshot>>,
    fail: bool,
}

impl MvccCoordinator for RecordingCoordinator {
    fn ack_tx_rollback(&self, snapshot: &MvccSnapshot) -> Result<()> {
        self.rollbacks.lock().push(snapshot.clone());
        if self.fail {
            return Err(KindleError::Coordinator("coordinator left the cluster".into()));
        }
        Ok(())
    }

    fn ack_tx_commit(&self, snapshot: &MvccSnapshot) -> Result<()> {
        self.commits.lock().push(snapshot.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTracker {
    calls: Mutex<Vec<(u64, bool)>>,
}

impl MvccQueryTracker for RecordingTracker {
    fn on_done(&self, xid: u64, commit: bool) {
        self.calls.lock().push((xid, commit));
    }
}

fn snapshot() -> MvccSnapshot {
    MvccSnapshot::new(MvccVersion::new(3, 42, 0), 40).with_active([41])
}

#[tokio::test]
async fn snapshot_rollback_is_acknowledged_exactly_once() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(NearTx::with_handle(7, ConcurrencyHandle::Snapshot(snapshot())));
    let (done_tx, done_rx) = oneshot::channel();

    let task = ack_coordinator_on_rollback(
        Arc::clone(&tx),
        done_rx,
        coordinator.clone(),
        Some(Duration::from_secs(5)),
    );
    tokio::task::yield_now().await;
    assert!(coordinator.rollbacks.lock().is_empty());
    assert!(!tx.is_acknowledged());

    tx.record_update(TxUpdateResult::new(true));
    done_tx.send(Ok(TxOutcome::RolledBack)).expect("receiver alive");
    let ack = task.await.expect("join").expect("ack");
    assert_eq!(ack, RollbackAck::Coordinator);
    assert_eq!(*coordinator.rollbacks.lock(), vec![snapshot()]);
    assert!(coordinator.commits.lock().is_empty());
    assert_eq!(tx.outcome(), Some(TxOutcome::RolledBack));

    // A second listener on the same transaction finds the slot delivered.
    let (again_tx, again_rx) = oneshot::channel();
    again_tx.send(Ok(TxOutcome::RolledBack)).expect("receiver alive");
    let again = ack_coordinator_on_rollback(tx, again_rx, coordinator.clone(), None)
        .await
        .expect("join")
        .expect("ack");
    assert_eq!(again, RollbackAck::AlreadyDelivered);
    assert_eq!(coordinator.rollbacks.lock().len(), 1);
}

#[tokio::test]
async fn tracker_rollback_never_reaches_the_coordinator() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tracker = Arc::new(RecordingTracker::default());
    let tx = Arc::new(NearTx::with_handle(
        9,
        ConcurrencyHandle::Tracker(tracker.clone()),
    ));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(tx, done_rx, coordinator.clone(), None);
    done_tx.send(Ok(TxOutcome::RolledBack)).expect("receiver alive");

    assert_eq!(task.await.expect("join").expect("ack"), RollbackAck::Tracker);
    assert_eq!(*tracker.calls.lock(), vec![(9, false)]);
    assert!(coordinator.rollbacks.lock().is_empty());
    assert!(coordinator.commits.lock().is_empty());
}

#[tokio::test]
async fn commit_path_wins_the_slot() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(NearTx::with_handle(11, ConcurrencyHandle::Snapshot(snapshot())));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(Arc::clone(&tx), done_rx, coordinator.clone(), None);

    assert!(tx.ack_commit(coordinator.as_ref()).expect("commit ack"));
    done_tx.send(Ok(TxOutcome::Committed)).expect("receiver alive");

    assert_eq!(
        task.await.expect("join").expect("ack"),
        RollbackAck::Committed
    );
    assert_eq!(coordinator.commits.lock().len(), 1);
    assert!(coordinator.rollbacks.lock().is_empty());
    assert_eq!(tx.outcome(), Some(TxOutcome::Committed));
}

#[tokio::test]
async fn committed_outcome_leaves_the_slot_to_the_commit_path() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(NearTx::with_handle(12, ConcurrencyHandle::Snapshot(snapshot())));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(Arc::clone(&tx), done_rx, coordinator.clone(), None);
    done_tx.send(Ok(TxOutcome::Committed)).expect("receiver alive");

    assert_eq!(task.await.expect("join").expect("ack"), RollbackAck::Committed);
    assert!(!tx.is_acknowledged());
    assert!(coordinator.rollbacks.lock().is_empty());

    assert!(tx.ack_commit(coordinator.as_ref()).expect("commit ack"));
    assert_eq!(*coordinator.commits.lock(), vec![snapshot()]);
    assert!(coordinator.rollbacks.lock().is_empty());
}

#[tokio::test]
async fn rollback_ack_waits_for_pending_updates() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(
        NearTx::with_handle(13, ConcurrencyHandle::Snapshot(snapshot()))
            .with_update_wait_timeout(Duration::from_millis(20)),
    );
    let future = UpdateFuture::new();
    tx.record_update(TxUpdateResult::pending(true, future.clone()));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(Arc::clone(&tx), done_rx, coordinator.clone(), None);
    done_tx.send(Ok(TxOutcome::RolledBack)).expect("receiver alive");

    let err = task.await.expect("join").unwrap_err();
    assert!(matches!(err, KindleError::Timeout { .. }));
    assert!(!tx.is_acknowledged());
    assert!(coordinator.rollbacks.lock().is_empty());

    assert!(future.complete(Ok(TxUpdateResult::new(true))));
    let ack = deliver_rollback_ack(&tx, coordinator.as_ref()).expect("ack");
    assert_eq!(ack, RollbackAck::Coordinator);
    assert_eq!(coordinator.rollbacks.lock().len(), 1);
}

#[tokio::test]
async fn missing_handle_is_surfaced() {
    let tx = Arc::new(NearTx::new(1));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(
        tx,
        done_rx,
        Arc::new(RecordingCoordinator::default()),
        None,
    );
    done_tx.send(Ok(TxOutcome::RolledBack)).expect("receiver alive");
    let err = task.await.expect("join").unwrap_err();
    assert!(matches!(err, KindleError::ContractViolation(_)));
}

#[tokio::test]
async fn coordinator_failure_is_reported_once() {
    let coordinator = Arc::new(RecordingCoordinator {
        fail: true,
        ..Default::default()
    });
    let tx = Arc::new(NearTx::with_handle(5, ConcurrencyHandle::Snapshot(snapshot())));
    let (done_tx, done_rx) = oneshot::channel();
    let task = ack_coordinator_on_rollback(Arc::clone(&tx), done_rx, coordinator.clone(), None);
    done_tx
        .send(Err(KindleError::Invalid("lock conflict")))
        .expect("receiver alive");

    let err = task.await.expect("join").unwrap_err();
    assert!(matches!(err, KindleError::Coordinator(_)));
    assert!(tx.is_acknowledged());
    assert_eq!(tx.outcome(), Some(TxOutcome::RolledBack));
    assert_eq!(coordinator.rollbacks.lock().len(), 1);
}

#[tokio::test]
async fn dropped_completion_still_acknowledges() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(NearTx::with_handle(6, ConcurrencyHandle::Snapshot(snapshot())));
    let (done_tx, done_rx) = oneshot::channel::<Result<TxOutcome>>();
    drop(done_tx);
    let ack = ack_coordinator_on_rollback(tx, done_rx, coordinator.clone(), None)
        .await
        .expect("join")
        .expect("ack");
    assert_eq!(ack, RollbackAck::Coordinator);
}

#[tokio::test]
async fn bounded_wait_times_out_without_acknowledging() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let tx = Arc::new(NearTx::with_handle(8, ConcurrencyHandle::Snapshot(snapshot())));
    let (_done_tx, done_rx) = oneshot::channel();
    let err = ack_coordinator_on_rollback(
        Arc::clone(&tx),
        done_rx,
        coordinator.clone(),
        Some(Duration::from_millis(20)),
    )
    .await
    .expect("join")
    .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, KindleError::Timeout { .. }));
    assert!(!tx.is_acknowledged());
    assert!(coordinator.rollbacks.lock().is_empty());
}
