#![forbid(unsafe_code)]
//! Transaction bookkeeping: per-update results and the terminal
//! acknowledgment sent to the MVCC coordinator.
//!
//! Every [`NearTx`] holds exactly one [`ConcurrencyHandle`]. The commit path
//! ([`NearTx::ack_commit`]) and the rollback path
//! ([`ack_coordinator_on_rollback`]) compete for it, so whichever runs first
//! delivers the only acknowledgment.

mod ack;
mod transaction;
mod update;

pub use ack::{ack_coordinator_on_rollback, deliver_rollback_ack, RollbackAck, TxFinished};
pub use transaction::{ConcurrencyHandle, MvccCoordinator, MvccQueryTracker, NearTx, TxOutcome};
pub use update::{InvokeResult, TxUpdateResult, UpdateFuture};
