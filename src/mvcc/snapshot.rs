use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use super::version::{MvccVersion, MvccVersionAware};

/// Snapshot a pessimistic transaction reads through.
///
/// Issued by the coordinator: the transaction's own version, the newest
/// counter below which old row versions may be cleaned up, and the counters
/// of transactions still running when the snapshot was taken.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MvccSnapshot {
    version: MvccVersion,
    cleanup_version: u64,
    active_txs: BTreeSet<u64>,
}

impl MvccSnapshot {
    /// Snapshot with no concurrently active transactions.
    pub fn new(version: MvccVersion, cleanup_version: u64) -> Self {
        Self {
            version,
            cleanup_version,
            active_txs: BTreeSet::new(),
        }
    }

    /// Adds counters of transactions active at snapshot time.
    pub fn with_active(mut self, counters: impl IntoIterator<Item = u64>) -> Self {
        self.active_txs.extend(counters);
        self
    }

    /// The snapshot's own version.
    pub fn version(&self) -> MvccVersion {
        self.version
    }

    /// Counter at or below which superseded versions may be removed.
    pub fn cleanup_version(&self) -> u64 {
        self.cleanup_version
    }

    /// Counters of transactions that were active at snapshot time.
    pub fn active_txs(&self) -> impl Iterator<Item = u64> + '_ {
        self.active_txs.iter().copied()
    }

    /// Returns `true` if the transaction with `counter` was still running.
    pub fn is_active(&self, counter: u64) -> bool {
        self.active_txs.contains(&counter)
    }

    /// Snapshot-isolation visibility of a row version.
    ///
    /// Versions from older coordinators are visible, versions from newer ones
    /// are not. Within the same coordinator a version is visible when its
    /// counter is older than the snapshot and was not active, or when it is
    /// the snapshot's own transaction at an earlier operation step.
    pub fn is_visible(&self, row: &dyn MvccVersionAware) -> bool {
        let own = self.version;
        match row.coordinator_version().cmp(&own.coordinator_version()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                let counter = row.counter();
                if counter == own.counter() {
                    row.operation_counter() < own.operation_counter()
                } else {
                    counter < own.counter() && !self.is_active(counter)
                }
            }
        }
    }

    /// Returns `true` if a superseded row version may be removed.
    pub fn is_cleanable(&self, row: &dyn MvccVersionAware) -> bool {
        row.coordinator_version() < self.version.coordinator_version()
            || (row.coordinator_version() == self.version.coordinator_version()
                && row.counter() <= self.cleanup_version)
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MvccSnapshot [{}, cleanupVer={}, activeTxs={:?}]",
            self.version, self.cleanup_version, self.active_txs
        )
    }
}

/// One prior version of a row touched by an update.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct MvccHistoryRow {
    /// Location of the row version in its data page.
    pub link: u64,
    /// Version that created the row.
    pub version: MvccVersion,
    /// Version that replaced it, if any.
    pub new_version: Option<MvccVersion>,
}

impl MvccHistoryRow {
    /// Returns `true` once a newer version has replaced this one.
    pub fn is_superseded(&self) -> bool {
        self.new_version.is_some()
    }
}
