#![forbid(unsafe_code)]
//! Crash recovery: replay the log against freshly loaded pages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::primitives::pager::PageMemory;
use crate::primitives::wal::Wal;
use crate::storage::journal::with_record_context;
use crate::storage::record::{SnapshotRecord, WalRecord};
use crate::types::{GroupId, KindleError, Lsn, PageId, Result};

/// What to do when a delta cannot be replayed onto its page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayPolicy {
    /// Abort the whole replay on the first failure.
    #[default]
    FailFast,
    /// Stop replaying onto the failing page, record why, and carry on.
    Quarantine,
}

/// A page excluded from further replay.
#[derive(Clone, Debug, Serialize)]
pub struct QuarantinedPage {
    /// Group owning the page.
    pub group: GroupId,
    /// The page.
    pub page: PageId,
    /// Record that failed.
    pub lsn: Lsn,
    /// Failure description.
    pub reason: String,
}

/// Summary of one replay pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Delta records applied.
    pub applied: u64,
    /// Delta records skipped because their page was quarantined earlier.
    pub skipped: u64,
    /// Snapshot and checkpoint markers seen.
    pub whole_records: u64,
    /// LSN of the last valid record.
    pub last_lsn: Option<Lsn>,
    /// Last snapshot marker seen.
    pub last_snapshot: Option<SnapshotRecord>,
    /// Last checkpoint marker seen.
    pub last_checkpoint: Option<u64>,
    /// Pages excluded from replay, in the order they failed.
    pub quarantined: Vec<QuarantinedPage>,
    /// File offset where the valid log prefix ends.
    pub valid_up_to: u64,
}

impl RecoveryReport {
    /// Returns `true` when every record was replayed.
    pub fn is_clean(&self) -> bool {
        self.quarantined.is_empty()
    }
}

/// Replay driver.
pub struct Recovery;

impl Recovery {
    /// Applies every delta in the valid prefix of `wal` to `pages`, in LSN order.
    ///
    /// Records that cannot be decoded always abort replay: without a decoded
    /// record there is no page to quarantine.
    pub fn replay(wal: &Wal, pages: &PageMemory, policy: ReplayPolicy) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut quarantined: BTreeSet<(GroupId, PageId)> = BTreeSet::new();
        let mut iter = wal.iter()?;
        while let Some(frame) = iter.next_frame()? {
            let lsn = frame.pointer.lsn;
            report.last_lsn = Some(lsn);
            let record = WalRecord::decode(&frame.payload).map_err(|err| {
                error!(lsn = lsn.0, error = %err, "recovery.decode_failed");
                err
            })?;
            let Some(delta) = record.delta().copied() else {
                report.whole_records += 1;
                match record {
                    WalRecord::Snapshot(snap) => report.last_snapshot = Some(snap),
                    WalRecord::Checkpoint { checkpoint_id } => {
                        report.last_checkpoint = Some(checkpoint_id)
                    }
                    _ => {}
                }
                continue;
            };
            let key = (delta.group_id, delta.page_id);
            if quarantined.contains(&key) {
                report.skipped += 1;
                continue;
            }
            match Self::apply(pages, &record) {
                Ok(()) => report.applied += 1,
                Err(err) if policy == ReplayPolicy::Quarantine => {
                    warn!(
                        lsn = lsn.0,
                        group = delta.group_id.0,
                        page = delta.page_id.0,
                        record = %record.record_type(),
                        error = %err,
                        "recovery.quarantine"
                    );
                    quarantined.insert(key);
                    report.quarantined.push(QuarantinedPage {
                        group: delta.group_id,
                        page: delta.page_id,
                        lsn,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    error!(
                        lsn = lsn.0,
                        group = delta.group_id.0,
                        page = delta.page_id.0,
                        record = %record.record_type(),
                        error = %err,
                        "recovery.failed"
                    );
                    return Err(err);
                }
            }
        }
        report.valid_up_to = iter.valid_up_to();
        info!(
            applied = report.applied,
            whole_records = report.whole_records,
            quarantined = report.quarantined.len(),
            valid_up_to = report.valid_up_to,
            "recovery.done"
        );
        Ok(report)
    }

    fn apply(pages: &PageMemory, record: &WalRecord) -> Result<()> {
        let delta = record
            .delta()
            .ok_or(KindleError::Invalid("whole records carry no page delta"))?;
        let mut page = pages
            .page_mut(delta.group_id, delta.page_id)
            .map_err(|err| with_record_context(err, record))?;
        record.apply_delta(pages, page.data_mut())?;
        debug!(record = %record, "recovery.applied");
        Ok(())
    }
}
