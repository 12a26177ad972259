#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::primitives::pager::PageMemory;
use crate::primitives::wal::Wal;
use crate::storage::record::WalRecord;
use crate::storage::wal_state::WalStateRegistry;
use crate::types::{GroupId, KindleError, PageId, Result, WalPointer};

/// Write path for page mutations: log the delta, then apply it to the live page.
///
/// Multi-page changes are handed over as an ordered batch of single-page
/// records; each record is applied under its own page lock and no two page
/// locks are held at once.
pub struct Journal {
    wal: Arc<Wal>,
    pages: Arc<PageMemory>,
    wal_state: Arc<WalStateRegistry>,
}

impl Journal {
    /// Wires a journal over a log, a page memory and the per-group WAL switches.
    pub fn new(wal: Arc<Wal>, pages: Arc<PageMemory>, wal_state: Arc<WalStateRegistry>) -> Self {
        Self {
            wal,
            pages,
            wal_state,
        }
    }

    /// The underlying log.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// The live page memory.
    pub fn pages(&self) -> &Arc<PageMemory> {
        &self.pages
    }

    /// Per-group logging switches.
    pub fn wal_state(&self) -> &Arc<WalStateRegistry> {
        &self.wal_state
    }

    fn should_log(&self, record: &WalRecord) -> bool {
        record
            .group_id()
            .map_or(true, |group| self.wal_state.is_enabled(group))
    }

    /// Logs a whole record (snapshot or checkpoint marker).
    pub fn log(&self, record: &WalRecord) -> Result<WalPointer> {
        if record.delta().is_some() {
            return Err(KindleError::Invalid("page deltas go through log_and_apply"));
        }
        self.wal.append(&record.encode())
    }

    /// Logs `record` when its group has WAL enabled, then applies it.
    ///
    /// Returns where the record landed in the log, or `None` when logging is
    /// disabled for the group.
    pub fn log_and_apply(&self, record: &WalRecord) -> Result<Option<WalPointer>> {
        let mut pointers = self.log_and_apply_batch(std::slice::from_ref(record))?;
        Ok(pointers.pop().flatten())
    }

    /// Logs every record in one coalesced append, then applies them in order.
    ///
    /// The batch is first replayed against scratch copies of its pages; if
    /// any record fails there, nothing is logged and no live page changes.
    pub fn log_and_apply_batch(&self, records: &[WalRecord]) -> Result<Vec<Option<WalPointer>>> {
        if records.iter().any(|r| r.delta().is_none()) {
            return Err(KindleError::Invalid("batch contains a whole record"));
        }
        self.stage(records)?;
        let encoded: Vec<Vec<u8>> = records
            .iter()
            .filter(|r| self.should_log(r))
            .map(WalRecord::encode)
            .collect();
        let payloads: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        let mut logged = self
            .wal
            .append_batch(&payloads)
            .map_err(|err| with_record_context(err, &records[0]))?
            .into_iter();

        let mut pointers = Vec::with_capacity(records.len());
        for record in records {
            let pointer = if self.should_log(record) {
                logged.next()
            } else {
                None
            };
            self.apply(record)?;
            pointers.push(pointer);
        }
        Ok(pointers)
    }

    /// Applies `records` in order to private copies of their pages.
    fn stage(&self, records: &[WalRecord]) -> Result<()> {
        let mut scratch: HashMap<(GroupId, PageId), Vec<u8>> = HashMap::new();
        for record in records {
            let delta = record
                .delta()
                .ok_or(KindleError::Invalid("whole records carry no page delta"))?;
            let key = (delta.group_id, delta.page_id);
            let page = match scratch.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(
                    self.pages
                        .page_snapshot(delta.group_id, delta.page_id)
                        .map_err(|err| with_record_context(err, record))?,
                ),
            };
            if let Err(err) = record.apply_delta(&*self.pages, page) {
                warn!(record = %record, error = %err, "journal.stage_rejected");
                return Err(err);
            }
        }
        Ok(())
    }

    fn apply(&self, record: &WalRecord) -> Result<()> {
        let delta = record
            .delta()
            .ok_or(KindleError::Invalid("whole records carry no page delta"))?;
        let mut page = self
            .pages
            .page_mut(delta.group_id, delta.page_id)
            .map_err(|err| with_record_context(err, record))?;
        if let Err(err) = record.apply_delta(&*self.pages, page.data_mut()) {
            error!(record = %record, error = %err, "journal.apply_failed");
            return Err(err);
        }
        debug!(record = %record.record_type(), page = delta.page_id.0, "journal.applied");
        Ok(())
    }
}

/// Attaches group, page and record name to raw I/O failures.
pub(crate) fn with_record_context(err: KindleError, record: &WalRecord) -> KindleError {
    match (err, record.delta()) {
        (KindleError::Io(source), Some(delta)) => KindleError::io_failure(
            delta.group_id,
            delta.page_id,
            record.record_type().name(),
            source,
        ),
        (err, _) => err,
    }
}
