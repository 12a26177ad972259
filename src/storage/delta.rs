#![forbid(unsafe_code)]
//! Applying page delta records to page bytes.

use tracing::trace;

use crate::primitives::pager::PageStore;
use crate::storage::page_io::{PageHeader, PagesListNodeIo};
use crate::storage::record::{PageDelta, WalRecord};
use crate::types::{KindleError, Result};

/// Resolves the node handler named by the page's own header and checks it
/// against what the record was produced for.
fn node_io_for_page<'a>(
    store: &'a dyn PageStore,
    delta: &PageDelta,
    page: &[u8],
) -> Result<&'a dyn PagesListNodeIo> {
    let header = PageHeader::parse(page)?;
    let io = store.page_io().pages_list_for_page(page)?;
    if header.io_type != delta.io_type || header.io_version != delta.io_version {
        return Err(KindleError::CorruptPageFormat {
            io_type: header.io_type,
            io_version: header.io_version,
            reason: "record format disagrees with page header",
        });
    }
    if header.page_id != delta.page_id {
        return Err(KindleError::StructuralInvariant {
            group: delta.group_id,
            page: delta.page_id,
            reason: format!("page header names page {}", header.page_id),
        });
    }
    Ok(io)
}

impl WalRecord {
    /// Replays this delta record against the bytes of its target page.
    ///
    /// The caller holds the page's write lock. Applying the same record twice
    /// leaves the page as applying it once does. Whole records are not page
    /// mutations and yield [`KindleError::Unsupported`].
    pub fn apply_delta(&self, store: &dyn PageStore, page: &mut [u8]) -> Result<()> {
        let delta = self
            .delta()
            .ok_or(KindleError::Unsupported("whole records carry no page delta"))?;
        let page_size = store.real_page_size(delta.group_id)?;
        if page.len() < page_size {
            return Err(KindleError::Invalid("page buffer smaller than group page size"));
        }
        trace!(
            record = %self.record_type(),
            group = delta.group_id.0,
            page = delta.page_id.0,
            "delta.apply"
        );
        match self {
            WalRecord::PagesListInitNewPage {
                prev_page_id,
                add_data_page_id,
                ..
            } => {
                let io = store
                    .page_io()
                    .pages_list(delta.io_type, delta.io_version)?;
                // Built aside so a failed assertion leaves the page as it was.
                let mut fresh = page[..page_size].to_vec();
                io.init_new_page(&mut fresh, delta.page_id, page_size)?;
                io.set_previous_id(&mut fresh, *prev_page_id)?;
                if !add_data_page_id.is_null() {
                    let count = io.count(&fresh)?;
                    if count != 0 {
                        return Err(KindleError::StructuralInvariant {
                            group: delta.group_id,
                            page: delta.page_id,
                            reason: format!("new free-list node already holds {count} slot(s)"),
                        });
                    }
                    io.add_page(&mut fresh, *add_data_page_id, page_size)?;
                }
                page[..page_size].copy_from_slice(&fresh);
                Ok(())
            }
            WalRecord::PagesListSetNext { next_page_id, .. } => {
                node_io_for_page(store, delta, page)?.set_next_id(page, *next_page_id)
            }
            WalRecord::PagesListSetPrevious { prev_page_id, .. } => {
                node_io_for_page(store, delta, page)?.set_previous_id(page, *prev_page_id)
            }
            WalRecord::PagesListAddPage {
                slot, data_page_id, ..
            } => node_io_for_page(store, delta, page)?.set_page_at(
                page,
                usize::from(*slot),
                *data_page_id,
                page_size,
            ),
            WalRecord::PagesListRemovePage {
                slot, data_page_id, ..
            } => node_io_for_page(store, delta, page)?
                .remove_page_at(page, usize::from(*slot), *data_page_id)
                .map(|_| ()),
            WalRecord::Snapshot(_) | WalRecord::Checkpoint { .. } => {
                Err(KindleError::Unsupported("whole records carry no page delta"))
            }
        }
    }
}
