use super::{io_type, PageIo, PAGE_HDR_LEN};
use crate::primitives::bytes::field;
use crate::types::{KindleError, PageId, Result};

const PREV_OFFSET: usize = PAGE_HDR_LEN;
const NEXT_OFFSET: usize = PAGE_HDR_LEN + 8;
const COUNT_OFFSET: usize = PAGE_HDR_LEN + 16;
const SLOTS_OFFSET: usize = PAGE_HDR_LEN + 24;
const SLOT_LEN: usize = 8;

/// Bytes taken by the common header plus the node header before the slots.
pub const NODE_HEADER_LEN: usize = SLOTS_OFFSET;

/// Free-list node page format.
///
/// A node holds a previous pointer, a next pointer, and an inline array of
/// data-page ids. `prev_id == 0` marks the head of a chain.
pub trait PagesListNodeIo: PageIo {
    /// Previous node in the chain, or the null page for the head.
    fn prev_id(&self, page: &[u8]) -> Result<PageId>;
    /// Sets the previous-node pointer.
    fn set_previous_id(&self, page: &mut [u8], prev: PageId) -> Result<()>;
    /// Next node in the chain, or the null page for the tail.
    fn next_id(&self, page: &[u8]) -> Result<PageId>;
    /// Sets the next-node pointer.
    fn set_next_id(&self, page: &mut [u8], next: PageId) -> Result<()>;
    /// Number of occupied slots.
    fn count(&self, page: &[u8]) -> Result<usize>;
    /// Slots a node of `page_size` bytes can hold.
    fn capacity(&self, page_size: usize) -> usize;
    /// Data page stored in slot `idx`.
    fn page_at(&self, page: &[u8], idx: usize) -> Result<PageId>;
    /// Writes slot `idx`, growing the count to cover it.
    ///
    /// Writing the same `(idx, data_page)` twice leaves the page unchanged
    /// after the first write. `idx` may not leave a gap past the current count.
    fn set_page_at(&self, page: &mut [u8], idx: usize, data_page: PageId, page_size: usize)
        -> Result<()>;
    /// Appends `data_page` and returns the slot count before the append.
    fn add_page(&self, page: &mut [u8], data_page: PageId, page_size: usize) -> Result<usize> {
        let count = self.count(page)?;
        if count >= self.capacity(page_size) {
            return Err(KindleError::Invalid("free-list node is full"));
        }
        self.set_page_at(page, count, data_page, page_size)?;
        Ok(count)
    }
    /// Removes `data_page` if present, keeping the other slots in order.
    fn remove_page(&self, page: &mut [u8], data_page: PageId) -> Result<bool>;
    /// Clears slot `idx` when it is the last occupied slot and holds `data_page`.
    ///
    /// Returns `Ok(false)` without touching the page when the slot is past
    /// the count or holds another page, so a repeated call is a no-op.
    /// Removing from the middle of the array is `Invalid`.
    fn remove_page_at(&self, page: &mut [u8], idx: usize, data_page: PageId) -> Result<bool>;

    /// Every occupied slot, in slot order.
    fn pages(&self, page: &[u8]) -> Result<Vec<PageId>> {
        (0..self.count(page)?)
            .map(|idx| self.page_at(page, idx))
            .collect()
    }
}

/// Version 1 of the free-list node layout.
///
/// ```text
/// 0   common header (16 bytes)
/// 16  prev_id  u64
/// 24  next_id  u64
/// 32  count    u16
/// 34  reserved
/// 40  slots    u64 * capacity
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct PagesListNodeIoV1;

impl PagesListNodeIoV1 {
    fn slot_offset(idx: usize) -> usize {
        SLOTS_OFFSET + idx * SLOT_LEN
    }
}

impl PageIo for PagesListNodeIoV1 {
    fn io_type(&self) -> u16 {
        io_type::PAGES_LIST_NODE
    }

    fn version(&self) -> u16 {
        1
    }
}

impl PagesListNodeIo for PagesListNodeIoV1 {
    fn prev_id(&self, page: &[u8]) -> Result<PageId> {
        field::read_u64(page, PREV_OFFSET).map(PageId)
    }

    fn set_previous_id(&self, page: &mut [u8], prev: PageId) -> Result<()> {
        field::write_u64(page, PREV_OFFSET, prev.0)
    }

    fn next_id(&self, page: &[u8]) -> Result<PageId> {
        field::read_u64(page, NEXT_OFFSET).map(PageId)
    }

    fn set_next_id(&self, page: &mut [u8], next: PageId) -> Result<()> {
        field::write_u64(page, NEXT_OFFSET, next.0)
    }

    fn count(&self, page: &[u8]) -> Result<usize> {
        let count = field::read_u16(page, COUNT_OFFSET)? as usize;
        if count > self.capacity(page.len()) {
            return Err(KindleError::Corruption("free-list node count exceeds capacity"));
        }
        Ok(count)
    }

    fn capacity(&self, page_size: usize) -> usize {
        page_size.saturating_sub(SLOTS_OFFSET) / SLOT_LEN
    }

    fn page_at(&self, page: &[u8], idx: usize) -> Result<PageId> {
        if idx >= self.count(page)? {
            return Err(KindleError::Invalid("free-list slot index past count"));
        }
        field::read_u64(page, Self::slot_offset(idx)).map(PageId)
    }

    fn set_page_at(
        &self,
        page: &mut [u8],
        idx: usize,
        data_page: PageId,
        page_size: usize,
    ) -> Result<()> {
        if idx >= self.capacity(page_size) {
            return Err(KindleError::Invalid("free-list slot index past capacity"));
        }
        let count = self.count(page)?;
        if idx > count {
            return Err(KindleError::Invalid("free-list slot write leaves a gap"));
        }
        field::write_u64(page, Self::slot_offset(idx), data_page.0)?;
        if idx == count {
            field::write_u16(page, COUNT_OFFSET, (count + 1) as u16)?;
        }
        Ok(())
    }

    fn remove_page(&self, page: &mut [u8], data_page: PageId) -> Result<bool> {
        let count = self.count(page)?;
        let mut found = None;
        for idx in 0..count {
            if field::read_u64(page, Self::slot_offset(idx))? == data_page.0 {
                found = Some(idx);
                break;
            }
        }
        let Some(idx) = found else {
            return Ok(false);
        };
        let start = Self::slot_offset(idx + 1);
        let end = Self::slot_offset(count);
        page.copy_within(start..end, Self::slot_offset(idx));
        field::write_u64(page, Self::slot_offset(count - 1), 0)?;
        field::write_u16(page, COUNT_OFFSET, (count - 1) as u16)?;
        Ok(true)
    }

    fn remove_page_at(&self, page: &mut [u8], idx: usize, data_page: PageId) -> Result<bool> {
        let count = self.count(page)?;
        if idx >= count || self.page_at(page, idx)? != data_page {
            return Ok(false);
        }
        if idx + 1 != count {
            return Err(KindleError::Invalid("positional removal must target the last slot"));
        }
        field::write_u64(page, Self::slot_offset(idx), 0)?;
        field::write_u16(page, COUNT_OFFSET, idx as u16)?;
        Ok(true)
    }
}
