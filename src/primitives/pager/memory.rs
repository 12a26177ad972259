use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::frame::{PageFrame, PageMut, PageRef};
use crate::storage::page_io::{PageIoRegistry, MIN_PAGE_SIZE};
use crate::types::{GroupId, KindleError, PageId, Result};

/// Capability the delta-replay core needs from whatever owns the pages.
pub trait PageStore: Send + Sync {
    /// Usable size in bytes of every page in `group`.
    fn real_page_size(&self, group: GroupId) -> Result<usize>;
    /// Registry resolving `(io_type, io_version)` to page-format handlers.
    fn page_io(&self) -> &PageIoRegistry;
}

struct GroupPages {
    page_size: usize,
    /// Next id `allocate_page` hands out; `None` once `u64::MAX` is taken.
    next_page: Option<u64>,
    frames: HashMap<PageId, PageFrame>,
}

impl GroupPages {
    fn frame(&mut self, id: PageId) -> PageFrame {
        if self.next_page.is_some_and(|next| id.0 >= next) {
            self.next_page = id.0.checked_add(1);
        }
        let page_size = self.page_size;
        self.frames
            .entry(id)
            .or_insert_with(|| PageFrame::blank(page_size))
            .clone()
    }
}

/// In-memory page store: fixed-size pages per group, each behind its own lock.
///
/// Pages materialize zero-filled on first access, which is what replay
/// against "freshly loaded" pages expects.
pub struct PageMemory {
    registry: PageIoRegistry,
    groups: RwLock<HashMap<GroupId, GroupPages>>,
}

impl Default for PageMemory {
    fn default() -> Self {
        Self::new(PageIoRegistry::default())
    }
}

impl PageMemory {
    /// Creates an empty page memory using `registry` for format resolution.
    pub fn new(registry: PageIoRegistry) -> Self {
        Self {
            registry,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Declares a group and its page size. Re-registering with the same size is a no-op.
    pub fn register_group(&self, group: GroupId, page_size: usize) -> Result<()> {
        if page_size < MIN_PAGE_SIZE {
            return Err(KindleError::Invalid("page size below minimum"));
        }
        let mut groups = self.groups.write();
        if let Some(existing) = groups.get(&group) {
            if existing.page_size != page_size {
                return Err(KindleError::Invalid("group already registered with another page size"));
            }
            return Ok(());
        }
        groups.insert(
            group,
            GroupPages {
                page_size,
                next_page: Some(1),
                frames: HashMap::new(),
            },
        );
        debug!(group = group.0, page_size, "pager.group_registered");
        Ok(())
    }

    /// Returns every registered group.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<_> = self.groups.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Hands out a page id never used before in `group`.
    pub fn allocate_page(&self, group: GroupId) -> Result<PageId> {
        let mut groups = self.groups.write();
        let pages = groups.get_mut(&group).ok_or(KindleError::NotFound)?;
        let id = pages
            .next_page
            .ok_or(KindleError::Invalid("group page ids exhausted"))?;
        pages.next_page = id.checked_add(1);
        Ok(PageId(id))
    }

    fn frame(&self, group: GroupId, id: PageId) -> Result<PageFrame> {
        if id.is_null() {
            return Err(KindleError::Invalid("null page id"));
        }
        if let Some(frame) = self
            .groups
            .read()
            .get(&group)
            .and_then(|pages| pages.frames.get(&id).cloned())
        {
            return Ok(frame);
        }
        let mut groups = self.groups.write();
        let pages = groups.get_mut(&group).ok_or(KindleError::NotFound)?;
        Ok(pages.frame(id))
    }

    /// Locks a page for reading.
    pub fn page(&self, group: GroupId, id: PageId) -> Result<PageRef> {
        Ok(self.frame(group, id)?.read(group, id))
    }

    /// Locks a page for writing.
    pub fn page_mut(&self, group: GroupId, id: PageId) -> Result<PageMut> {
        Ok(self.frame(group, id)?.write(group, id))
    }

    /// Copies the current bytes of a page.
    pub fn page_snapshot(&self, group: GroupId, id: PageId) -> Result<Vec<u8>> {
        Ok(self.page(group, id)?.data().to_vec())
    }

    /// Returns `true` when the page has been materialized.
    pub fn contains_page(&self, group: GroupId, id: PageId) -> bool {
        self.groups
            .read()
            .get(&group)
            .is_some_and(|pages| pages.frames.contains_key(&id))
    }

    /// Pages of `group` modified since the last [`PageMemory::clear_dirty`].
    pub fn dirty_pages(&self, group: GroupId) -> Vec<PageId> {
        let groups = self.groups.read();
        let mut ids: Vec<PageId> = groups
            .get(&group)
            .map(|pages| {
                pages
                    .frames
                    .iter()
                    .filter(|(_, frame)| frame.is_dirty())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Resets the dirty flag on every page.
    pub fn clear_dirty(&self) {
        for pages in self.groups.read().values() {
            for frame in pages.frames.values() {
                frame.clear_dirty();
            }
        }
    }
}

impl PageStore for PageMemory {
    fn real_page_size(&self, group: GroupId) -> Result<usize> {
        self.groups
            .read()
            .get(&group)
            .map(|pages| pages.page_size)
            .ok_or(KindleError::NotFound)
    }

    fn page_io(&self) -> &PageIoRegistry {
        &self.registry
    }
}
