use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::types::{GroupId, PageId};

/// Resident page bytes plus bookkeeping shared by every handle to the page.
#[derive(Clone)]
pub(crate) struct PageFrame {
    buf: Arc<RwLock<Box<[u8]>>>,
    dirty: Arc<AtomicBool>,
}

impl PageFrame {
    pub(crate) fn blank(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn read(&self, group: GroupId, id: PageId) -> PageRef {
        PageRef {
            group,
            id,
            guard: self.buf.read_arc(),
        }
    }

    pub(crate) fn write(&self, group: GroupId, id: PageId) -> PageMut {
        PageMut {
            group,
            id,
            guard: self.buf.write_arc(),
            dirty: Arc::clone(&self.dirty),
        }
    }
}

/// Shared read access to one page; holds the page's read lock.
pub struct PageRef {
    /// Group owning the page.
    pub group: GroupId,
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl PageRef {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }
}

/// Exclusive access to one page; holds the page's write lock.
///
/// This is the page-level mutual exclusion delta application relies on.
pub struct PageMut {
    /// Group owning the page.
    pub group: GroupId,
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    dirty: Arc<AtomicBool>,
}

impl PageMut {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    /// Returns the page bytes for mutation and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty.store(true, Ordering::Release);
        &mut self.guard[..]
    }
}
