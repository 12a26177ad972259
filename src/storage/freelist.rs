#![forbid(unsafe_code)]
//! Page-resident chain of free-list node pages.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::pager::{PageMemory, PageStore};
use crate::storage::journal::Journal;
use crate::storage::record::{PageDelta, WalRecord};
use crate::types::{GroupId, KindleError, PageId, Result};

/// Node pages of the chain starting at `head`, in link order.
///
/// Fails with a corruption error if following `next` revisits a node.
pub fn chain_nodes(pages: &PageMemory, group: GroupId, head: PageId) -> Result<Vec<PageId>> {
    let registry = pages.page_io();
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        if !seen.insert(cur) {
            return Err(KindleError::Corruption("free list cycle"));
        }
        nodes.push(cur);
        let page = pages.page(group, cur)?;
        cur = registry.pages_list_for_page(page.data())?.next_id(page.data())?;
    }
    Ok(nodes)
}

/// Every data page referenced by the chain, node by node in slot order.
pub fn chain_pages(pages: &PageMemory, group: GroupId, head: PageId) -> Result<Vec<PageId>> {
    let registry = pages.page_io();
    let mut out = Vec::new();
    for node in chain_nodes(pages, group, head)? {
        let page = pages.page(group, node)?;
        out.extend(registry.pages_list_for_page(page.data())?.pages(page.data())?);
    }
    Ok(out)
}

/// Checks that the head has no predecessor and that every link is mirrored
/// by the next node's previous pointer.
pub fn verify_chain(pages: &PageMemory, group: GroupId, head: PageId) -> Result<()> {
    let registry = pages.page_io();
    let nodes = chain_nodes(pages, group, head)?;
    let mut expected_prev = PageId::NULL;
    for node in nodes {
        let page = pages.page(group, node)?;
        let prev = registry
            .pages_list_for_page(page.data())?
            .prev_id(page.data())?;
        if prev != expected_prev {
            return Err(KindleError::StructuralInvariant {
                group,
                page: node,
                reason: format!("prev pointer is {prev}, expected {expected_prev}"),
            });
        }
        expected_prev = node;
    }
    Ok(())
}

/// A free list of data pages for one group, mutated only through the journal.
///
/// Linking a new node is logged as two single-page records, init of the new
/// node first, so a crash between them leaves an unreferenced node rather
/// than a dangling link. Every data page is held at most once.
pub struct FreeList {
    journal: Arc<Journal>,
    group: GroupId,
    head: PageId,
    state: Mutex<ListState>,
}

struct ListState {
    tail: PageId,
    nodes: HashSet<PageId>,
    free: HashSet<PageId>,
}

impl FreeList {
    /// Allocates and formats a fresh head node.
    pub fn create(journal: Arc<Journal>, group: GroupId) -> Result<Self> {
        let pages = journal.pages();
        let head = pages.allocate_page(group)?;
        let io = pages.page_io().latest_pages_list()?;
        journal.log_and_apply(&WalRecord::PagesListInitNewPage {
            delta: PageDelta::new(group, head, io),
            prev_page_id: PageId::NULL,
            add_data_page_id: PageId::NULL,
        })?;
        debug!(group = group.0, head = head.0, "freelist.create");
        Ok(Self {
            journal,
            group,
            head,
            state: Mutex::new(ListState {
                tail: head,
                nodes: HashSet::from([head]),
                free: HashSet::new(),
            }),
        })
    }

    /// Attaches to an existing chain, e.g. after replay.
    ///
    /// A chain that references some data page twice is rejected.
    pub fn open(journal: Arc<Journal>, group: GroupId, head: PageId) -> Result<Self> {
        if head.is_null() {
            return Err(KindleError::Invalid("free list head is the null page"));
        }
        verify_chain(journal.pages(), group, head)?;
        let nodes = chain_nodes(journal.pages(), group, head)?;
        let tail = nodes.last().copied().unwrap_or(head);
        let mut free = HashSet::new();
        for page in chain_pages(journal.pages(), group, head)? {
            if !free.insert(page) {
                return Err(KindleError::StructuralInvariant {
                    group,
                    page,
                    reason: "data page referenced twice by the free list".to_string(),
                });
            }
        }
        Ok(Self {
            journal,
            group,
            head,
            state: Mutex::new(ListState {
                tail,
                nodes: nodes.into_iter().collect(),
                free,
            }),
        })
    }

    /// Head node page.
    pub fn head(&self) -> PageId {
        self.head
    }

    /// Current tail node page.
    pub fn tail(&self) -> PageId {
        self.state.lock().tail
    }

    /// Returns `true` if `page` is currently held as a free data page.
    pub fn contains(&self, page: PageId) -> bool {
        self.state.lock().free.contains(&page)
    }

    /// Records `data_page` as free.
    ///
    /// A page that is already free, or that is one of the list's own node
    /// pages, is refused with [`KindleError::InvalidOwned`].
    pub fn put(&self, data_page: PageId) -> Result<()> {
        if data_page.is_null() {
            return Err(KindleError::Invalid("cannot free the null page"));
        }
        let pages = self.journal.pages();
        let page_size = pages.real_page_size(self.group)?;
        let mut state = self.state.lock();
        if state.free.contains(&data_page) {
            return Err(KindleError::InvalidOwned(format!(
                "page {data_page} is already free"
            )));
        }
        if state.nodes.contains(&data_page) {
            return Err(KindleError::InvalidOwned(format!(
                "page {data_page} is a free-list node"
            )));
        }
        let tail = state.tail;
        let (delta, count, capacity) = {
            let page = pages.page(self.group, tail)?;
            let io = pages.page_io().pages_list_for_page(page.data())?;
            (
                PageDelta::new(self.group, tail, io),
                io.count(page.data())?,
                io.capacity(page_size),
            )
        };
        if count < capacity {
            let slot = u16::try_from(count)
                .map_err(|_| KindleError::Corruption("free-list slot index exceeds u16"))?;
            self.journal.log_and_apply(&WalRecord::PagesListAddPage {
                delta,
                slot,
                data_page_id: data_page,
            })?;
            state.free.insert(data_page);
            return Ok(());
        }
        let node = pages.allocate_page(self.group)?;
        let io = pages.page_io().latest_pages_list()?;
        self.journal.log_and_apply_batch(&[
            WalRecord::PagesListInitNewPage {
                delta: PageDelta::new(self.group, node, io),
                prev_page_id: tail,
                add_data_page_id: data_page,
            },
            WalRecord::PagesListSetNext {
                delta,
                next_page_id: node,
            },
        ])?;
        debug!(group = self.group.0, prev = tail.0, node = node.0, "freelist.link_node");
        state.tail = node;
        state.nodes.insert(node);
        state.free.insert(data_page);
        Ok(())
    }

    /// Takes one free page, or `None` when the list is empty.
    ///
    /// An emptied non-head tail node is unlinked and handed out itself.
    pub fn take(&self) -> Result<Option<PageId>> {
        let pages = self.journal.pages();
        let mut state = self.state.lock();
        let tail = state.tail;
        let (delta, last, prev) = {
            let page = pages.page(self.group, tail)?;
            let io = pages.page_io().pages_list_for_page(page.data())?;
            let count = io.count(page.data())?;
            let last = match count {
                0 => None,
                n => Some((n - 1, io.page_at(page.data(), n - 1)?)),
            };
            (
                PageDelta::new(self.group, tail, io),
                last,
                io.prev_id(page.data())?,
            )
        };
        if let Some((idx, data_page)) = last {
            let slot = u16::try_from(idx)
                .map_err(|_| KindleError::Corruption("free-list slot index exceeds u16"))?;
            self.journal.log_and_apply(&WalRecord::PagesListRemovePage {
                delta,
                slot,
                data_page_id: data_page,
            })?;
            state.free.remove(&data_page);
            return Ok(Some(data_page));
        }
        if tail == self.head {
            return Ok(None);
        }
        let prev_delta = {
            let page = pages.page(self.group, prev)?;
            PageDelta::new(
                self.group,
                prev,
                pages.page_io().pages_list_for_page(page.data())?,
            )
        };
        self.journal.log_and_apply(&WalRecord::PagesListSetNext {
            delta: prev_delta,
            next_page_id: PageId::NULL,
        })?;
        state.tail = prev;
        state.nodes.remove(&tail);
        debug!(group = self.group.0, node = tail.0, "freelist.reuse_node");
        Ok(Some(tail))
    }

    /// Node pages from head to tail.
    pub fn nodes(&self) -> Result<Vec<PageId>> {
        chain_nodes(self.journal.pages(), self.group, self.head)
    }

    /// Every free data page currently referenced.
    pub fn pages(&self) -> Result<Vec<PageId>> {
        chain_pages(self.journal.pages(), self.group, self.head)
    }

    /// Checks prev/next symmetry along the chain.
    pub fn verify(&self) -> Result<()> {
        verify_chain(self.journal.pages(), self.group, self.head)
    }
}
