#![allow(missing_docs)]
#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use kindle::primitives::io::{MemIo, StdFileIo};
use kindle::primitives::pager::PageMemory;
use kindle::primitives::wal::{Wal, WalOptions, WalSyncMode};
use kindle::storage::{
    chain_nodes, chain_pages, verify_chain, FreeList, Journal, PageDelta, PageHeader, PageIo,
    PageIoRegistry, PagesListNodeIo, PagesListNodeIoV1, Recovery, ReplayPolicy, WalRecord,
    WalStateRegistry,
};
use kindle::types::{GroupId, KindleError, Lsn, PageId, Result};
use proptest::prelude::*;

const GROUP: GroupId = GroupId(1);
// Three slots per node, so chains grow quickly.
const SMALL_PAGE: usize = 64;

fn mem_wal() -> Wal {
    Wal::open(
        Arc::new(MemIo::new()),
        WalOptions::new(11, Lsn(1), WalSyncMode::Off),
    )
    .expect("open wal")
}

fn pages(page_size: usize) -> PageMemory {
    let pages = PageMemory::default();
    pages.register_group(GROUP, page_size).expect("register group");
    pages
}

fn journal(wal: Wal, page_size: usize) -> Arc<Journal> {
    Arc::new(Journal::new(
        Arc::new(wal),
        Arc::new(pages(page_size)),
        Arc::new(WalStateRegistry::new()),
    ))
}

fn v1(page: u64) -> PageDelta {
    PageDelta::new(GROUP, PageId(page), &PagesListNodeIoV1)
}

#[test]
fn init_then_set_next_replays_to_expected_node() -> Result<()> {
    let wal = mem_wal();
    wal.append(
        &WalRecord::PagesListInitNewPage {
            delta: v1(100),
            prev_page_id: PageId::NULL,
            add_data_page_id: PageId::NULL,
        }
        .encode(),
    )?;
    wal.append(
        &WalRecord::PagesListSetNext {
            delta: v1(100),
            next_page_id: PageId(200),
        }
        .encode(),
    )?;

    let pages = pages(4096);
    let report = Recovery::replay(&wal, &pages, ReplayPolicy::FailFast)?;
    assert_eq!(report.applied, 2);
    assert!(report.is_clean());

    let page = pages.page(GROUP, PageId(100))?;
    let io = PagesListNodeIoV1;
    assert_eq!(io.prev_id(page.data())?, PageId::NULL);
    assert_eq!(io.next_id(page.data())?, PageId(200));
    assert_eq!(io.count(page.data())?, 0);
    assert_eq!(PageHeader::parse(page.data())?.page_id, PageId(100));
    Ok(())
}

/// Version 2 of the node format whose init rewrites only the common header.
struct HeaderOnlyInitIo;

impl PageIo for HeaderOnlyInitIo {
    fn io_type(&self) -> u16 {
        PagesListNodeIoV1.io_type()
    }

    fn version(&self) -> u16 {
        2
    }

    fn init_new_page(&self, page: &mut [u8], page_id: PageId, _page_size: usize) -> Result<()> {
        PageHeader {
            io_type: self.io_type(),
            io_version: self.version(),
            page_id,
        }
        .write(page)
    }
}

impl PagesListNodeIo for HeaderOnlyInitIo {
    fn prev_id(&self, page: &[u8]) -> Result<PageId> {
        PagesListNodeIoV1.prev_id(page)
    }

    fn set_previous_id(&self, page: &mut [u8], prev: PageId) -> Result<()> {
        PagesListNodeIoV1.set_previous_id(page, prev)
    }

    fn next_id(&self, page: &[u8]) -> Result<PageId> {
        PagesListNodeIoV1.next_id(page)
    }

    fn set_next_id(&self, page: &mut [u8], next: PageId) -> Result<()> {
        PagesListNodeIoV1.set_next_id(page, next)
    }

    fn count(&self, page: &[u8]) -> Result<usize> {
        PagesListNodeIoV1.count(page)
    }

    fn capacity(&self, page_size: usize) -> usize {
        PagesListNodeIoV1.capacity(page_size)
    }

    fn page_at(&self, page: &[u8], idx: usize) -> Result<PageId> {
        PagesListNodeIoV1.page_at(page, idx)
    }

    fn set_page_at(
        &self,
        page: &mut [u8],
        idx: usize,
        data_page: PageId,
        page_size: usize,
    ) -> Result<()> {
        PagesListNodeIoV1.set_page_at(page, idx, data_page, page_size)
    }

    fn remove_page(&self, page: &mut [u8], data_page: PageId) -> Result<bool> {
        PagesListNodeIoV1.remove_page(page, data_page)
    }

    fn remove_page_at(&self, page: &mut [u8], idx: usize, data_page: PageId) -> Result<bool> {
        PagesListNodeIoV1.remove_page_at(page, idx, data_page)
    }
}

#[test]
fn new_node_with_leftover_slot_is_a_structural_violation() -> Result<()> {
    let mut registry = PageIoRegistry::default();
    registry.register_pages_list(Arc::new(HeaderOnlyInitIo))?;
    let pages = PageMemory::new(registry);
    pages.register_group(GROUP, 128)?;

    // The page already holds one slot from an earlier life as a v1 node.
    {
        let mut page = pages.page_mut(GROUP, PageId(5))?;
        WalRecord::PagesListInitNewPage {
            delta: v1(5),
            prev_page_id: PageId::NULL,
            add_data_page_id: PageId(30),
        }
        .apply_delta(&pages, page.data_mut())?;
    }

    let record = WalRecord::PagesListInitNewPage {
        delta: PageDelta::new(GROUP, PageId(5), &HeaderOnlyInitIo),
        prev_page_id: PageId::NULL,
        add_data_page_id: PageId(40),
    };
    let before = pages.page_snapshot(GROUP, PageId(5))?;
    let mut page = pages.page_mut(GROUP, PageId(5))?;
    let err = record.apply_delta(&pages, page.data_mut()).unwrap_err();
    match err {
        KindleError::StructuralInvariant { group, page: id, .. } => {
            assert_eq!(group, GROUP);
            assert_eq!(id, PageId(5));
        }
        other => panic!("expected a structural violation, got {other:?}"),
    }
    assert_eq!(page.data(), before.as_slice());
    assert_eq!(HeaderOnlyInitIo.pages(page.data())?, vec![PageId(30)]);
    Ok(())
}

#[test]
fn unknown_node_version_is_never_guessed() -> Result<()> {
    let pages = pages(128);
    let record = WalRecord::PagesListInitNewPage {
        delta: PageDelta::new(GROUP, PageId(5), &HeaderOnlyInitIo),
        prev_page_id: PageId::NULL,
        add_data_page_id: PageId::NULL,
    };
    let mut page = pages.page_mut(GROUP, PageId(5))?;
    let err = record.apply_delta(&pages, page.data_mut()).unwrap_err();
    assert!(matches!(
        err,
        KindleError::CorruptPageFormat { io_version: 2, .. }
    ));
    Ok(())
}

#[test]
fn file_backed_free_list_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kindle.wal");
    let options = WalOptions::new(5, Lsn(1), WalSyncMode::Immediate);

    let (head, live_nodes, live_pages, snapshots) = {
        let wal = Wal::open(Arc::new(StdFileIo::open(&path)?), options.clone())?;
        let journal = journal(wal, SMALL_PAGE);
        let list = FreeList::create(Arc::clone(&journal), GROUP)?;
        for id in 1000..1020 {
            list.put(PageId(id))?;
        }
        for _ in 0..5 {
            list.take()?;
        }
        list.verify()?;
        let pages = journal.pages();
        let mut snapshots = Vec::new();
        for id in pages.dirty_pages(GROUP) {
            snapshots.push((id, pages.page_snapshot(GROUP, id)?));
        }
        (list.head(), list.nodes()?, list.pages()?, snapshots)
    };

    let wal = Wal::open(Arc::new(StdFileIo::open(&path)?), options)?;
    let replayed = pages(SMALL_PAGE);
    let report = Recovery::replay(&wal, &replayed, ReplayPolicy::FailFast)?;
    assert!(report.is_clean());
    assert_eq!(chain_nodes(&replayed, GROUP, head)?, live_nodes);
    assert_eq!(chain_pages(&replayed, GROUP, head)?, live_pages);
    verify_chain(&replayed, GROUP, head)?;
    for (id, bytes) in snapshots {
        assert_eq!(replayed.page_snapshot(GROUP, id)?, bytes, "page {id}");
    }

    let journal = Arc::new(Journal::new(
        Arc::new(wal),
        Arc::new(replayed),
        Arc::new(WalStateRegistry::new()),
    ));
    let reopened = FreeList::open(journal, GROUP, head)?;
    assert_eq!(reopened.tail(), *live_nodes.last().expect("tail"));
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    /// Frees data page `10_000 + k`; ids repeat across a run.
    Put(u64),
    Take,
    /// Frees the most recently taken page again, node pages included.
    PutBack,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0u64..24).prop_map(Op::Put),
            2 => Just(Op::Take),
            1 => Just(Op::PutBack),
        ],
        1..80,
    )
}

fn run_ops(ops: &[Op]) -> (Arc<Journal>, PageId) {
    let journal = journal(mem_wal(), SMALL_PAGE);
    let list = FreeList::create(Arc::clone(&journal), GROUP).expect("create");
    let mut free = HashSet::new();
    let mut taken = Vec::new();
    for op in ops {
        let page = match op {
            Op::Put(k) => PageId(10_000 + k),
            Op::PutBack => match taken.pop() {
                Some(page) => page,
                None => continue,
            },
            Op::Take => {
                if let Some(page) = list.take().expect("take") {
                    free.remove(&page);
                    taken.push(page);
                }
                continue;
            }
        };
        match list.put(page) {
            Ok(()) => assert!(free.insert(page), "{page} freed twice"),
            Err(KindleError::InvalidOwned(_)) => assert!(free.contains(&page)),
            Err(other) => panic!("put {page}: {other:?}"),
        }
    }
    let mut held = list.pages().expect("pages");
    held.sort();
    let before = held.len();
    held.dedup();
    assert_eq!(held.len(), before, "a page is held twice");
    assert_eq!(held.into_iter().collect::<HashSet<_>>(), free);
    (journal, list.head())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_logged_delta_is_idempotent(ops in ops()) {
        let (journal, _) = run_ops(&ops);
        let replayed = pages(SMALL_PAGE);
        let mut iter = journal.wal().iter().expect("iter");
        while let Some(frame) = iter.next_frame().expect("frame") {
            let record = WalRecord::decode(&frame.payload).expect("decode");
            let Some(delta) = record.delta().copied() else { continue };
            let mut page = replayed.page_mut(delta.group_id, delta.page_id).expect("page");
            record.apply_delta(&replayed, page.data_mut()).expect("first apply");
            let once = page.data().to_vec();
            record.apply_delta(&replayed, page.data_mut()).expect("second apply");
            prop_assert_eq!(page.data(), once.as_slice(), "{}", record);
        }
        let live = journal.pages();
        for id in live.dirty_pages(GROUP) {
            prop_assert_eq!(
                replayed.page_snapshot(GROUP, id).expect("replayed"),
                live.page_snapshot(GROUP, id).expect("live")
            );
        }
    }

    #[test]
    fn chains_never_revisit_a_node(ops in ops()) {
        let (journal, head) = run_ops(&ops);
        let nodes = chain_nodes(journal.pages(), GROUP, head).expect("acyclic chain");
        let mut unique = nodes.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), nodes.len());
        prop_assert!(verify_chain(journal.pages(), GROUP, head).is_ok());

        let replayed = pages(SMALL_PAGE);
        Recovery::replay(journal.wal(), &replayed, ReplayPolicy::FailFast).expect("replay");
        prop_assert_eq!(chain_nodes(&replayed, GROUP, head).expect("replayed chain"), nodes);
    }
}
