#![allow(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use kindle::primitives::io::{FileIo, MemIo};
use kindle::primitives::pager::PageMemory;
use kindle::primitives::wal::{Wal, WalOptions, WalSyncMode, FRAME_HEADER_LEN};
use kindle::storage::{
    chain_pages, FreeList, Journal, PageDelta, PagesListNodeIoV1, Recovery, ReplayPolicy,
    SnapshotRecord, WalRecord, WalStateRegistry,
};
use kindle::types::{GroupId, KindleError, Lsn, PageId, Result};

const SALT: u64 = 0x5eed;
const PAGE: usize = 128;

fn open(io: &MemIo) -> Result<Wal> {
    Wal::open(
        Arc::new(io.clone()),
        WalOptions::new(SALT, Lsn(1), WalSyncMode::Off),
    )
}

fn fresh_pages(groups: &[GroupId]) -> PageMemory {
    let pages = PageMemory::default();
    for group in groups {
        pages.register_group(*group, PAGE).expect("register group");
    }
    pages
}

fn journal_over(
    io: &MemIo,
    groups: &[GroupId],
    wal_state: WalStateRegistry,
) -> Result<Arc<Journal>> {
    Ok(Arc::new(Journal::new(
        Arc::new(open(io)?),
        Arc::new(fresh_pages(groups)),
        Arc::new(wal_state),
    )))
}

#[test]
fn torn_tail_replays_valid_prefix_and_is_overwritten() -> Result<()> {
    let io = MemIo::new();
    let group = GroupId(1);
    let (head, before_last) = {
        let journal = journal_over(&io, &[group], WalStateRegistry::new())?;
        let list = FreeList::create(Arc::clone(&journal), group)?;
        list.put(PageId(500))?;
        list.put(PageId(501))?;
        let before_last = list.pages()?;
        list.put(PageId(502))?;
        (list.head(), before_last)
    };
    // Cut the last frame (AddPage for 502) in the middle of its payload.
    let torn = io.len()? - 10;
    io.truncate(torn)?;

    let wal = open(&io)?;
    let pages = fresh_pages(&[group]);
    let report = Recovery::replay(&wal, &pages, ReplayPolicy::FailFast)?;
    assert_eq!(report.applied, 3);
    assert_eq!(report.last_lsn, Some(Lsn(3)));
    assert!(report.valid_up_to < torn);
    assert_eq!(chain_pages(&pages, group, head)?, before_last);

    let again = wal.append(&WalRecord::Checkpoint { checkpoint_id: 1 }.encode())?;
    assert_eq!(again.lsn, Lsn(4));
    assert_eq!(again.offset, report.valid_up_to);
    Ok(())
}

#[test]
fn markers_are_reported_not_applied() -> Result<()> {
    let io = MemIo::new();
    let journal = journal_over(&io, &[GroupId(1)], WalStateRegistry::new())?;
    journal.log(&WalRecord::Snapshot(SnapshotRecord {
        snapshot_id: 9,
        full: true,
    }))?;
    FreeList::create(Arc::clone(&journal), GroupId(1))?;
    journal.log(&WalRecord::Checkpoint { checkpoint_id: 3 })?;
    assert!(journal
        .log_and_apply(&WalRecord::Checkpoint { checkpoint_id: 4 })
        .is_err());

    let pages = fresh_pages(&[GroupId(1)]);
    let report = Recovery::replay(journal.wal(), &pages, ReplayPolicy::FailFast)?;
    assert_eq!(report.whole_records, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(
        report.last_snapshot,
        Some(SnapshotRecord {
            snapshot_id: 9,
            full: true
        })
    );
    assert_eq!(report.last_checkpoint, Some(3));
    Ok(())
}

#[test]
fn groups_with_wal_disabled_are_applied_but_not_logged() -> Result<()> {
    let io = MemIo::new();
    let logged = GroupId(1);
    let unlogged = GroupId(2);
    let wal_state = WalStateRegistry::new();
    wal_state.register(logged, true);
    wal_state.register(unlogged, true);
    assert!(wal_state.propose(unlogged, false).changed);
    assert!(wal_state.propose(GroupId(3), false).error.is_some());

    let journal = journal_over(&io, &[logged, unlogged], wal_state)?;
    let a = FreeList::create(Arc::clone(&journal), logged)?;
    let b = FreeList::create(Arc::clone(&journal), unlogged)?;
    a.put(PageId(70))?;
    b.put(PageId(80))?;
    assert_eq!(b.pages()?, vec![PageId(80)]);

    let mut iter = journal.wal().iter()?;
    let mut groups = Vec::new();
    while let Some(frame) = iter.next_frame()? {
        groups.push(WalRecord::decode(&frame.payload)?.group_id());
    }
    assert_eq!(groups, vec![Some(logged), Some(logged)]);
    Ok(())
}

#[test]
fn quarantine_isolates_the_bad_page() -> Result<()> {
    let io = MemIo::new();
    let wal = open(&io)?;
    let delta = |page: u64| PageDelta::new(GroupId(1), PageId(page), &PagesListNodeIoV1);
    let records = [
        WalRecord::PagesListInitNewPage {
            delta: delta(1),
            prev_page_id: PageId::NULL,
            add_data_page_id: PageId(40),
        },
        // Page 2 is never formatted.
        WalRecord::PagesListAddPage {
            delta: delta(2),
            slot: 0,
            data_page_id: PageId(41),
        },
        WalRecord::PagesListAddPage {
            delta: delta(2),
            slot: 1,
            data_page_id: PageId(42),
        },
        WalRecord::PagesListAddPage {
            delta: delta(1),
            slot: 1,
            data_page_id: PageId(43),
        },
    ];
    for record in &records {
        wal.append(&record.encode())?;
    }

    let err = Recovery::replay(&wal, &fresh_pages(&[GroupId(1)]), ReplayPolicy::FailFast)
        .unwrap_err();
    assert!(matches!(err, KindleError::CorruptPageFormat { .. }));

    let pages = fresh_pages(&[GroupId(1)]);
    let report = Recovery::replay(&wal, &pages, ReplayPolicy::Quarantine)?;
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].page, PageId(2));
    assert_eq!(chain_pages(&pages, GroupId(1), PageId(1))?, vec![PageId(40), PageId(43)]);
    Ok(())
}

#[test]
fn corrupted_frame_ends_the_valid_prefix() -> Result<()> {
    let io = MemIo::new();
    let wal = open(&io)?;
    let mut pointers = Vec::new();
    for id in 0..3 {
        pointers.push(wal.append(&WalRecord::Checkpoint { checkpoint_id: id }.encode())?);
    }
    io.corrupt_byte(pointers[1].offset + FRAME_HEADER_LEN as u64);

    let report = Recovery::replay(&wal, &fresh_pages(&[]), ReplayPolicy::FailFast)?;
    assert_eq!(report.whole_records, 1);
    assert_eq!(report.valid_up_to, pointers[1].offset);
    assert_eq!(report.last_checkpoint, Some(0));
    Ok(())
}
