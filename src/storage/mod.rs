//! Page formats, WAL records, and the replay machinery built on them.
//!
//! Page mutations are expressed as single-page delta records. The
//! [`Journal`] logs each record before applying it to the live page, and
//! [`Recovery`] applies the same records again after a restart.

/// Page-format handlers and their registry.
pub mod page_io;

/// WAL record kinds and their binary encoding.
pub mod record;

mod delta;
mod freelist;
mod journal;
mod recovery;
mod wal_state;

pub use freelist::{chain_nodes, chain_pages, verify_chain, FreeList};
pub use journal::Journal;
pub use page_io::{
    PageHeader, PageIo, PageIoRegistry, PagesListNodeIo, PagesListNodeIoV1, MIN_PAGE_SIZE,
    PAGE_HDR_LEN,
};
pub use record::{PageDelta, RecordType, SnapshotRecord, WalRecord};
pub use recovery::{QuarantinedPage, Recovery, RecoveryReport, ReplayPolicy};
pub use wal_state::{WalStateRegistry, WalStateResult};
