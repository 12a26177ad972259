#![forbid(unsafe_code)]
//! Identifier newtypes and the crate-wide error type.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;

pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Identifier of a cache group; every page belongs to exactly one group.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct GroupId(pub i32);

/// Page identifier within a group. `PageId(0)` is the null page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct PageId(pub u64);

/// Log sequence number of a WAL record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct Lsn(pub u64);

impl PageId {
    /// The null page, used as "no page" in page links.
    pub const NULL: PageId = PageId(0);

    /// Returns `true` for the null page.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

/// Location of one logged record inside the WAL file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct WalPointer {
    /// Sequence number assigned to the record.
    pub lsn: Lsn,
    /// Byte offset of the record frame in the WAL file.
    pub offset: u64,
    /// Frame length in bytes, header included.
    pub len: u32,
}

impl fmt::Display for WalPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn={} off={} len={}", self.lsn, self.offset, self.len)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by the storage, MVCC and transaction layers.
pub enum KindleError {
    /// Raw transport or file failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Page-store failure with enough context to locate the page and record.
    #[error("IO failure on group {group} page {page} while handling {record}: {source}")]
    IoFailure {
        /// Group owning the page.
        group: GroupId,
        /// Page being read or written.
        page: PageId,
        /// Record or operation name.
        record: &'static str,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Page type or version cannot be resolved, or disagrees with the record.
    #[error("corrupt page format (type={io_type}, version={io_version}): {reason}")]
    CorruptPageFormat {
        /// Page type found or expected.
        io_type: u16,
        /// Page format version found or expected.
        io_version: u16,
        /// What did not match.
        reason: &'static str,
    },
    /// A structural page invariant does not hold; indicates corruption or a logic bug.
    #[error("structural invariant violated on group {group} page {page}: {reason}")]
    StructuralInvariant {
        /// Group owning the page.
        group: GroupId,
        /// Offending page.
        page: PageId,
        /// Description of the broken invariant.
        reason: String,
    },
    /// The receiver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// A bounded wait exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that was waiting.
        operation: &'static str,
        /// Bound that elapsed.
        after: Duration,
    },
    /// On-disk framing or checksum corruption.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a dynamic description.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The MVCC coordinator rejected or could not receive an acknowledgment.
    #[error("coordinator: {0}")]
    Coordinator(String),
    /// A caller broke a programming contract of this crate.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KindleError>;

impl KindleError {
    /// Wraps an I/O error with page and record context.
    pub fn io_failure(group: GroupId, page: PageId, record: &'static str, source: io::Error) -> Self {
        KindleError::IoFailure {
            group,
            page,
            record,
            source,
        }
    }

    /// Returns `true` for errors a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KindleError::Timeout { .. })
    }
}
