#![forbid(unsafe_code)]

use std::fmt;

use bytes::BufMut;
use serde::Serialize;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::storage::page_io::PageIo;
use crate::types::{GroupId, KindleError, PageId, Result};

/// Closed set of WAL record kinds. The discriminant is the on-disk type code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum RecordType {
    /// Snapshot marker.
    Snapshot = 1,
    /// Checkpoint marker.
    Checkpoint = 2,
    /// Format a page as a fresh free-list node.
    PagesListInitNewPage = 20,
    /// Set a free-list node's next pointer.
    PagesListSetNext = 21,
    /// Set a free-list node's previous pointer.
    PagesListSetPrevious = 22,
    /// Write one data-page slot of a free-list node.
    PagesListAddPage = 23,
    /// Drop a data page from a free-list node.
    PagesListRemovePage = 24,
}

impl RecordType {
    /// Stable type code written ahead of every record.
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Maps a type code back to its kind.
    pub fn from_code(code: u64) -> Result<Self> {
        Ok(match code {
            1 => Self::Snapshot,
            2 => Self::Checkpoint,
            20 => Self::PagesListInitNewPage,
            21 => Self::PagesListSetNext,
            22 => Self::PagesListSetPrevious,
            23 => Self::PagesListAddPage,
            24 => Self::PagesListRemovePage,
            _ => return Err(KindleError::Corruption("unknown wal record type")),
        })
    }

    /// Returns `true` for records that mutate exactly one page.
    pub const fn is_page_delta(self) -> bool {
        !matches!(self, Self::Snapshot | Self::Checkpoint)
    }

    /// Name used in logs and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Snapshot => "Snapshot",
            Self::Checkpoint => "Checkpoint",
            Self::PagesListInitNewPage => "PagesListInitNewPage",
            Self::PagesListSetNext => "PagesListSetNext",
            Self::PagesListSetPrevious => "PagesListSetPrevious",
            Self::PagesListAddPage => "PagesListAddPage",
            Self::PagesListRemovePage => "PagesListRemovePage",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity shared by every page delta: which page, and which page format
/// the record was produced against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct PageDelta {
    /// Group owning the page.
    pub group_id: GroupId,
    /// Target page.
    pub page_id: PageId,
    /// Page type the record expects.
    pub io_type: u16,
    /// Page format version the record expects.
    pub io_version: u16,
}

impl PageDelta {
    /// Delta identity for a page formatted by `io`.
    pub fn new<I: PageIo + ?Sized>(group_id: GroupId, page_id: PageId, io: &I) -> Self {
        Self {
            group_id,
            page_id,
            io_type: io.io_type(),
            io_version: io.version(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_i32(self.group_id.0);
        out.put_u64(self.page_id.0);
        out.put_i32(i32::from(self.io_type));
        out.put_i32(i32::from(self.io_version));
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let group_id = GroupId(cur.i32()?);
        let page_id = PageId(cur.u64()?);
        let io_type = u16::try_from(cur.i32()?)
            .map_err(|_| KindleError::Corruption("record io type out of range"))?;
        let io_version = u16::try_from(cur.i32()?)
            .map_err(|_| KindleError::Corruption("record io version out of range"))?;
        Ok(Self {
            group_id,
            page_id,
            io_type,
            io_version,
        })
    }
}

/// Snapshot marker; informational, never applied to a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SnapshotRecord {
    /// Snapshot identifier.
    pub snapshot_id: u64,
    /// Full snapshot rather than incremental.
    pub full: bool,
}

/// One WAL record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum WalRecord {
    /// Snapshot marker.
    Snapshot(SnapshotRecord),
    /// A consistent state was reached.
    Checkpoint {
        /// Checkpoint identifier.
        checkpoint_id: u64,
    },
    /// Format `delta.page_id` as an empty free-list node linked after
    /// `prev_page_id`, optionally holding `add_data_page_id` in slot 0.
    PagesListInitNewPage {
        /// Target page.
        delta: PageDelta,
        /// Previous node, or null for a head node.
        prev_page_id: PageId,
        /// Data page to store in the new node, or null for none.
        add_data_page_id: PageId,
    },
    /// Set the next pointer of a node.
    PagesListSetNext {
        /// Target page.
        delta: PageDelta,
        /// New next pointer.
        next_page_id: PageId,
    },
    /// Set the previous pointer of a node.
    PagesListSetPrevious {
        /// Target page.
        delta: PageDelta,
        /// New previous pointer.
        prev_page_id: PageId,
    },
    /// Write `data_page_id` into slot `slot`.
    PagesListAddPage {
        /// Target page.
        delta: PageDelta,
        /// Slot index; equals the pre-append count when the record was logged.
        slot: u16,
        /// Data page stored in the slot.
        data_page_id: PageId,
    },
    /// Clear the last slot `slot` of a node if it still holds `data_page_id`.
    PagesListRemovePage {
        /// Target page.
        delta: PageDelta,
        /// Slot index; the last occupied slot when the record was logged.
        slot: u16,
        /// Data page expected in the slot.
        data_page_id: PageId,
    },
}

impl WalRecord {
    /// Kind of this record.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Snapshot(_) => RecordType::Snapshot,
            Self::Checkpoint { .. } => RecordType::Checkpoint,
            Self::PagesListInitNewPage { .. } => RecordType::PagesListInitNewPage,
            Self::PagesListSetNext { .. } => RecordType::PagesListSetNext,
            Self::PagesListSetPrevious { .. } => RecordType::PagesListSetPrevious,
            Self::PagesListAddPage { .. } => RecordType::PagesListAddPage,
            Self::PagesListRemovePage { .. } => RecordType::PagesListRemovePage,
        }
    }

    /// Page identity for delta records; `None` for whole records.
    pub fn delta(&self) -> Option<&PageDelta> {
        match self {
            Self::Snapshot(_) | Self::Checkpoint { .. } => None,
            Self::PagesListInitNewPage { delta, .. }
            | Self::PagesListSetNext { delta, .. }
            | Self::PagesListSetPrevious { delta, .. }
            | Self::PagesListAddPage { delta, .. }
            | Self::PagesListRemovePage { delta, .. } => Some(delta),
        }
    }

    /// Group of the target page, for delta records.
    pub fn group_id(&self) -> Option<GroupId> {
        self.delta().map(|d| d.group_id)
    }

    /// Target page, for delta records.
    pub fn page_id(&self) -> Option<PageId> {
        self.delta().map(|d| d.page_id)
    }

    /// Encodes the record: varint type code, then big-endian fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        var::encode_u64(self.record_type().code(), &mut out);
        match self {
            Self::Snapshot(snap) => {
                out.put_u64(snap.snapshot_id);
                out.put_u8(u8::from(snap.full));
            }
            Self::Checkpoint { checkpoint_id } => out.put_u64(*checkpoint_id),
            Self::PagesListInitNewPage {
                delta,
                prev_page_id,
                add_data_page_id,
            } => {
                delta.encode(&mut out);
                out.put_u64(prev_page_id.0);
                out.put_u64(add_data_page_id.0);
            }
            Self::PagesListSetNext {
                delta,
                next_page_id,
            } => {
                delta.encode(&mut out);
                out.put_u64(next_page_id.0);
            }
            Self::PagesListSetPrevious {
                delta,
                prev_page_id,
            } => {
                delta.encode(&mut out);
                out.put_u64(prev_page_id.0);
            }
            Self::PagesListAddPage {
                delta,
                slot,
                data_page_id,
            } => {
                delta.encode(&mut out);
                out.put_u16(*slot);
                out.put_u64(data_page_id.0);
            }
            Self::PagesListRemovePage {
                delta,
                slot,
                data_page_id,
            } => {
                delta.encode(&mut out);
                out.put_u16(*slot);
                out.put_u64(data_page_id.0);
            }
        }
        out
    }

    /// Decodes one record; the whole slice must be consumed.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(src);
        let record = match RecordType::from_code(cur.varint()?)? {
            RecordType::Snapshot => {
                let snapshot_id = cur.u64()?;
                let full = match cur.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(KindleError::Corruption("snapshot full flag not boolean")),
                };
                Self::Snapshot(SnapshotRecord { snapshot_id, full })
            }
            RecordType::Checkpoint => Self::Checkpoint {
                checkpoint_id: cur.u64()?,
            },
            RecordType::PagesListInitNewPage => Self::PagesListInitNewPage {
                delta: PageDelta::decode(&mut cur)?,
                prev_page_id: PageId(cur.u64()?),
                add_data_page_id: PageId(cur.u64()?),
            },
            RecordType::PagesListSetNext => Self::PagesListSetNext {
                delta: PageDelta::decode(&mut cur)?,
                next_page_id: PageId(cur.u64()?),
            },
            RecordType::PagesListSetPrevious => Self::PagesListSetPrevious {
                delta: PageDelta::decode(&mut cur)?,
                prev_page_id: PageId(cur.u64()?),
            },
            RecordType::PagesListAddPage => Self::PagesListAddPage {
                delta: PageDelta::decode(&mut cur)?,
                slot: cur.u16()?,
                data_page_id: PageId(cur.u64()?),
            },
            RecordType::PagesListRemovePage => Self::PagesListRemovePage {
                delta: PageDelta::decode(&mut cur)?,
                slot: cur.u16()?,
                data_page_id: PageId(cur.u64()?),
            },
        };
        cur.finish()?;
        Ok(record)
    }
}

impl fmt::Display for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.record_type())?;
        if let Some(d) = self.delta() {
            write!(
                f,
                "grp={}, page={}, ioType={}, ioVer={}, ",
                d.group_id, d.page_id, d.io_type, d.io_version
            )?;
        }
        match self {
            Self::Snapshot(snap) => write!(f, "snapshotId={}, full={}", snap.snapshot_id, snap.full)?,
            Self::Checkpoint { checkpoint_id } => write!(f, "checkpointId={checkpoint_id}")?,
            Self::PagesListInitNewPage {
                prev_page_id,
                add_data_page_id,
                ..
            } => write!(f, "prevPageId={prev_page_id}, addDataPageId={add_data_page_id}")?,
            Self::PagesListSetNext { next_page_id, .. } => write!(f, "nextPageId={next_page_id}")?,
            Self::PagesListSetPrevious { prev_page_id, .. } => {
                write!(f, "prevPageId={prev_page_id}")?
            }
            Self::PagesListAddPage {
                slot, data_page_id, ..
            }
            | Self::PagesListRemovePage {
                slot, data_page_id, ..
            } => write!(f, "slot={slot}, dataPageId={data_page_id}")?,
        }
        f.write_str("]")
    }
}
