#![forbid(unsafe_code)]
//! Page-format handlers.
//!
//! Every formatted page starts with a 16-byte common header naming its type
//! and format version, so the bytes of a page are enough to find the handler
//! that can interpret them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::primitives::bytes::field;
use crate::types::{KindleError, PageId, Result};

mod pages_list;

pub use pages_list::{PagesListNodeIo, PagesListNodeIoV1, NODE_HEADER_LEN};

/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 16;
/// Smallest page size any group may use.
pub const MIN_PAGE_SIZE: usize = 64;

const IO_TYPE_OFFSET: usize = 0;
const IO_VERSION_OFFSET: usize = 2;
const RESERVED_OFFSET: usize = 4;
const PAGE_ID_OFFSET: usize = 8;

/// Page type codes stored at offset 0 of every formatted page.
pub mod io_type {
    /// Never formatted (all zero).
    pub const UNFORMATTED: u16 = 0;
    /// Free-list node page.
    pub const PAGES_LIST_NODE: u16 = 12;
}

/// Decoded common page header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Page type code.
    pub io_type: u16,
    /// Format version of that type.
    pub io_version: u16,
    /// Identifier the page was initialized with.
    pub page_id: PageId,
}

impl PageHeader {
    /// Reads the header of `page`.
    pub fn parse(page: &[u8]) -> Result<Self> {
        if page.len() < PAGE_HDR_LEN {
            return Err(KindleError::Corruption("page shorter than common header"));
        }
        Ok(Self {
            io_type: field::read_u16(page, IO_TYPE_OFFSET)?,
            io_version: field::read_u16(page, IO_VERSION_OFFSET)?,
            page_id: PageId(field::read_u64(page, PAGE_ID_OFFSET)?),
        })
    }

    /// Writes the header into `page`.
    pub fn write(&self, page: &mut [u8]) -> Result<()> {
        field::write_u16(page, IO_TYPE_OFFSET, self.io_type)?;
        field::write_u16(page, IO_VERSION_OFFSET, self.io_version)?;
        field::write_u32(page, RESERVED_OFFSET, 0)?;
        field::write_u64(page, PAGE_ID_OFFSET, self.page_id.0)
    }
}

impl fmt::Display for PageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} version={} page={}",
            self.io_type, self.io_version, self.page_id
        )
    }
}

/// Behavior shared by every page-format handler.
pub trait PageIo: Send + Sync {
    /// Page type code this handler formats.
    fn io_type(&self) -> u16;

    /// Format version this handler formats.
    fn version(&self) -> u16;

    /// Formats `page` as a fresh, empty page of this type.
    ///
    /// The first `page_size` bytes are reset, then the common header is written.
    fn init_new_page(&self, page: &mut [u8], page_id: PageId, page_size: usize) -> Result<()> {
        if page_size < MIN_PAGE_SIZE || page.len() < page_size {
            return Err(KindleError::Invalid("page buffer smaller than page size"));
        }
        page[..page_size].fill(0);
        PageHeader {
            io_type: self.io_type(),
            io_version: self.version(),
            page_id,
        }
        .write(page)
    }
}

fn unknown_version(io_type: u16, io_version: u16) -> KindleError {
    KindleError::CorruptPageFormat {
        io_type,
        io_version,
        reason: "no handler registered for page version",
    }
}

/// Resolves `(io_type, io_version)` pairs to page-format handlers.
///
/// Resolution never falls back to a "compatible" version; anything not
/// registered is [`KindleError::CorruptPageFormat`].
#[derive(Clone)]
pub struct PageIoRegistry {
    pages_list: BTreeMap<u16, Arc<dyn PagesListNodeIo>>,
}

impl Default for PageIoRegistry {
    fn default() -> Self {
        let mut pages_list: BTreeMap<u16, Arc<dyn PagesListNodeIo>> = BTreeMap::new();
        let v1 = PagesListNodeIoV1;
        pages_list.insert(v1.version(), Arc::new(v1));
        Self { pages_list }
    }
}

impl fmt::Debug for PageIoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageIoRegistry")
            .field("pages_list_versions", &self.pages_list.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PageIoRegistry {
    /// Registers an additional free-list node format version.
    pub fn register_pages_list(&mut self, handler: Arc<dyn PagesListNodeIo>) -> Result<()> {
        if handler.io_type() != io_type::PAGES_LIST_NODE {
            return Err(KindleError::Invalid("handler is not a free-list node format"));
        }
        if self.pages_list.contains_key(&handler.version()) {
            return Err(KindleError::Invalid("free-list node version already registered"));
        }
        self.pages_list.insert(handler.version(), handler);
        Ok(())
    }

    /// Handler for free-list node pages of exactly `(io_type, io_version)`.
    pub fn pages_list(&self, io_type: u16, io_version: u16) -> Result<&dyn PagesListNodeIo> {
        if io_type != io_type::PAGES_LIST_NODE {
            return Err(KindleError::CorruptPageFormat {
                io_type,
                io_version,
                reason: "page is not a free-list node",
            });
        }
        self.pages_list
            .get(&io_version)
            .map(|handler| handler.as_ref())
            .ok_or_else(|| unknown_version(io_type, io_version))
    }

    /// Handler named by the page's own header.
    pub fn pages_list_for_page(&self, page: &[u8]) -> Result<&dyn PagesListNodeIo> {
        let header = PageHeader::parse(page)?;
        if header.io_type == io_type::UNFORMATTED {
            return Err(KindleError::CorruptPageFormat {
                io_type: header.io_type,
                io_version: header.io_version,
                reason: "page was never initialized",
            });
        }
        self.pages_list(header.io_type, header.io_version)
    }

    /// Newest registered free-list node format; used when formatting new pages.
    pub fn latest_pages_list(&self) -> Result<&dyn PagesListNodeIo> {
        self.pages_list
            .values()
            .next_back()
            .map(|handler| handler.as_ref())
            .ok_or_else(|| unknown_version(io_type::PAGES_LIST_NODE, 0))
    }

    /// Format version recorded in the page's header.
    pub fn current_page_io_version(page: &[u8]) -> Result<u16> {
        Ok(PageHeader::parse(page)?.io_version)
    }
}
