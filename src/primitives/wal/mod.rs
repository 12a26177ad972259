#![forbid(unsafe_code)]
//! Append-only, checksummed record log.
//!
//! Layout: a 32-byte file header followed by frames. Each frame is a 32-byte
//! header and a variable-length payload holding one encoded record. Frames are
//! chained: every header carries the running chain value of all preceding
//! frames, so a torn or stale tail is detected even when its own CRCs happen
//! to validate.

use std::fmt;
use std::io::{ErrorKind, IoSlice};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::primitives::bytes::field;
use crate::primitives::io::FileIo;
use crate::types::checksum::{chain_crc, crc32_of};
use crate::types::{KindleError, Lsn, Result, WalPointer};

const WAL_MAGIC: [u8; 4] = *b"KNDW";
const WAL_FORMAT_VERSION: u16 = 1;
/// Size of the file header in bytes.
pub const FILE_HEADER_LEN: usize = 32;
/// Size of each frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 32;
/// Largest payload a single frame may carry.
pub const MAX_RECORD_LEN: usize = 1 << 20;
const WAL_MAX_IO_SLICES: usize = 512;

/// Synchronization mode for appends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalSyncMode {
    /// fsync after every append.
    #[default]
    Immediate,
    /// fsync only when [`Wal::sync`] is called.
    Deferred,
    /// Never fsync (tests and throwaway logs).
    Off,
}

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug, Default)]
pub struct WalOptions {
    /// Salt distinguishing logs of different stores.
    pub salt: u64,
    /// LSN assigned to the first record of a fresh log.
    pub start_lsn: Lsn,
    /// When appends reach stable storage.
    pub sync_mode: WalSyncMode,
}

impl WalOptions {
    /// Creates options with the given salt and starting LSN.
    pub fn new(salt: u64, start_lsn: Lsn, sync_mode: WalSyncMode) -> Self {
        Self {
            salt,
            start_lsn,
            sync_mode,
        }
    }
}

/// Counters describing WAL activity since open.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: u64,
    /// Bytes appended, frame headers included.
    pub bytes_appended: u64,
    /// fsync calls issued.
    pub syncs: u64,
    /// Vectored writes issued.
    pub coalesced_writes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> Result<[u8; FILE_HEADER_LEN]> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        field::write_u16(&mut buf, 4, WAL_FORMAT_VERSION)?;
        field::write_u64(&mut buf, 12, self.salt)?;
        field::write_u64(&mut buf, 20, self.start_lsn.0)?;
        let crc = crc32_of(&[&buf[..28]]);
        field::write_u32(&mut buf, 28, crc)?;
        Ok(buf)
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(KindleError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(KindleError::Corruption("wal magic mismatch"));
        }
        if field::read_u16(src, 4)? != WAL_FORMAT_VERSION {
            return Err(KindleError::Corruption("wal format version mismatch"));
        }
        if src[6..12].iter().any(|b| *b != 0) {
            return Err(KindleError::Corruption("wal reserved header bytes non-zero"));
        }
        if crc32_of(&[&src[..28]]) != field::read_u32(src, 28)? {
            return Err(KindleError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            salt: field::read_u64(src, 12)?,
            start_lsn: Lsn(field::read_u64(src, 20)?),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> Result<[u8; FRAME_HEADER_LEN]> {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        field::write_u64(&mut buf, 0, self.lsn.0)?;
        field::write_u32(&mut buf, 8, self.payload_len)?;
        field::write_u64(&mut buf, 16, self.prev_chain)?;
        field::write_u32(&mut buf, 24, self.payload_crc32)?;
        let crc = crc32_of(&[&buf[..28]]);
        field::write_u32(&mut buf, 28, crc)?;
        Ok(buf)
    }

    /// Returns `None` when the header does not validate.
    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Result<Option<Self>> {
        if crc32_of(&[&src[..28]]) != field::read_u32(src, 28)? {
            return Ok(None);
        }
        if field::read_u32(src, 12)? != 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            lsn: Lsn(field::read_u64(src, 0)?),
            payload_len: field::read_u32(src, 8)?,
            prev_chain: field::read_u64(src, 16)?,
            payload_crc32: field::read_u32(src, 24)?,
        }))
    }
}

struct WalState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u64,
    next_lsn: Lsn,
    stats: WalStats,
}

/// Durable append-only log of encoded records.
pub struct Wal {
    io: Arc<dyn FileIo>,
    sync_mode: WalSyncMode,
    state: Mutex<WalState>,
}

impl fmt::Debug for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Wal")
            .field("sync_mode", &self.sync_mode)
            .field("append_offset", &state.append_offset)
            .field("next_lsn", &state.next_lsn)
            .finish()
    }
}

impl Wal {
    /// Opens or creates a log.
    ///
    /// An existing log must carry the same salt. Appends continue after the
    /// last valid frame; a torn tail is overwritten by the next append.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: options.salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode()?)?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.salt != options.salt {
                return Err(KindleError::Corruption("wal salt mismatch"));
            }
            header
        };
        let mut iter = WalIterator::new(Arc::clone(&io), header.clone())?;
        while iter.next_frame()?.is_some() {}
        let tail = iter.tail();
        if tail.valid_up_to < len {
            warn!(
                valid_up_to = tail.valid_up_to,
                file_len = len,
                "wal.open.torn_tail"
            );
        }
        debug!(
            salt = header.salt,
            next_lsn = tail.next_lsn.0,
            append_offset = tail.valid_up_to,
            "wal.open"
        );
        Ok(Self {
            io,
            sync_mode: options.sync_mode,
            state: Mutex::new(WalState {
                header,
                append_offset: tail.valid_up_to,
                prev_chain: tail.prev_chain,
                next_lsn: tail.next_lsn,
                stats: WalStats::default(),
            }),
        })
    }

    /// Iterates an existing log without writing to it, adopting its salt.
    pub fn read_existing(io: Arc<dyn FileIo>) -> Result<WalIterator> {
        if io.len()? < FILE_HEADER_LEN as u64 {
            return Err(KindleError::Corruption("wal header truncated"));
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = FileHeader::decode(&buf)?;
        WalIterator::new(io, header)
    }

    /// Appends one record payload and returns where it landed.
    pub fn append(&self, payload: &[u8]) -> Result<WalPointer> {
        let mut pointers = self.append_batch(&[payload])?;
        pointers
            .pop()
            .ok_or(KindleError::Invalid("wal append produced no frame"))
    }

    /// Appends several records with coalesced writes. Records receive
    /// consecutive LSNs in slice order.
    pub fn append_batch(&self, payloads: &[&[u8]]) -> Result<Vec<WalPointer>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        if payloads.iter().any(|p| p.is_empty() || p.len() > MAX_RECORD_LEN) {
            return Err(KindleError::Invalid("wal record payload size out of range"));
        }
        let mut state = self.state.lock();
        let mut pointers = Vec::with_capacity(payloads.len());
        for chunk in payloads.chunks(WAL_MAX_IO_SLICES / 2) {
            let mut headers: Vec<[u8; FRAME_HEADER_LEN]> = Vec::with_capacity(chunk.len());
            let mut offset = state.append_offset;
            for payload in chunk {
                let header = FrameHeader {
                    lsn: state.next_lsn,
                    payload_len: payload.len() as u32,
                    prev_chain: state.prev_chain,
                    payload_crc32: crc32_of(&[*payload]),
                }
                .encode()?;
                state.prev_chain = chain_crc(state.prev_chain, &header, payload);
                let len = (FRAME_HEADER_LEN + payload.len()) as u32;
                pointers.push(WalPointer {
                    lsn: state.next_lsn,
                    offset,
                    len,
                });
                offset += u64::from(len);
                state.next_lsn = Lsn(state.next_lsn.0 + 1);
                headers.push(header);
            }
            let slices: Vec<IoSlice<'_>> = headers
                .iter()
                .zip(chunk.iter())
                .flat_map(|(header, payload)| [IoSlice::new(header), IoSlice::new(payload)])
                .collect();
            self.io.writev_at(state.append_offset, &slices)?;
            let written = offset - state.append_offset;
            state.append_offset = offset;
            state.stats.records_appended += chunk.len() as u64;
            state.stats.bytes_appended += written;
            state.stats.coalesced_writes += 1;
        }
        if self.sync_mode == WalSyncMode::Immediate {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        debug!(
            records = pointers.len(),
            first_lsn = pointers.first().map(|p| p.lsn.0),
            append_offset = state.append_offset,
            "wal.append"
        );
        Ok(pointers)
    }

    /// Forces appended records to stable storage unless syncing is off.
    pub fn sync(&self) -> Result<()> {
        if self.sync_mode == WalSyncMode::Off {
            return Ok(());
        }
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Drops every byte from `offset` on, typically a torn tail reported by
    /// [`WalIterator::valid_up_to`]. `offset` must be a frame boundary.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        if offset < FILE_HEADER_LEN as u64 {
            return Err(KindleError::Invalid("wal truncate below file header"));
        }
        let mut state = self.state.lock();
        let mut iter = WalIterator::new(Arc::clone(&self.io), state.header.clone())?;
        let tail = loop {
            if iter.valid_up_to() == offset {
                break iter.tail();
            }
            if iter.next_frame()?.is_none() {
                return Err(KindleError::Invalid("wal truncate offset is not a frame boundary"));
            }
        };
        self.io.truncate(offset)?;
        state.append_offset = tail.valid_up_to;
        state.prev_chain = tail.prev_chain;
        state.next_lsn = tail.next_lsn;
        if self.sync_mode != WalSyncMode::Off {
            self.io.sync_all()?;
        }
        debug!(offset, next_lsn = tail.next_lsn.0, "wal.truncate");
        Ok(())
    }

    /// Creates an iterator over the valid frames of the log.
    pub fn iter(&self) -> Result<WalIterator> {
        let header = self.state.lock().header.clone();
        WalIterator::new(Arc::clone(&self.io), header)
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Returns current statistics for this log.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the log file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the log holds no frames.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// One frame read back from the log.
pub struct WalFrame {
    /// Where the frame sits in the file.
    pub pointer: WalPointer,
    /// Encoded record bytes.
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalFrame")
            .field("pointer", &self.pointer)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

struct Tail {
    valid_up_to: u64,
    prev_chain: u64,
    next_lsn: Lsn,
}

/// Sequential reader over the frames of a log.
///
/// Iteration stops at the first frame that is truncated, fails a checksum,
/// breaks the chain, or skips an LSN. Everything before that point is
/// reported by [`WalIterator::valid_up_to`].
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    next_lsn: Lsn,
    header: FileHeader,
}

impl WalIterator {
    fn new(io: Arc<dyn FileIo>, header: FileHeader) -> Result<Self> {
        let end = io.len()?;
        if end < FILE_HEADER_LEN as u64 {
            return Err(KindleError::Corruption("wal truncated header"));
        }
        Ok(Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            next_lsn: header.start_lsn,
            header,
        })
    }

    fn stop(&mut self) -> Result<Option<WalFrame>> {
        self.offset = self.end;
        Ok(None)
    }

    /// Reads the next valid frame, or `None` at the end of the valid prefix.
    pub fn next_frame(&mut self) -> Result<Option<WalFrame>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return self.stop();
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        match self.io.read_at(self.offset, &mut header_buf) {
            Ok(()) => {}
            Err(KindleError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return self.stop()
            }
            Err(err) => return Err(err),
        }
        let Some(header) = FrameHeader::decode(&header_buf)? else {
            return self.stop();
        };
        if header.lsn.0 < self.header.start_lsn.0 {
            return Err(KindleError::Corruption("wal frame lsn below start_lsn"));
        }
        let payload_len = header.payload_len as usize;
        if header.prev_chain != self.prev_chain
            || header.lsn != self.next_lsn
            || payload_len == 0
            || payload_len > MAX_RECORD_LEN
        {
            return self.stop();
        }
        let mut payload = vec![0u8; payload_len];
        match self
            .io
            .read_at(self.offset + FRAME_HEADER_LEN as u64, &mut payload)
        {
            Ok(()) => {}
            Err(KindleError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return self.stop()
            }
            Err(err) => return Err(err),
        }
        if crc32_of(&[payload.as_slice()]) != header.payload_crc32 {
            return self.stop();
        }
        let frame_len = (FRAME_HEADER_LEN + payload_len) as u32;
        let pointer = WalPointer {
            lsn: header.lsn,
            offset: self.offset,
            len: frame_len,
        };
        self.prev_chain = chain_crc(self.prev_chain, &header_buf, &payload);
        self.next_lsn = Lsn(header.lsn.0 + 1);
        self.offset += u64::from(frame_len);
        self.valid_up_to = self.offset;
        Ok(Some(WalFrame { pointer, payload }))
    }

    /// Returns the file offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    /// Salt recorded in the file header.
    pub fn salt(&self) -> u64 {
        self.header.salt
    }

    fn tail(&self) -> Tail {
        Tail {
            valid_up_to: self.valid_up_to,
            prev_chain: self.prev_chain,
            next_lsn: self.next_lsn,
        }
    }
}
