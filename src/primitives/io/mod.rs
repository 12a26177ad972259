#![forbid(unsafe_code)]
//! Positional I/O backends for the WAL file.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, IoSlice},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::types::{KindleError, Result};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`; short files yield `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes multiple buffers back to back starting at `off`.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(KindleError::Invalid("writev offset overflow"))?;
        }
        Ok(())
    }
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// File-backed I/O using positional reads and writes.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    #[cfg(unix)]
    fn read_chunk(&self, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&*self.inner, dst, off)
    }

    #[cfg(unix)]
    fn write_chunk(&self, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&*self.inner, src, off)
    }

    #[cfg(windows)]
    fn read_chunk(&self, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&*self.inner, dst, off)
    }

    #[cfg(windows)]
    fn write_chunk(&self, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(&*self.inner, src, off)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_chunk(&self, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_chunk(&self, _src: &[u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = self.read_chunk(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = self.write_chunk(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(KindleError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(KindleError::from)
    }
}

/// Volatile in-memory I/O; clones share the same bytes.
///
/// Useful for replay tests that need to tear or corrupt a log in place.
#[derive(Clone, Default)]
pub struct MemIo {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Flips every bit of the byte at `off`, if it exists.
    pub fn corrupt_byte(&self, off: u64) {
        if let Some(byte) = self.data.write().get_mut(off as usize) {
            *byte ^= 0xFF;
        }
    }
}

impl FileIo for MemIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"))?;
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = off as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }
}
