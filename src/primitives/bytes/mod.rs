#![forbid(unsafe_code)]
//! Bounds-checked field access, varints, and a decoding cursor.
//!
//! Page bytes and WAL payloads come from disk, so every accessor here
//! returns an error instead of panicking on short input.

use crate::types::{KindleError, Result};

pub mod field {
    //! Big-endian fixed-offset accessors for page buffers.

    use super::{KindleError, Result};

    fn window(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
        off.checked_add(len)
            .and_then(|end| buf.get(off..end))
            .ok_or(KindleError::Corruption("page field out of bounds"))
    }

    fn window_mut(buf: &mut [u8], off: usize, len: usize) -> Result<&mut [u8]> {
        match off.checked_add(len) {
            Some(end) if end <= buf.len() => Ok(&mut buf[off..end]),
            _ => Err(KindleError::Invalid("page field out of bounds")),
        }
    }

    /// Reads a big-endian `u16` at `off`.
    pub fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(window(buf, off, 2)?);
        Ok(u16::from_be_bytes(raw))
    }

    /// Reads a big-endian `u32` at `off`.
    pub fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(window(buf, off, 4)?);
        Ok(u32::from_be_bytes(raw))
    }

    /// Reads a big-endian `u64` at `off`.
    pub fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(window(buf, off, 8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Writes a big-endian `u16` at `off`.
    pub fn write_u16(buf: &mut [u8], off: usize, v: u16) -> Result<()> {
        window_mut(buf, off, 2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Writes a big-endian `u32` at `off`.
    pub fn write_u32(buf: &mut [u8], off: usize, v: u32) -> Result<()> {
        window_mut(buf, off, 4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Writes a big-endian `u64` at `off`.
    pub fn write_u64(buf: &mut [u8], off: usize, v: u64) -> Result<()> {
        window_mut(buf, off, 8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }
}

pub mod var {
    //! Unsigned LEB128 varints.

    use super::{KindleError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, advancing `off` past it.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(KindleError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(KindleError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(KindleError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed cursor for decoding records.

    use core::fmt;

    use super::{var, KindleError, Result};

    /// Reads big-endian values from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(KindleError::Corruption("record truncated"))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian `u16`.
        pub fn u16(&mut self) -> Result<u16> {
            let mut raw = [0u8; 2];
            raw.copy_from_slice(self.take(2)?);
            Ok(u16::from_be_bytes(raw))
        }

        /// Reads a big-endian `i32`.
        pub fn i32(&mut self) -> Result<i32> {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(self.take(4)?);
            Ok(i32::from_be_bytes(raw))
        }

        /// Reads a big-endian `u64`.
        pub fn u64(&mut self) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(raw))
        }

        /// Reads an unsigned varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(KindleError::Corruption("trailing bytes after record"));
            }
            Ok(())
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
