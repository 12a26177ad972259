//! Direct (field-by-field) message codec with resumable reads and writes.
//!
//! A message is a header (`i16` type tag, `u8` field count) followed by its
//! fields in a fixed order. Both sides keep a field cursor, so a message can
//! be spread over any number of transport chunks: a call that runs out of
//! room or input returns "not done" and the next call picks up exactly where
//! the previous one stopped.

use bytes::{Buf, BufMut};
use smallvec::SmallVec;

use super::version::MvccVersion;
use crate::types::{KindleError, Result};

const HEADER_LEN: usize = 3;

/// A message with a stable type tag and a fixed field list.
pub trait DirectMessage {
    /// Type tag written in the header.
    const DIRECT_TYPE: i16;
    /// Number of fields following the header.
    const FIELDS_COUNT: u8;

    /// Writes as much of the message as fits. Returns `true` once complete.
    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut DirectWriter) -> bool;

    /// Reads as much of the message as is available. Returns `Ok(true)` once complete.
    fn read_from<B: Buf>(&mut self, buf: &mut B, reader: &mut DirectReader) -> Result<bool>;
}

/// Write-side cursor: header flag, field index, and progress within the current field.
#[derive(Debug, Default)]
pub struct DirectWriter {
    header_written: bool,
    state: u8,
    field_off: usize,
}

impl DirectWriter {
    /// Fresh cursor positioned before the header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next field to write.
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Moves on to the next field.
    pub fn inc_state(&mut self) {
        self.state += 1;
    }

    /// Writes the header once; later calls return `true` immediately.
    pub fn write_header<B: BufMut>(&mut self, buf: &mut B, direct_type: i16, fields: u8) -> bool {
        if self.header_written {
            return true;
        }
        let mut raw = [0u8; HEADER_LEN];
        raw[..2].copy_from_slice(&direct_type.to_be_bytes());
        raw[2] = fields;
        if self.write_raw(buf, &raw) {
            self.header_written = true;
        }
        self.header_written
    }

    /// Writes a big-endian `u64` field.
    pub fn write_u64<B: BufMut>(&mut self, buf: &mut B, value: u64) -> bool {
        self.write_raw(buf, &value.to_be_bytes())
    }

    /// Writes a big-endian `i32` field.
    pub fn write_i32<B: BufMut>(&mut self, buf: &mut B, value: i32) -> bool {
        self.write_raw(buf, &value.to_be_bytes())
    }

    fn write_raw<B: BufMut>(&mut self, buf: &mut B, raw: &[u8]) -> bool {
        let rest = &raw[self.field_off..];
        let n = rest.len().min(buf.remaining_mut());
        buf.put_slice(&rest[..n]);
        self.field_off += n;
        if self.field_off == raw.len() {
            self.field_off = 0;
            true
        } else {
            false
        }
    }
}

/// Read-side cursor; bytes of a partially received field are kept until it completes.
#[derive(Debug, Default)]
pub struct DirectReader {
    header: Option<(i16, u8)>,
    state: u8,
    partial: SmallVec<[u8; 8]>,
    last_read: bool,
}

impl DirectReader {
    /// Fresh cursor positioned before the header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next field to read.
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Moves on to the next field.
    pub fn inc_state(&mut self) {
        self.state += 1;
    }

    /// Whether the last read call completed its field.
    pub fn is_last_read(&self) -> bool {
        self.last_read
    }

    /// Reads the header `(type, field count)` once.
    pub fn read_header<B: Buf>(&mut self, buf: &mut B) -> Option<(i16, u8)> {
        if let Some(header) = self.header {
            self.last_read = true;
            return Some(header);
        }
        let raw = self.read_raw::<B, HEADER_LEN>(buf)?;
        let header = (i16::from_be_bytes([raw[0], raw[1]]), raw[2]);
        self.header = Some(header);
        Some(header)
    }

    /// Reads a big-endian `u64` field.
    pub fn read_u64<B: Buf>(&mut self, buf: &mut B) -> Option<u64> {
        self.read_raw::<B, 8>(buf).map(u64::from_be_bytes)
    }

    /// Reads a big-endian `i32` field.
    pub fn read_i32<B: Buf>(&mut self, buf: &mut B) -> Option<i32> {
        self.read_raw::<B, 4>(buf).map(i32::from_be_bytes)
    }

    fn read_raw<B: Buf, const N: usize>(&mut self, buf: &mut B) -> Option<[u8; N]> {
        while self.partial.len() < N && buf.has_remaining() {
            self.partial.push(buf.get_u8());
        }
        if self.partial.len() < N {
            self.last_read = false;
            return None;
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.partial[..N]);
        self.partial.clear();
        self.last_read = true;
        Some(out)
    }
}

/// Fields go on the wire as counter, coordinator version, operation counter.
/// Peers depend on this order; it differs from declaration order.
impl DirectMessage for MvccVersion {
    const DIRECT_TYPE: i16 = 148;
    const FIELDS_COUNT: u8 = 3;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut DirectWriter) -> bool {
        if !writer.write_header(buf, Self::DIRECT_TYPE, Self::FIELDS_COUNT) {
            return false;
        }
        loop {
            let done = match writer.state() {
                0 => writer.write_u64(buf, self.counter),
                1 => writer.write_u64(buf, self.coordinator_version),
                2 => writer.write_i32(buf, self.op_counter as i32),
                _ => return true,
            };
            if !done {
                return false;
            }
            writer.inc_state();
        }
    }

    fn read_from<B: Buf>(&mut self, buf: &mut B, reader: &mut DirectReader) -> Result<bool> {
        let Some((direct_type, fields)) = reader.read_header(buf) else {
            return Ok(false);
        };
        if direct_type != Self::DIRECT_TYPE {
            return Err(KindleError::Corruption("unexpected direct message type"));
        }
        if fields != Self::FIELDS_COUNT {
            return Err(KindleError::Corruption("unexpected direct message field count"));
        }
        loop {
            match reader.state() {
                0 => match reader.read_u64(buf) {
                    Some(v) => self.counter = v,
                    None => return Ok(false),
                },
                1 => match reader.read_u64(buf) {
                    Some(v) => self.coordinator_version = v,
                    None => return Ok(false),
                },
                2 => match reader.read_i32(buf) {
                    Some(v) => self.op_counter = v as u32,
                    None => return Ok(false),
                },
                _ => return Ok(true),
            }
            reader.inc_state();
        }
    }
}

/// Encodes a whole message into a fresh buffer.
pub fn encode_message<M: DirectMessage>(msg: &M) -> Vec<u8> {
    let mut out = Vec::new();
    let mut writer = DirectWriter::new();
    // A Vec grows on demand, so one pass always completes.
    let _ = msg.write_to(&mut out, &mut writer);
    out
}

/// Decodes a whole message from one contiguous buffer.
pub fn decode_message<M: DirectMessage + Default>(mut src: &[u8]) -> Result<M> {
    let mut msg = M::default();
    let mut reader = DirectReader::new();
    if !msg.read_from(&mut src, &mut reader)? {
        return Err(KindleError::Corruption("direct message truncated"));
    }
    Ok(msg)
}
