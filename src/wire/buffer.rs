//! Little-endian wire primitives
//!
//! Layout rules shared by every message type: numbers are fixed-width
//! little-endian, strings are `<u32 len><utf8 bytes>`, sequences are
//! `<u32 count><elements>`, maps are `<u32 count><key, value pairs>`,
//! booleans are one byte. Readers are bounds-checked; running past the end
//! of a frame is a decode error, never a panic.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;

/// Hard cap for any single frame on the wire (8 MB).
/// Individual message kinds are far smaller; the cap bounds peer memory.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Cap for a single string field (1 MB).
pub const MAX_STRING_SIZE: usize = 1024 * 1024;

/// Cap for a single sequence or map field (64k entries).
pub const MAX_SEQUENCE_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("oversize field: {what} of {len}")]
    Oversize { what: &'static str, len: usize },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid value for {what}: {value}")]
    InvalidValue { what: &'static str, value: u64 },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("frame length mismatch: declared {declared}, buffer {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Append-only frame writer.
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(128) }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.write_u64::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.write_i64::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.write_f64::<LittleEndian>(v).expect("vec write");
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_string(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_string_seq(&mut self, v: &[String]) {
        self.put_u32(v.len() as u32);
        for s in v {
            self.put_string(s);
        }
    }

    pub fn put_string_map(&mut self, v: &BTreeMap<String, String>) {
        self.put_u32(v.len() as u32);
        for (k, val) in v {
            self.put_string(k);
            self.put_string(val);
        }
    }

    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked frame reader.
///
/// Trailing bytes after the fields a decoder knows are tolerated: that is
/// how additive minor protocol versions stay readable.
pub struct MessageReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(data) }
    }

    pub fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.remaining() < n {
            Err(WireError::Truncated { needed: n - self.remaining() })
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.cursor.read_u8().expect("checked"))
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.cursor.read_u16::<LittleEndian>().expect("checked"))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.cursor.read_u32::<LittleEndian>().expect("checked"))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.cursor.read_u64::<LittleEndian>().expect("checked"))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(self.cursor.read_i64::<LittleEndian>().expect("checked"))
    }

    pub fn get_f64(&mut self) -> Result<f64, WireError> {
        self.need(8)?;
        Ok(self.cursor.read_f64::<LittleEndian>().expect("checked"))
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::Oversize { what: "byte field", len });
        }
        self.need(len)?;
        let pos = self.cursor.position() as usize;
        let out = self.cursor.get_ref()[pos..pos + len].to_vec();
        self.cursor.set_position((pos + len) as u64);
        Ok(out)
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let len = self.get_u32()? as usize;
        if len > MAX_STRING_SIZE {
            return Err(WireError::Oversize { what: "string", len });
        }
        self.need(len)?;
        let pos = self.cursor.position() as usize;
        let out = std::str::from_utf8(&self.cursor.get_ref()[pos..pos + len])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_string();
        self.cursor.set_position((pos + len) as u64);
        Ok(out)
    }

    pub fn get_string_seq(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.get_u32()? as usize;
        if count > MAX_SEQUENCE_LEN {
            return Err(WireError::Oversize { what: "sequence", len: count });
        }
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    pub fn get_string_map(&mut self) -> Result<BTreeMap<String, String>, WireError> {
        let count = self.get_u32()? as usize;
        if count > MAX_SEQUENCE_LEN {
            return Err(WireError::Oversize { what: "map", len: count });
        }
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = self.get_string()?;
            let v = self.get_string()?;
            out.insert(k, v);
        }
        Ok(out)
    }
}
