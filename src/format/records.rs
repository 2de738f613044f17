//! Record-level encoding inside a block payload.

use crate::error::FormatError;
use crate::utils::{decode_varint, encode_varint, is_incomplete_varint};

/// Append-only writer for fixed-width little-endian and varint records.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_varint(&mut self, value: u32) {
        encode_varint(value, &mut self.buf);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Varint length prefix followed by the UTF-8 bytes
    pub fn put_str(&mut self, value: &str) {
        self.put_varint(value.len() as u32);
        self.put_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Checked reader over a block payload.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(len).ok_or(FormatError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(FormatError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let bytes = self.get_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, FormatError> {
        self.get_array().map(u32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, FormatError> {
        self.get_array().map(u64::from_le_bytes)
    }

    pub fn get_varint(&mut self) -> Result<u32, FormatError> {
        let rest = &self.data[self.pos..];
        match decode_varint(rest) {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(varint_error(rest)),
        }
    }

    pub fn get_str(&mut self) -> Result<&'a str, FormatError> {
        let len = self.get_varint()? as usize;
        let bytes = self.get_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| FormatError::corrupt("string is not valid UTF-8"))
    }
}

fn varint_error(rest: &[u8]) -> FormatError {
    if is_incomplete_varint(rest) {
        FormatError::Truncated
    } else {
        FormatError::corrupt("varint overflow")
    }
}
