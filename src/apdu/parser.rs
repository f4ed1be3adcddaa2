//! Sequential cursor over response data.
//!
//! Reads that would run past the end return [`MissingField`] and leave the
//! cursor where it was, so a caller can try an optional field and fall back.

use core::fmt::Write as _;

use super::ApduResponse;
use crate::error::MissingField;

/// `(tag, length, value)` field with 1-byte tag and 1-byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedField<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct ApduParser<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> ApduParser<'a> {
    pub fn new(response: &'a ApduResponse) -> Self {
        Self::from_slice(&response.data)
    }

    pub fn from_slice(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.index
    }

    /// Whether the whole buffer is at least `len` bytes.
    pub fn has_min_length(&self, len: usize) -> bool {
        self.data.len() >= len
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn read_u8(&mut self) -> Result<u8, MissingField> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, MissingField> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, MissingField> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MissingField> {
        let end = self
            .index
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MissingField {
                offset: self.index,
                wanted: len,
            })?;
        let out = &self.data[self.index..end];
        self.index = end;
        Ok(out)
    }

    /// 1-byte length, then that many bytes.
    pub fn read_lv(&mut self) -> Result<&'a [u8], MissingField> {
        let start = self.index;
        let len = self.read_u8()?;
        self.read_bytes(len as usize).inspect_err(|_| self.index = start)
    }

    /// LV field decoded as ASCII; non-ASCII bytes are replaced.
    pub fn read_lv_ascii(&mut self) -> Result<String, MissingField> {
        let bytes = self.read_lv()?;
        Ok(bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect())
    }

    pub fn read_tlv(&mut self) -> Result<TaggedField<'a>, MissingField> {
        let start = self.index;
        let tag = self.read_u8()?;
        match self.read_lv() {
            Ok(value) => Ok(TaggedField { tag, value }),
            Err(e) => {
                self.index = start;
                Err(e)
            }
        }
    }

    /// Everything after the cursor; may be empty.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let out = &self.data[self.index..];
        self.index = self.data.len();
        out
    }
}

/// Lower-case hex without prefix.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
