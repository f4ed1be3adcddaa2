//! Typed APDU construction.
//!
//! Writers never panic: an append that would overflow the short-form
//! payload is skipped and recorded, and [`ApduBuilder::build`] reports the
//! first recorded error.

use super::{Apdu, ApduData, MAX_DATA_LEN};
use crate::error::BuildError;

#[derive(Debug, Clone)]
pub struct ApduBuilder {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: ApduData,
    errors: Vec<BuildError>,
}

impl ApduBuilder {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: ApduData::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_u8(self, value: u8) -> Self {
        self.add_bytes(&[value])
    }

    /// Big-endian.
    pub fn add_u16(self, value: u16) -> Self {
        self.add_bytes(&value.to_be_bytes())
    }

    /// Big-endian.
    pub fn add_u32(self, value: u32) -> Self {
        self.add_bytes(&value.to_be_bytes())
    }

    pub fn add_bytes(mut self, bytes: &[u8]) -> Self {
        self.push(bytes);
        self
    }

    pub fn add_ascii(mut self, value: &str) -> Self {
        if value.is_ascii() {
            self.push(value.as_bytes());
        } else {
            self.errors.push(BuildError::NotAscii);
        }
        self
    }

    /// Accepts an optional `0x` prefix.
    pub fn add_hex(mut self, value: &str) -> Self {
        match decode_hex(value) {
            Ok(bytes) => self.push(&bytes),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// One length byte, then the bytes.
    pub fn add_lv_bytes(mut self, bytes: &[u8]) -> Self {
        self.push_lv(bytes);
        self
    }

    pub fn add_lv_ascii(mut self, value: &str) -> Self {
        if value.is_ascii() {
            self.push_lv(value.as_bytes());
        } else {
            self.errors.push(BuildError::NotAscii);
        }
        self
    }

    pub fn add_lv_hex(mut self, value: &str) -> Self {
        match decode_hex(value) {
            Ok(bytes) => self.push_lv(&bytes),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Bytes still free in the payload.
    pub fn available_payload(&self) -> usize {
        MAX_DATA_LEN - self.data.len()
    }

    pub fn errors(&self) -> &[BuildError] {
        &self.errors
    }

    pub fn build(self) -> Result<Apdu, BuildError> {
        if let Some(&first) = self.errors.first() {
            return Err(first);
        }
        Ok(Apdu::from_parts(self.cla, self.ins, self.p1, self.p2, self.data))
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() > self.available_payload() {
            self.errors.push(BuildError::DataOverflow {
                needed: bytes.len(),
                available: self.available_payload(),
            });
            return;
        }
        // Capacity checked above.
        let _ = self.data.extend_from_slice(bytes);
    }

    fn push_lv(&mut self, bytes: &[u8]) {
        let Ok(len) = u8::try_from(bytes.len()) else {
            self.errors.push(BuildError::DataOverflow {
                needed: bytes.len() + 1,
                available: self.available_payload(),
            });
            return;
        };
        if bytes.len() + 1 > self.available_payload() {
            self.errors.push(BuildError::DataOverflow {
                needed: bytes.len() + 1,
                available: self.available_payload(),
            });
            return;
        }
        self.push(&[len]);
        self.push(bytes);
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, BuildError> {
    let digits = value.strip_prefix("0x").unwrap_or(value).as_bytes();
    if digits.len() % 2 != 0 {
        return Err(BuildError::InvalidHex);
    }
    digits
        .chunks_exact(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

fn nibble(c: u8) -> Result<u8, BuildError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(BuildError::InvalidHex),
    }
}
