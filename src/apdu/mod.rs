//! Command/response wire envelope.
//!
//! ```text
//!  command:   ┌─────┬─────┬────┬────┬────┬──────────────┐
//!             │ CLA │ INS │ P1 │ P2 │ Lc │ data (≤ 255) │
//!             └─────┴─────┴────┴────┴────┴──────────────┘
//!  response:  ┌──────────────────┬──────────┐
//!             │ data (N bytes)   │ SW1 SW2  │
//!             └──────────────────┴──────────┘
//! ```
//!
//! [`ApduBuilder`] assembles the command side with typed writers;
//! [`ApduParser`] walks the data of a response with explicit
//! missing-field results.

pub mod builder;
pub mod parser;

use core::fmt;

pub use builder::ApduBuilder;
pub use parser::{ApduParser, TaggedField, to_hex};

use crate::error::{BuildError, FrameError};

/// Short-form payload limit (1-byte Lc).
pub const MAX_DATA_LEN: usize = 255;

/// Header bytes before the payload: CLA, INS, P1, P2, Lc.
pub const HEADER_LEN: usize = 5;

/// Payload storage sized to the wire limit.
pub type ApduData = heapless::Vec<u8, MAX_DATA_LEN>;

// ---------------------------------------------------------------------------
// Status word
// ---------------------------------------------------------------------------

/// Two-byte response trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// An immutable command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: ApduData,
}

impl Apdu {
    /// Command without payload.
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: heapless::Vec::new(),
        }
    }

    /// Command with payload; fails above [`MAX_DATA_LEN`].
    pub fn with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<Self, BuildError> {
        let data = ApduData::from_slice(data).map_err(|()| BuildError::DataOverflow {
            needed: data.len(),
            available: MAX_DATA_LEN,
        })?;
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            data,
        })
    }

    pub(crate) fn from_parts(cla: u8, ins: u8, p1: u8, p2: u8, data: ApduData) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
        }
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serialized length on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    /// `[cla, ins, p1, p2, Lc, data..]`; Lc is always present.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        out.extend_from_slice(&self.data);
        out
    }

    /// Inverse of [`Apdu::to_bytes`]; `None` when Lc disagrees with the length.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let (header, data) = raw.split_at_checked(HEADER_LEN)?;
        if header[4] as usize != data.len() {
            return None;
        }
        Self::with_data(header[0], header[1], header[2], header[3], data).ok()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A decoded response: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub status: StatusWord,
    pub data: Vec<u8>,
}

impl ApduResponse {
    pub fn new(status: StatusWord, data: Vec<u8>) -> Self {
        Self { status, data }
    }

    /// Payload-less success response.
    pub fn success() -> Self {
        Self::new(StatusWord::SUCCESS, Vec::new())
    }

    /// Split the 2-byte trailer off a reassembled response.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        let split = raw
            .len()
            .checked_sub(2)
            .ok_or(FrameError::ResponseTooShort)?;
        let (data, sw) = raw.split_at(split);
        Ok(Self {
            status: StatusWord(u16::from_be_bytes([sw[0], sw[1]])),
            data: data.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.status.to_bytes());
        out
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_lc() {
        let apdu = Apdu::with_data(0xe0, 0xd8, 0x00, 0x00, b"Bitcoin").unwrap();
        assert_eq!(
            apdu.to_bytes(),
            [0xe0, 0xd8, 0x00, 0x00, 0x07, b'B', b'i', b't', b'c', b'o', b'i', b'n']
        );
        assert_eq!(Apdu::from_bytes(&apdu.to_bytes()), Some(apdu));
    }

    #[test]
    fn empty_payload_has_zero_lc() {
        assert_eq!(Apdu::new(0xb0, 0x01, 0, 0).to_bytes(), [0xb0, 0x01, 0, 0, 0]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let data = [0u8; 256];
        assert_eq!(
            Apdu::with_data(0xe0, 0x00, 0, 0, &data),
            Err(BuildError::DataOverflow {
                needed: 256,
                available: 255
            })
        );
        assert!(Apdu::with_data(0xe0, 0x00, 0, 0, &data[..255]).is_ok());
    }

    #[test]
    fn from_bytes_checks_lc() {
        assert_eq!(Apdu::from_bytes(&[0xe0, 0x01, 0, 0, 2, 0xaa]), None);
        assert_eq!(Apdu::from_bytes(&[0xe0, 0x01, 0]), None);
    }

    #[test]
    fn response_splits_status_word() {
        let r = ApduResponse::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert!(r.is_success());
        assert_eq!(r.data, [0x01, 0x02]);

        let r = ApduResponse::from_bytes(&[0x68, 0x07]).unwrap();
        assert_eq!(r.status, StatusWord(0x6807));
        assert!(r.data.is_empty());
        assert_eq!(r.to_bytes(), [0x68, 0x07]);
    }

    #[test]
    fn response_below_two_bytes_is_error() {
        assert_eq!(
            ApduResponse::from_bytes(&[0x90]),
            Err(FrameError::ResponseTooShort)
        );
        assert_eq!(ApduResponse::from_bytes(&[]), Err(FrameError::ResponseTooShort));
    }

    #[test]
    fn status_word_display() {
        assert_eq!(StatusWord(0x6807).to_string(), "0x6807");
        assert_eq!(StatusWord::SUCCESS.to_string(), "0x9000");
    }
}
