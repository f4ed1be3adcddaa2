//! MTU negotiation (BLE).
//!
//! ```text
//! request:   [0x08, 0x00, 0x00, 0x00, 0x00]
//! response:  [0x08, _, _, _, _, mtu]
//! ```
//!
//! The negotiated value fixes the frame size of one Framer/ApduReceiver
//! pair; renegotiating means building a fresh pair.

use super::TAG_MTU;
use crate::error::FrameError;

pub const MTU_REQUEST: [u8; 5] = [TAG_MTU, 0x00, 0x00, 0x00, 0x00];

const MTU_OFFSET: usize = 5;

pub fn mtu_request() -> [u8; 5] {
    MTU_REQUEST
}

/// Whether a frame belongs to the MTU exchange rather than an APDU.
pub fn is_mtu_frame(frame: &[u8]) -> bool {
    frame.first() == Some(&TAG_MTU)
}

pub fn parse_mtu_response(frame: &[u8]) -> Result<usize, FrameError> {
    if !is_mtu_frame(frame) {
        return Err(FrameError::InvalidMtuResponse);
    }
    frame
        .get(MTU_OFFSET)
        .map(|&mtu| usize::from(mtu))
        .ok_or(FrameError::InvalidMtuResponse)
}

/// Device-side answer announcing `mtu`.
pub fn mtu_response(mtu: u8) -> [u8; 6] {
    [TAG_MTU, 0x00, 0x00, 0x00, 0x00, mtu]
}
