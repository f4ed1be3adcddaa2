//! Transport frame codec.
//!
//! A serialized APDU is sliced into MTU-sized frames.  Every frame carries
//! a small header; the first one also declares the total message length so
//! the receiver knows when reassembly is complete.
//!
//! ```text
//! first frame:
//! ┌──────────────┬─────┬──────────┬──────────┬───────────────────┐
//! │ channel (2B) │ tag │ idx = 0  │ len (2B) │ payload ...       │
//! │ HID only, BE │0x05 │ u16 BE   │ u16 BE   │ (zero pad on HID) │
//! └──────────────┴─────┴──────────┴──────────┴───────────────────┘
//! continuation frames:
//! ┌──────────────┬─────┬──────────┬──────────────────────────────┐
//! │ channel (2B) │0x05 │ idx = n  │ payload ...                  │
//! └──────────────┴─────┴──────────┴──────────────────────────────┘
//! ```
//!
//! BLE links skip the channel and negotiate their MTU first (see [`mtu`]);
//! USB-HID links use fixed 64-byte, zero-padded frames.

pub mod framer;
pub mod mtu;
pub mod receiver;

pub use framer::{FrameIter, Framer};
pub use receiver::ApduReceiver;

/// Head tag of an APDU frame.
pub const TAG_APDU: u8 = 0x05;

/// Head tag of the MTU negotiation exchange.
pub const TAG_MTU: u8 = 0x08;

/// USB-HID report size.
pub const HID_FRAME_SIZE: usize = 64;

/// Channel identifier used on USB-HID links.
pub const HID_CHANNEL: u16 = 0x0101;

/// Per-transport framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProfile {
    /// Channel prefix, present only on multiplexed transports.
    pub channel: Option<u16>,
    /// Zero-pad every frame to the full MTU.
    pub padding: bool,
}

impl FrameProfile {
    pub const fn ble() -> Self {
        Self {
            channel: None,
            padding: false,
        }
    }

    pub const fn hid(channel: u16) -> Self {
        Self {
            channel: Some(channel),
            padding: true,
        }
    }

    /// Header bytes on a continuation frame.
    pub const fn header_len(&self) -> usize {
        match self.channel {
            Some(_) => 5,
            None => 3,
        }
    }

    /// Header bytes on the first frame (adds the total length).
    pub const fn first_header_len(&self) -> usize {
        self.header_len() + 2
    }

    /// Smallest MTU able to carry one payload byte in the first frame.
    pub const fn min_mtu(&self) -> usize {
        self.first_header_len() + 1
    }
}
