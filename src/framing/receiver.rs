//! Receiver side: frame reassembly.
//!
//! A small state machine, fed one transport frame at a time:
//!
//! ```text
//!            idx 0 (complete)
//!   Idle ────────────────────────► yields ApduResponse
//!    │  ▲
//!    │  │ complete / gap (error)
//!    ▼  │
//!  Receiving { expected_len, next_index }
//!    │  ▲
//!    └──┘ idx == next_index
//! ```
//!
//! A frame with index 0 always starts a new message: any partial buffer is
//! discarded, never returned.  A frame with any other unexpected index
//! resets the receiver and surfaces [`FrameError::SequenceGap`].

use log::{debug, warn};

use super::{FrameProfile, TAG_APDU};
use crate::apdu::ApduResponse;
use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Idle,
    Receiving { expected_len: usize, next_index: u16 },
}

#[derive(Debug)]
pub struct ApduReceiver {
    profile: FrameProfile,
    state: ReceiverState,
    buffer: Vec<u8>,
}

impl ApduReceiver {
    pub fn new(profile: FrameProfile) -> Self {
        Self {
            profile,
            state: ReceiverState::Idle,
            buffer: Vec::new(),
        }
    }

    /// Whether a message is partially reassembled.
    pub fn is_receiving(&self) -> bool {
        matches!(self.state, ReceiverState::Receiving { .. })
    }

    /// Discard any partial message.
    pub fn reset(&mut self) {
        self.state = ReceiverState::Idle;
        self.buffer.clear();
    }

    /// Feed one frame.
    ///
    /// Returns `Ok(None)` while the message is incomplete and the decoded
    /// response once the declared length has been received.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<ApduResponse>, FrameError> {
        match self.handle_raw_frame(frame)? {
            Some(raw) => ApduResponse::from_bytes(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Same as [`ApduReceiver::handle_frame`] but yields the raw message
    /// bytes (the device side reassembles commands this way).
    pub fn handle_raw_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let (index, body) = self.parse_header(frame)?;

        if index == 0 {
            if self.is_receiving() {
                warn!("new message started mid-reassembly, discarding {} bytes", self.buffer.len());
            }
            let (len, payload) = body
                .split_first_chunk::<2>()
                .ok_or(FrameError::FrameTooShort)?;
            let expected_len = usize::from(u16::from_be_bytes(*len));
            self.buffer.clear();
            self.state = ReceiverState::Receiving {
                expected_len,
                next_index: 1,
            };
            return Ok(self.accept(payload, expected_len));
        }

        match self.state {
            ReceiverState::Idle => Err(FrameError::UnexpectedContinuation(index)),
            ReceiverState::Receiving {
                expected_len,
                next_index,
            } => {
                if index != next_index {
                    self.reset();
                    return Err(FrameError::SequenceGap {
                        expected: next_index,
                        received: index,
                    });
                }
                self.state = ReceiverState::Receiving {
                    expected_len,
                    next_index: next_index.wrapping_add(1),
                };
                Ok(self.accept(body, expected_len))
            }
        }
    }

    fn parse_header<'f>(&self, frame: &'f [u8]) -> Result<(u16, &'f [u8]), FrameError> {
        let mut rest = frame;
        if let Some(expected) = self.profile.channel {
            let (channel, tail) = rest
                .split_first_chunk::<2>()
                .ok_or(FrameError::FrameTooShort)?;
            let received = u16::from_be_bytes(*channel);
            if received != expected {
                return Err(FrameError::ChannelMismatch { expected, received });
            }
            rest = tail;
        }
        let (&tag, tail) = rest.split_first().ok_or(FrameError::FrameTooShort)?;
        if tag != TAG_APDU {
            return Err(FrameError::UnexpectedTag(tag));
        }
        let (index, body) = tail
            .split_first_chunk::<2>()
            .ok_or(FrameError::FrameTooShort)?;
        Ok((u16::from_be_bytes(*index), body))
    }

    /// Append payload (padding beyond the declared length is dropped).
    fn accept(&mut self, payload: &[u8], expected_len: usize) -> Option<Vec<u8>> {
        let wanted = expected_len - self.buffer.len();
        self.buffer
            .extend_from_slice(&payload[..payload.len().min(wanted)]);

        if self.buffer.len() < expected_len {
            return None;
        }

        self.state = ReceiverState::Idle;
        debug!("reassembled {} byte message", self.buffer.len());
        Some(core::mem::take(&mut self.buffer))
    }
}
