//! Sender side: lazy frame production.
//!
//! [`FrameIter`] owns its message and yields one frame per `next()`, so a
//! caller can write a frame, await the write, then pull the next.  BLE
//! peers must never see two outstanding writes.

use log::debug;

use super::{FrameProfile, TAG_APDU};
use crate::apdu::Apdu;
use crate::error::FrameError;

/// Frame producer bound to one negotiated MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framer {
    profile: FrameProfile,
    mtu: usize,
}

impl Framer {
    pub fn new(profile: FrameProfile, mtu: usize) -> Result<Self, FrameError> {
        if mtu < profile.min_mtu() {
            return Err(FrameError::MtuTooSmall(mtu));
        }
        Ok(Self { profile, mtu })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn profile(&self) -> FrameProfile {
        self.profile
    }

    /// Frames for a command.
    pub fn frames(&self, apdu: &Apdu) -> FrameIter {
        FrameIter::new(*self, apdu.to_bytes())
    }

    /// Frames for an arbitrary message (responses, raw streams).
    pub fn frame_message(&self, message: &[u8]) -> Result<FrameIter, FrameError> {
        if message.len() > usize::from(u16::MAX) {
            return Err(FrameError::MessageTooLong(message.len()));
        }
        Ok(FrameIter::new(*self, message.to_vec()))
    }

    /// Number of frames a message of `len` bytes needs.
    pub fn frame_count(&self, len: usize) -> usize {
        let first = self.first_capacity();
        if len <= first {
            1
        } else {
            1 + (len - first).div_ceil(self.next_capacity())
        }
    }

    fn first_capacity(&self) -> usize {
        self.mtu - self.profile.first_header_len()
    }

    fn next_capacity(&self) -> usize {
        self.mtu - self.profile.header_len()
    }
}

/// Ordered, pull-based frame sequence for one message.
#[derive(Debug, Clone)]
pub struct FrameIter {
    framer: Framer,
    message: Vec<u8>,
    offset: usize,
    index: u16,
    done: bool,
}

impl FrameIter {
    fn new(framer: Framer, message: Vec<u8>) -> Self {
        Self {
            framer,
            message,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Frames not yet produced.
    pub fn remaining(&self) -> usize {
        if self.done {
            0
        } else if self.index == 0 {
            self.framer.frame_count(self.message.len())
        } else {
            (self.message.len() - self.offset).div_ceil(self.framer.next_capacity())
        }
    }
}

impl Iterator for FrameIter {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }

        let profile = self.framer.profile;
        let mut frame = Vec::with_capacity(self.framer.mtu);
        if let Some(channel) = profile.channel {
            frame.extend_from_slice(&channel.to_be_bytes());
        }
        frame.push(TAG_APDU);
        frame.extend_from_slice(&self.index.to_be_bytes());

        let capacity = if self.index == 0 {
            frame.extend_from_slice(&(self.message.len() as u16).to_be_bytes());
            self.framer.first_capacity()
        } else {
            self.framer.next_capacity()
        };

        let end = (self.offset + capacity).min(self.message.len());
        frame.extend_from_slice(&self.message[self.offset..end]);
        if profile.padding {
            frame.resize(self.framer.mtu, 0);
        }

        debug!(
            "frame {} ({} payload bytes, {} total)",
            self.index,
            end - self.offset,
            frame.len()
        );

        self.offset = end;
        self.index = self.index.wrapping_add(1);
        self.done = self.offset >= self.message.len();
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for FrameIter {}
