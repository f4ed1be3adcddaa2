//! Transport abstraction: one physical link to a device.
//!
//! Concrete implementations (BLE GATT write/notify, USB-HID reports) live
//! outside this crate.  The sender and connection layers are generic over
//! [`Transport`] and [`Connector`], so adding a transport requires zero
//! changes to the session logic.
//!
//! ```text
//!   Connector ──open()──► Transport ──write(frame)──► device
//!       │                     ▲
//!  wait_reachable()           └── next_event(): Data(frame) | LinkLost
//! ```
//!
//! The in-memory [`pipe`] transport and the [`emulator`] device behind it
//! implement the same contract for tests and demos.

pub mod emulator;
pub mod pipe;

use crate::error::LinkError;
use crate::framing::FrameProfile;

/// Something the link reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One frame from the device.
    Data(Vec<u8>),
    /// The link is gone; the handle is dead.
    LinkLost,
}

/// A live, exclusively-owned link handle.
pub trait Transport {
    /// Write one frame; resolves once the transport accepted it.
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Next inbound frame or link loss.
    ///
    /// Must be cancel safe: dropping the future before it resolves loses
    /// no event.
    async fn next_event(&mut self) -> LinkEvent;

    /// Tear the handle down.  Idempotent.
    fn close(&mut self);
}

/// How the MTU of a fresh link is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Frame size is fixed by the transport (USB-HID reports).
    Fixed(usize),
    /// Frame size is negotiated with the device (BLE).
    Negotiate,
}

/// Outcome of waiting for the device to become reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    /// The transport cannot signal reachability; wait a fixed delay instead.
    Unsupported,
}

/// Opens links to one device.
pub trait Connector {
    type Transport: Transport;

    fn profile(&self) -> FrameProfile;

    fn handshake(&self) -> Handshake;

    /// Resolves when the device advertises again.  May never resolve.
    async fn wait_reachable(&mut self) -> Reachability;

    /// Open the low-level handle and resolve the device's service.
    async fn open(&mut self) -> Result<Self::Transport, LinkError>;
}
