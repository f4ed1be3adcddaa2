//! In-memory duplex link.
//!
//! ```text
//!  PipeTransport (host) ──to_device──► DevicePipe (emulated device)
//!                       ◄──to_host────
//! ```
//!
//! Each [`PipeConnector::open`] creates a fresh link and hands its device
//! end to whoever is blocked in [`PipeListener::accept`].  A
//! [`PipeControl`] handle injects faults: failing frame writes, dropping
//! the link, refusing or delaying reconnection.

use core::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, info};

use super::{Connector, Handshake, LinkEvent, Reachability, Transport};
use crate::error::LinkError;
use crate::framing::FrameProfile;

/// Frames buffered per direction.
const PIPE_DEPTH: usize = 16;

/// Device ends waiting to be accepted.
const ACCEPT_DEPTH: usize = 4;

type Cs = CriticalSectionRawMutex;

// ── One physical link ────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkFlags {
    closed: bool,
    fail_writes: u32,
    written: u32,
    read: u32,
}

struct Link {
    id: u32,
    to_device: Channel<Cs, Vec<u8>, PIPE_DEPTH>,
    to_host: Channel<Cs, Vec<u8>, PIPE_DEPTH>,
    flags: Mutex<Cs, RefCell<LinkFlags>>,
    host_lost: Signal<Cs, ()>,
    device_lost: Signal<Cs, ()>,
}

impl Link {
    fn new(id: u32) -> Self {
        Self {
            id,
            to_device: Channel::new(),
            to_host: Channel::new(),
            flags: Mutex::new(RefCell::new(LinkFlags::default())),
            host_lost: Signal::new(),
            device_lost: Signal::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.flags.lock(|f| f.borrow().closed)
    }

    fn shut(&self) {
        let was_closed = self.flags.lock(|f| core::mem::replace(&mut f.borrow_mut().closed, true));
        if !was_closed {
            info!("pipe link {} closed", self.id);
            self.host_lost.signal(());
            self.device_lost.signal(());
        }
    }
}

/// Host end of a link.
pub struct PipeTransport {
    link: Arc<Link>,
}

impl PipeTransport {
    pub fn link_id(&self) -> u32 {
        self.link.id
    }
}

impl Transport for PipeTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let injected = self.link.flags.lock(|f| {
            let mut f = f.borrow_mut();
            if f.closed {
                Some(LinkError::Disconnected)
            } else if f.fail_writes > 0 {
                f.fail_writes -= 1;
                Some(LinkError::WriteFailed)
            } else {
                None
            }
        });
        if let Some(err) = injected {
            debug!("pipe link {}: write rejected ({err})", self.link.id);
            return Err(err);
        }

        future::or(
            async {
                self.link.to_device.send(frame.to_vec()).await;
                self.link.flags.lock(|f| f.borrow_mut().written += 1);
                Ok(())
            },
            async {
                self.link.device_lost.wait().await;
                Err(LinkError::Disconnected)
            },
        )
        .await
    }

    async fn next_event(&mut self) -> LinkEvent {
        if let Ok(frame) = self.link.to_host.try_receive() {
            return LinkEvent::Data(frame);
        }
        if self.link.is_closed() {
            return LinkEvent::LinkLost;
        }
        future::or(
            async { LinkEvent::Data(self.link.to_host.receive().await) },
            async {
                self.link.host_lost.wait().await;
                LinkEvent::LinkLost
            },
        )
        .await
    }

    fn close(&mut self) {
        self.link.shut();
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.link.shut();
    }
}

/// Device end of a link.
pub struct DevicePipe {
    link: Arc<Link>,
}

impl DevicePipe {
    pub fn link_id(&self) -> u32 {
        self.link.id
    }

    pub fn is_open(&self) -> bool {
        !self.link.is_closed()
    }

    /// Next frame written by the host; `None` once the link is gone.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let frame = self.next_frame().await;
        if frame.is_some() {
            self.link.flags.lock(|f| f.borrow_mut().read += 1);
        }
        frame
    }

    async fn next_frame(&self) -> Option<Vec<u8>> {
        if let Ok(frame) = self.link.to_device.try_receive() {
            return Some(frame);
        }
        if self.link.is_closed() {
            return None;
        }
        future::or(async { Some(self.link.to_device.receive().await) }, async {
            self.link.device_lost.wait().await;
            None
        })
        .await
    }

    /// Frames the host has written that the device has not read yet.
    pub fn unread_frames(&self) -> u32 {
        self.link.flags.lock(|f| {
            let f = f.borrow();
            f.written.saturating_sub(f.read)
        })
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        if self.link.is_closed() {
            return Err(LinkError::Disconnected);
        }
        self.link.to_host.send(frame).await;
        Ok(())
    }

    /// Simulate the device dropping off the link.
    pub fn drop_link(&self) {
        self.link.shut();
    }

    /// The next `count` host frame writes fail with [`LinkError::WriteFailed`].
    pub fn fail_next_writes(&self, count: u32) {
        self.link.flags.lock(|f| f.borrow_mut().fail_writes = count);
    }
}

impl Drop for DevicePipe {
    fn drop(&mut self) {
        self.link.shut();
    }
}

// ── Connector ────────────────────────────────────────────────

#[derive(Debug)]
struct ControlState {
    reachable: bool,
    signals_reachability: bool,
    open_failures: VecDeque<LinkError>,
    opened: u32,
}

struct ControlShared {
    state: Mutex<Cs, RefCell<ControlState>>,
    reachable: Signal<Cs, ()>,
    accepted: Channel<Cs, DevicePipe, ACCEPT_DEPTH>,
}

/// Fault-injection handle shared by the connector and the listener.
#[derive(Clone)]
pub struct PipeControl {
    shared: Arc<ControlShared>,
}

impl PipeControl {
    /// Whether the device advertises (and accepts new links).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared
            .state
            .lock(|s| s.borrow_mut().reachable = reachable);
        if reachable {
            self.shared.reachable.signal(());
        }
    }

    /// Emulate a transport without an advertisement signal.
    pub fn set_reachability_supported(&self, supported: bool) {
        self.shared
            .state
            .lock(|s| s.borrow_mut().signals_reachability = supported);
    }

    /// The next open fails with `error`.
    pub fn fail_next_open(&self, error: LinkError) {
        self.shared
            .state
            .lock(|s| s.borrow_mut().open_failures.push_back(error));
    }

    /// Links opened so far.
    pub fn opened(&self) -> u32 {
        self.shared.state.lock(|s| s.borrow().opened)
    }
}

pub struct PipeConnector {
    profile: FrameProfile,
    handshake: Handshake,
    control: PipeControl,
}

/// Device side of the connector.
pub struct PipeListener {
    control: PipeControl,
}

impl PipeListener {
    pub async fn accept(&self) -> DevicePipe {
        self.control.shared.accepted.receive().await
    }

    pub fn control(&self) -> PipeControl {
        self.control.clone()
    }
}

impl PipeConnector {
    pub fn new(profile: FrameProfile, handshake: Handshake) -> (Self, PipeListener) {
        let control = PipeControl {
            shared: Arc::new(ControlShared {
                state: Mutex::new(RefCell::new(ControlState {
                    reachable: true,
                    signals_reachability: true,
                    open_failures: VecDeque::new(),
                    opened: 0,
                })),
                reachable: Signal::new(),
                accepted: Channel::new(),
            }),
        };
        let listener = PipeListener {
            control: control.clone(),
        };
        (
            Self {
                profile,
                handshake,
                control,
            },
            listener,
        )
    }

    pub fn control(&self) -> PipeControl {
        self.control.clone()
    }
}

impl Connector for PipeConnector {
    type Transport = PipeTransport;

    fn profile(&self) -> FrameProfile {
        self.profile
    }

    fn handshake(&self) -> Handshake {
        self.handshake
    }

    async fn wait_reachable(&mut self) -> Reachability {
        loop {
            let (supported, reachable) = self
                .control
                .shared
                .state
                .lock(|s| {
                    let s = s.borrow();
                    (s.signals_reachability, s.reachable)
                });
            if !supported {
                return Reachability::Unsupported;
            }
            if reachable {
                return Reachability::Reachable;
            }
            self.control.shared.reachable.wait().await;
        }
    }

    async fn open(&mut self) -> Result<PipeTransport, LinkError> {
        let shared = &self.control.shared;
        let id = shared.state.lock(|s| {
            let mut s = s.borrow_mut();
            if let Some(err) = s.open_failures.pop_front() {
                return Err(err);
            }
            if !s.reachable {
                return Err(LinkError::OutOfRange);
            }
            s.opened += 1;
            Ok(s.opened)
        })?;

        let link = Arc::new(Link::new(id));
        shared
            .accepted
            .try_send(DevicePipe { link: link.clone() })
            .map_err(|_| LinkError::OpenFailed("no device listening"))?;
        info!("pipe link {id} opened");
        Ok(PipeTransport { link })
    }
}
