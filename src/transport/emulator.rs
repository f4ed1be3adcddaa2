//! Emulated device behind the pipe transport.
//!
//! Accepts links from a [`PipeListener`], answers the MTU handshake,
//! reassembles command frames and replies through a user-supplied
//! [`DeviceHandler`].  Every frame and reply is recorded in a [`Journal`]
//! so tests can check wire ordering.

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, info, warn};

use super::pipe::{DevicePipe, PipeListener};
use crate::apdu::{Apdu, ApduResponse, StatusWord};
use crate::framing::mtu::{is_mtu_frame, mtu_response};
use crate::framing::{ApduReceiver, FrameProfile, Framer};

/// What the device does with one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Respond(ApduResponse),
    /// Answer after a delay (user confirming on the device).
    RespondAfter(Duration, ApduResponse),
    /// Answer, then drop the link (app switch).
    RespondThenDisconnect(ApduResponse),
    /// Drop the link without answering.
    Disconnect,
    /// Never answer.
    Ignore,
    /// Send these frames as-is, e.g. a response with a frame missing.
    Frames(Vec<Vec<u8>>),
}

pub trait DeviceHandler {
    fn handle(&mut self, apdu: &Apdu, link: &DevicePipe) -> Reply;
}

impl<F> DeviceHandler for F
where
    F: FnMut(&Apdu, &DevicePipe) -> Reply,
{
    fn handle(&mut self, apdu: &Apdu, link: &DevicePipe) -> Reply {
        self(apdu, link)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// An APDU frame arrived on link `link`.
    FrameIn { link: u32 },
    /// A command was fully reassembled.
    Command { link: u32, apdu: Apdu },
    /// The reply to the last command was fully written; `unread` host
    /// frames were already waiting at that point.
    Responded {
        link: u32,
        status: StatusWord,
        unread: u32,
    },
    /// The device dropped link `link`.
    Dropped { link: u32 },
}

/// Shared record of everything the emulator saw.
#[derive(Clone)]
pub struct Journal {
    entries: Arc<Mutex<CriticalSectionRawMutex, RefCell<Vec<JournalEntry>>>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(RefCell::new(Vec::new()))),
        }
    }
}

impl Journal {
    fn push(&self, entry: JournalEntry) {
        self.entries.lock(|e| e.borrow_mut().push(entry));
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock(|e| e.borrow().clone())
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<Apdu> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Command { apdu, .. } => Some(apdu),
                _ => None,
            })
            .collect()
    }
}

pub struct DeviceEmulator<H> {
    listener: PipeListener,
    profile: FrameProfile,
    mtu: u8,
    handler: H,
    journal: Journal,
}

impl<H: DeviceHandler> DeviceEmulator<H> {
    /// `mtu` is announced on BLE-style links and used for every reply.
    pub fn new(listener: PipeListener, profile: FrameProfile, mtu: u8, handler: H) -> Self {
        Self {
            listener,
            profile,
            mtu,
            handler,
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Serve every link the host opens, forever.
    pub async fn run(&mut self) {
        loop {
            let link = self.listener.accept().await;
            info!("emulator: serving link {}", link.link_id());
            self.serve(&link).await;
            info!("emulator: link {} ended", link.link_id());
        }
    }

    /// Serve one link until it closes.
    pub async fn serve(&mut self, link: &DevicePipe) {
        let framer = match Framer::new(self.profile, usize::from(self.mtu)) {
            Ok(framer) => framer,
            Err(e) => {
                warn!("emulator: {e}");
                return;
            }
        };
        let mut receiver = ApduReceiver::new(self.profile);
        let id = link.link_id();

        while let Some(frame) = link.recv().await {
            if is_mtu_frame(&frame) {
                if link.send(mtu_response(self.mtu).to_vec()).await.is_err() {
                    break;
                }
                continue;
            }

            self.journal.push(JournalEntry::FrameIn { link: id });
            let raw = match receiver.handle_raw_frame(&frame) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("emulator: dropping frame: {e}");
                    continue;
                }
            };
            let Some(apdu) = Apdu::from_bytes(&raw) else {
                warn!("emulator: malformed command ({} bytes)", raw.len());
                continue;
            };
            debug!("emulator: command {:02x} {:02x}", apdu.cla(), apdu.ins());
            self.journal.push(JournalEntry::Command {
                link: id,
                apdu: apdu.clone(),
            });

            match self.handler.handle(&apdu, link) {
                Reply::Respond(response) => {
                    self.respond(link, &framer, &response).await;
                }
                Reply::RespondAfter(delay, response) => {
                    Timer::after(delay).await;
                    self.respond(link, &framer, &response).await;
                }
                Reply::RespondThenDisconnect(response) => {
                    self.respond(link, &framer, &response).await;
                    self.drop_link(link);
                    break;
                }
                Reply::Disconnect => {
                    self.drop_link(link);
                    break;
                }
                Reply::Ignore => {}
                Reply::Frames(frames) => {
                    for frame in frames {
                        if link.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn respond(&self, link: &DevicePipe, framer: &Framer, response: &ApduResponse) {
        let unread = link.unread_frames();
        let frames = match framer.frame_message(&response.to_bytes()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("emulator: cannot frame reply: {e}");
                return;
            }
        };
        for frame in frames {
            if link.send(frame).await.is_err() {
                return;
            }
        }
        self.journal.push(JournalEntry::Responded {
            link: link.link_id(),
            status: response.status,
            unread,
        });
    }

    fn drop_link(&self, link: &DevicePipe) {
        self.journal.push(JournalEntry::Dropped {
            link: link.link_id(),
        });
        link.drop_link();
    }
}
