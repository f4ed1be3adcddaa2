//! Device APDU sender: "send a command, get a response" over one link.
//!
//! Owns the transport handle and the Framer/ApduReceiver pair built from
//! the negotiated MTU.  A sender never outlives its link: the connection
//! builds a fresh one on every reconnection.
//!
//! ```text
//!  exchange(apdu) ──► Framer ──frame──► write (retry ×N) ──► Transport
//!        ▲                                                       │
//!        └──── ApduResponse ◄── ApduReceiver ◄── Data(frame) ◄───┘
//! ```
//!
//! Frames are written one at a time, each write awaited before the next
//! frame is pulled.  A failed write is retried a few times; only an
//! exhausted retry budget or a link loss is reported as a link failure.

use core::future::Future;
use core::time::Duration;

use async_io_mini::Timer;
use futures_lite::future;
use log::{debug, info, warn};

use crate::apdu::{Apdu, ApduResponse};
use crate::config::SessionConfig;
use crate::error::{ExchangeError, LinkError};
use crate::framing::mtu::{is_mtu_frame, mtu_request, parse_mtu_response};
use crate::framing::{ApduReceiver, FrameProfile, Framer};
use crate::transport::{Handshake, LinkEvent, Transport};

pub struct DeviceApduSender<T: Transport> {
    transport: T,
    profile: FrameProfile,
    handshake: Handshake,
    codec: Option<(Framer, ApduReceiver)>,
    write_retries: u8,
    retry_delay: Duration,
    handshake_timeout: Duration,
}

impl<T: Transport> DeviceApduSender<T> {
    pub fn new(
        transport: T,
        profile: FrameProfile,
        handshake: Handshake,
        config: &SessionConfig,
    ) -> Self {
        Self {
            transport,
            profile,
            handshake,
            codec: None,
            write_retries: config.frame_write_retries,
            retry_delay: config.frame_retry_delay(),
            handshake_timeout: config.mtu_handshake_timeout(),
        }
    }

    /// Negotiated frame size, once [`DeviceApduSender::setup`] succeeded.
    pub fn mtu(&self) -> Option<usize> {
        self.codec.as_ref().map(|(framer, _)| framer.mtu())
    }

    pub fn is_ready(&self) -> bool {
        self.codec.is_some()
    }

    /// Run the MTU handshake and build a fresh codec pair.
    pub async fn setup(&mut self) -> Result<(), ExchangeError> {
        self.codec = None;
        let mtu = match self.handshake {
            Handshake::Fixed(mtu) => mtu,
            Handshake::Negotiate => {
                let timeout = self.handshake_timeout;
                with_timeout(timeout, self.negotiate_mtu()).await?
            }
        };
        let framer = Framer::new(self.profile, mtu)?;
        self.codec = Some((framer, ApduReceiver::new(self.profile)));
        info!("sender ready (mtu {mtu})");
        Ok(())
    }

    async fn negotiate_mtu(&mut self) -> Result<usize, ExchangeError> {
        self.write_frame(&mtu_request()).await?;
        loop {
            match self.transport.next_event().await {
                LinkEvent::Data(frame) if is_mtu_frame(&frame) => {
                    return Ok(parse_mtu_response(&frame)?);
                }
                LinkEvent::Data(frame) => {
                    warn!("dropping {} byte frame during MTU negotiation", frame.len());
                }
                LinkEvent::LinkLost => return Err(LinkError::Disconnected.into()),
            }
        }
    }

    /// One command/response exchange bounded by `timeout`.
    pub async fn exchange(
        &mut self,
        apdu: &Apdu,
        timeout: Duration,
    ) -> Result<ApduResponse, ExchangeError> {
        with_timeout(timeout, self.exchange_inner(apdu)).await
    }

    async fn exchange_inner(&mut self, apdu: &Apdu) -> Result<ApduResponse, ExchangeError> {
        let framer = {
            let (framer, receiver) = self.codec.as_mut().ok_or(ExchangeError::NotReady)?;
            receiver.reset();
            *framer
        };

        debug!(
            "exchange {:02x} {:02x} ({} bytes, {} frames)",
            apdu.cla(),
            apdu.ins(),
            apdu.encoded_len(),
            framer.frame_count(apdu.encoded_len())
        );
        for frame in framer.frames(apdu) {
            self.write_frame(&frame).await?;
        }

        loop {
            match self.transport.next_event().await {
                LinkEvent::Data(frame) if is_mtu_frame(&frame) => {
                    warn!("ignoring MTU frame during exchange");
                }
                LinkEvent::Data(frame) => {
                    let (_, receiver) = self.codec.as_mut().ok_or(ExchangeError::NotReady)?;
                    if let Some(response) = receiver.handle_frame(&frame)? {
                        debug!("response {} ({} bytes)", response.status, response.data.len());
                        return Ok(response);
                    }
                }
                LinkEvent::LinkLost => return Err(LinkError::Disconnected.into()),
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ExchangeError> {
        let mut attempt = 0u8;
        loop {
            match self.transport.write(frame).await {
                Ok(()) => return Ok(()),
                Err(LinkError::Disconnected) => return Err(LinkError::Disconnected.into()),
                Err(e) if attempt < self.write_retries => {
                    attempt += 1;
                    warn!("frame write failed ({e}), retry {attempt}/{}", self.write_retries);
                    Timer::after(self.retry_delay).await;
                }
                Err(e) => {
                    warn!("frame write failed ({e}), retries exhausted");
                    return Err(ExchangeError::WriteRetriesExhausted);
                }
            }
        }
    }

    /// Watch an idle link; resolves once it is lost.  Unsolicited frames
    /// are dropped.
    pub async fn wait_link_lost(&mut self) {
        loop {
            match self.transport.next_event().await {
                LinkEvent::Data(frame) => {
                    warn!("dropping unsolicited {} byte frame", frame.len());
                }
                LinkEvent::LinkLost => return,
            }
        }
    }

    pub fn close(&mut self) {
        self.codec = None;
        self.transport.close();
    }
}

/// Bound `fut` by `duration`; the timer losing the race is dropped.
pub(crate) async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    future::or(fut, async {
        Timer::after(duration).await;
        Err(ExchangeError::Timeout)
    })
    .await
}
