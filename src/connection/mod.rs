//! Device connection: a resilient, request-serializing wrapper around one
//! [`DeviceApduSender`] at a time.
//!
//! ```text
//!  send_apdu() ──try_send──► ┌──────────────────┐
//!  send_apdu() ──try_send──► │ request queue    │ (bounded FIFO, QUEUE_DEPTH)
//!                            └────────┬─────────┘
//!                                     │ receive (one at a time)
//!                            ┌────────▼─────────┐   Connector::open
//!    close() ──signal──────► │  run() driver    │ ◄────────────────── reconnect
//!                            │  LinkState       │     (backoff, budget)
//!                            └────────┬─────────┘
//!                                     │ exchange
//!                            DeviceApduSender (generation N)
//! ```
//!
//! The driver is the only code that touches the sender, so exactly one
//! request is ever on the wire.  Callers park on a one-shot reply signal.
//! Every lifecycle rule lives in [`machine::transition`]; the driver turns
//! I/O outcomes into inputs and performs the side effects of each new
//! state (closing the old sender, notifying the event callback, failing
//! queued requests on termination).

pub mod backoff;
pub mod machine;

use core::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, info, warn};

pub use backoff::BackoffPolicy;
pub use machine::{LinkInput, LinkState, transition};

use crate::apdu::{Apdu, ApduResponse};
use crate::command::os::{GetAppAndVersionCommand, is_apdu_that_triggers_disconnection};
use crate::command::{Command, CommandSender, LocalFuture, SendOptions};
use crate::config::SessionConfig;
use crate::error::{ConnectionError, ExchangeError, LinkError};
use crate::sender::DeviceApduSender;
use crate::transport::{Connector, Reachability, Transport};

/// Requests that may wait for the link at once.
pub const QUEUE_DEPTH: usize = 8;

type Cs = CriticalSectionRawMutex;
type ReplySlot = Arc<Signal<Cs, Result<ApduResponse, ConnectionError>>>;

struct Request {
    apdu: Apdu,
    options: SendOptions,
    reply: ReplySlot,
}

impl Request {
    /// The caller dropped its `send_apdu` future while this was queued.
    fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.reply) == 1
    }
}

/// Lifecycle notifications delivered to the `run` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The first link is up.
    Connected { generation: u32 },
    Disconnected { generation: u32 },
    /// A replacement link is up; cached device state may be stale.
    Reconnected { generation: u32 },
    ReconnectAttemptFailed { attempt: u32, error: LinkError },
    Terminated,
}

pub struct DeviceConnection {
    config: SessionConfig,
    backoff: BackoffPolicy,
    state: Mutex<Cs, Cell<LinkState>>,
    queue: Channel<Cs, Request, QUEUE_DEPTH>,
    close: Signal<Cs, ()>,
}

impl DeviceConnection {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(&config),
            config,
            state: Mutex::new(Cell::new(LinkState::Connecting)),
            queue: Channel::new(),
            close: Signal::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state.lock(Cell::get)
    }

    /// Generation of the current (or last) link; `None` once terminated.
    pub fn generation(&self) -> Option<u32> {
        self.state().generation()
    }

    pub async fn send_apdu(&self, apdu: &Apdu) -> Result<ApduResponse, ConnectionError> {
        self.request(apdu, SendOptions::default()).await
    }

    pub async fn send_apdu_with(
        &self,
        apdu: &Apdu,
        options: SendOptions,
    ) -> Result<ApduResponse, ConnectionError> {
        self.request(apdu, options).await
    }

    /// Terminate: interrupts any backoff delay or outstanding exchange.
    pub fn close(&self) {
        if !self.state().is_terminated() {
            info!("connection close requested");
            self.close.signal(());
        }
    }

    async fn request(
        &self,
        apdu: &Apdu,
        options: SendOptions,
    ) -> Result<ApduResponse, ConnectionError> {
        let reply: ReplySlot = Arc::new(Signal::new());
        let request = Request {
            apdu: apdu.clone(),
            options,
            reply: reply.clone(),
        };
        // Checked under the state lock so termination cannot strand the request.
        self.state.lock(|state| {
            if state.get().is_terminated() {
                return Err(ConnectionError::Terminated);
            }
            self.queue
                .try_send(request)
                .map_err(|_| ConnectionError::QueueFull)
        })?;
        reply.wait().await
    }

    // ── Driver ───────────────────────────────────────────────

    /// Drive the link until the connection terminates.
    ///
    /// Must be polled by the host executor alongside the callers of
    /// [`DeviceConnection::send_apdu`]; `events` receives every lifecycle
    /// notification.
    pub async fn run<C: Connector>(
        &self,
        mut connector: C,
        events: &mut dyn FnMut(&ConnectionEvent),
    ) {
        let mut link: Option<DeviceApduSender<C::Transport>> = None;
        let mut failure = ConnectionError::Terminated;

        loop {
            let state = self.state();
            let input = match state {
                LinkState::Terminated => break,
                LinkState::Connecting => {
                    let deadline = Instant::now() + self.config.reconnect_budget();
                    self.establish(&mut connector, deadline, &mut link, events)
                        .await
                }
                LinkState::Disconnected { deadline, .. } => {
                    self.establish(&mut connector, deadline, &mut link, events)
                        .await
                }
                LinkState::Connected { .. } => match link.as_mut() {
                    Some(sender) => self.serve_next(sender).await,
                    None => LinkInput::LinkLost,
                },
                LinkState::AwaitingDisconnection { .. } => match link.as_mut() {
                    Some(sender) => self.check_still_linked(sender).await,
                    None => LinkInput::LinkLost,
                },
            };

            let next = self.apply(input);
            if next.is_terminated() && input != LinkInput::CloseRequested {
                failure = ConnectionError::DisconnectedBeforeSending;
            }
            self.enter(state, next, &mut link, events);
        }

        self.drain(failure);
    }

    fn apply(&self, input: LinkInput) -> LinkState {
        let budget = self.config.reconnect_budget();
        self.state.lock(|cell| {
            let next = transition(cell.get(), input, Instant::now(), budget);
            cell.set(next);
            next
        })
    }

    /// Side effects of entering `next` from `prev`.
    fn enter<T: Transport>(
        &self,
        prev: LinkState,
        next: LinkState,
        link: &mut Option<DeviceApduSender<T>>,
        events: &mut dyn FnMut(&ConnectionEvent),
    ) {
        if prev == next {
            return;
        }
        debug!("link state: {:?} -> {:?}", prev, next);
        match next {
            LinkState::Disconnected { generation, .. } if prev.has_link() => {
                info!("link lost (gen {generation}), reconnecting");
                if let Some(mut sender) = link.take() {
                    sender.close();
                }
                events(&ConnectionEvent::Disconnected { generation });
            }
            LinkState::Connected { generation } if prev == LinkState::Connecting => {
                info!("connected (gen {generation})");
                events(&ConnectionEvent::Connected { generation });
            }
            LinkState::Connected { generation } if !prev.has_link() => {
                info!("reconnected (gen {generation})");
                events(&ConnectionEvent::Reconnected { generation });
            }
            LinkState::Terminated => {
                info!("connection terminated");
                if let Some(mut sender) = link.take() {
                    sender.close();
                }
                events(&ConnectionEvent::Terminated);
            }
            _ => {}
        }
    }

    /// Fail everything still queued.  Runs after the state is `Terminated`,
    /// so nothing can be queued behind it.
    fn drain(&self, failure: ConnectionError) {
        let mut failed = 0;
        while let Ok(request) = self.queue.try_receive() {
            request.reply.signal(Err(failure));
            failed += 1;
        }
        if failed > 0 {
            warn!("failed {failed} queued request(s): {failure}");
        }
    }

    // ── Connected ────────────────────────────────────────────

    async fn serve_next<T: Transport>(&self, sender: &mut DeviceApduSender<T>) -> LinkInput {
        enum Wake {
            Close,
            Request(Request),
            LinkLost,
        }

        let wake = future::or(
            async {
                self.close.wait().await;
                Wake::Close
            },
            future::or(
                async { Wake::Request(self.queue.receive().await) },
                async {
                    sender.wait_link_lost().await;
                    Wake::LinkLost
                },
            ),
        )
        .await;

        match wake {
            Wake::Close => LinkInput::CloseRequested,
            Wake::LinkLost => LinkInput::LinkLost,
            Wake::Request(request) => self.dispatch(sender, request).await,
        }
    }

    /// Put one request on the wire and hand its result back.  The driver
    /// owns the sender for the whole exchange, so a result always belongs
    /// to the link generation the request was sent on.
    async fn dispatch<T: Transport>(
        &self,
        sender: &mut DeviceApduSender<T>,
        request: Request,
    ) -> LinkInput {
        if request.is_abandoned() {
            debug!(
                "skipping abandoned request {:02x} {:02x}",
                request.apdu.cla(),
                request.apdu.ins()
            );
            return LinkInput::ExchangeRejected;
        }

        let timeout = request
            .options
            .timeout
            .unwrap_or_else(|| self.config.apdu_timeout());

        let outcome = future::or(
            async {
                self.close.wait().await;
                None
            },
            async { Some(sender.exchange(&request.apdu, timeout).await) },
        )
        .await;

        let Some(result) = outcome else {
            request.reply.signal(Err(ConnectionError::Terminated));
            return LinkInput::CloseRequested;
        };

        let (reply, input) = match result {
            Ok(response) => {
                let triggers = response.is_success()
                    && (request.options.triggers_disconnection
                        || is_apdu_that_triggers_disconnection(&request.apdu));
                (
                    Ok(response),
                    LinkInput::ExchangeSucceeded {
                        triggers_disconnection: triggers,
                    },
                )
            }
            Err(ExchangeError::Timeout) => {
                warn!("exchange timed out after {:?}", timeout);
                (Err(ConnectionError::Timeout), LinkInput::ExchangeTimedOut)
            }
            Err(e) if e.is_link_failure() => {
                warn!("link failure while sending: {e}");
                (
                    Err(ConnectionError::DisconnectedWhileSending),
                    LinkInput::LinkLost,
                )
            }
            Err(ExchangeError::Protocol(e)) => {
                // Leftover frames of this response must not reach the next
                // exchange, so the link is dropped with them.
                warn!("malformed response ({e}), recycling link");
                (Err(ConnectionError::Protocol(e)), LinkInput::ExchangeCorrupted)
            }
            Err(_) => (Err(ConnectionError::NotReady), LinkInput::ExchangeRejected),
        };

        request.reply.signal(reply);
        input
    }

    // ── Awaiting disconnection ───────────────────────────────

    /// After an app switch the device usually drops the link; ask it who
    /// it is to find out.
    async fn check_still_linked<T: Transport>(
        &self,
        sender: &mut DeviceApduSender<T>,
    ) -> LinkInput {
        let apdu = GetAppAndVersionCommand.apdu();
        let timeout = self.config.apdu_timeout();
        let outcome = future::or(
            async {
                self.close.wait().await;
                None
            },
            async { Some(sender.exchange(&apdu, timeout).await) },
        )
        .await;

        match outcome {
            None => LinkInput::CloseRequested,
            Some(Ok(response)) => {
                debug!("device answered ({}), link kept", response.status);
                LinkInput::StillLinked
            }
            Some(Err(ExchangeError::Timeout)) => LinkInput::ExchangeTimedOut,
            Some(Err(e)) if e.is_link_failure() => LinkInput::LinkLost,
            Some(Err(ExchangeError::Protocol(e))) => {
                warn!("malformed answer after restart ({e}), recycling link");
                LinkInput::ExchangeCorrupted
            }
            Some(Err(e)) => {
                debug!("status check failed ({e}), link kept");
                LinkInput::StillLinked
            }
        }
    }

    // ── Disconnected ─────────────────────────────────────────

    async fn establish<C: Connector>(
        &self,
        connector: &mut C,
        deadline: Instant,
        link: &mut Option<DeviceApduSender<C::Transport>>,
        events: &mut dyn FnMut(&ConnectionEvent),
    ) -> LinkInput {
        enum Outcome<S> {
            Linked(S),
            Expired,
            Closed,
        }

        if let Some(mut stale) = link.take() {
            stale.close();
        }

        let attempts = async {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.attempt(connector).await {
                    Ok(sender) => return Outcome::Linked(sender),
                    Err(error) => {
                        warn!("connection attempt {attempt} failed: {error}");
                        events(&ConnectionEvent::ReconnectAttemptFailed { attempt, error });
                        let delay = BackoffPolicy::clamp(
                            self.backoff.delay_after(attempt, error),
                            Instant::now(),
                            deadline,
                        );
                        Timer::after(delay).await;
                    }
                }
            }
        };

        let outcome = future::or(
            async {
                self.close.wait().await;
                Outcome::Closed
            },
            future::or(attempts, async {
                Timer::after(deadline.saturating_duration_since(Instant::now())).await;
                Outcome::Expired
            }),
        )
        .await;

        match outcome {
            Outcome::Linked(sender) => {
                *link = Some(sender);
                LinkInput::Reconnected
            }
            Outcome::Expired => {
                warn!("reconnection budget exhausted");
                LinkInput::BudgetExpired
            }
            Outcome::Closed => LinkInput::CloseRequested,
        }
    }

    /// One attempt: wait for the device, open, handshake.
    async fn attempt<C: Connector>(
        &self,
        connector: &mut C,
    ) -> Result<DeviceApduSender<C::Transport>, LinkError> {
        if connector.wait_reachable().await == Reachability::Unsupported {
            Timer::after(self.config.reachability_fallback()).await;
        }
        let transport = connector.open().await?;
        let mut sender = DeviceApduSender::new(
            transport,
            connector.profile(),
            connector.handshake(),
            &self.config,
        );
        if let Err(e) = sender.setup().await {
            sender.close();
            return Err(match e {
                ExchangeError::Link(link) => link,
                _ => LinkError::OpenFailed("MTU handshake failed"),
            });
        }
        Ok(sender)
    }
}

impl CommandSender for DeviceConnection {
    fn send_apdu_with<'a>(
        &'a self,
        apdu: &'a Apdu,
        options: SendOptions,
    ) -> LocalFuture<'a, Result<ApduResponse, ConnectionError>> {
        Box::pin(self.request(apdu, options))
    }
}
