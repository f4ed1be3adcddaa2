//! Emulated device session for integration tests.
//!
//! Runs the emulator, the connection driver and the test body on one
//! `edge_executor::LocalExecutor`, the same way the demo binary does.

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;
use std::time::Instant;

use async_io_mini::Timer;
use edge_executor::LocalExecutor;
use futures_lite::future;

use ledger_session::apdu::{Apdu, ApduResponse, StatusWord};
use ledger_session::command::os::{AppAndVersion, DASHBOARD_APP_NAME};
use ledger_session::config::SessionConfig;
use ledger_session::connection::{ConnectionEvent, DeviceConnection};
use ledger_session::framing::FrameProfile;
use ledger_session::transport::Handshake;
use ledger_session::transport::emulator::{DeviceEmulator, DeviceHandler, Journal, Reply};
use ledger_session::transport::pipe::{DevicePipe, PipeConnector, PipeControl};

pub const MTU: u8 = 64;

/// Test-only install command: `E0 0B <chunk> <chunks> <app name>`.
pub const INS_INSTALL_CHUNK: u8 = 0x0b;

/// Short timings so reconnection tests finish quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        apdu_timeout_ms: 2_000,
        frame_retry_delay_ms: 5,
        reconnect_budget_ms: 1_000,
        reconnect_delay_ms: 20,
        out_of_range_delay_ms: 50,
        reachability_fallback_ms: 10,
        ..SessionConfig::default()
    }
}

// ── Session harness ───────────────────────────────────────────

pub type EventLog = Rc<RefCell<Vec<(Instant, ConnectionEvent)>>>;

pub struct Session {
    pub connection: Rc<DeviceConnection>,
    pub control: PipeControl,
    pub journal: Journal,
    pub events: EventLog,
}

#[allow(dead_code)]
impl Session {
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.borrow().iter().map(|(_, e)| *e).collect()
    }

    /// When `wanted` was first reported.
    pub fn event_time(&self, wanted: ConnectionEvent) -> Option<Instant> {
        self.events
            .borrow()
            .iter()
            .find(|(_, e)| *e == wanted)
            .map(|(at, _)| *at)
    }
}

pub struct Finished<T> {
    pub value: T,
    pub events: Vec<ConnectionEvent>,
    pub journal: Journal,
}

/// Run `body` against a connected emulated device, then close the
/// connection and wait for its driver to finish.
pub fn run_session<H, M, F, T>(config: SessionConfig, make_handler: M, body: F) -> Finished<T>
where
    H: DeviceHandler + 'static,
    M: FnOnce(PipeControl) -> H,
    F: AsyncFnOnce(&Session) -> T,
{
    let profile = FrameProfile::ble();
    let (connector, listener) = PipeConnector::new(profile, Handshake::Negotiate);
    let control = connector.control();
    let mut device = DeviceEmulator::new(listener, profile, MTU, make_handler(control.clone()));
    let session = Session {
        connection: Rc::new(DeviceConnection::new(config)),
        control,
        journal: device.journal(),
        events: EventLog::default(),
    };

    let executor: LocalExecutor<'_, 8> = LocalExecutor::new();
    executor.spawn(async move { device.run().await }).detach();

    let conn = session.connection.clone();
    let sink = session.events.clone();
    let driver = executor.spawn(async move {
        conn.run(connector, &mut |e| sink.borrow_mut().push((Instant::now(), *e)))
            .await;
    });

    let value = future::block_on(executor.run(async {
        let value = body(&session).await;
        session.connection.close();
        driver.await;
        value
    }));

    Finished {
        value,
        events: session.events(),
        journal: session.journal.clone(),
    }
}

/// Poll `cond` every few milliseconds; `false` if it never held within
/// `limit`.
#[allow(dead_code)]
pub async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > limit {
            return false;
        }
        Timer::after(Duration::from_millis(5)).await;
    }
    true
}

// ── Device model ──────────────────────────────────────────────

/// What the emulated device knows; shared with the test body.
#[derive(Debug)]
pub struct DeviceModel {
    pub running: String,
    pub installed: Vec<String>,
    /// Drop the link the first time this (app, chunk) arrives.
    pub drop_install_at: Option<(String, u8)>,
    /// Stop advertising when dropping the link.
    pub stay_away: bool,
    /// Answer open-app only after this long, without restarting the link.
    pub confirm_delay: Option<Duration>,
}

#[allow(dead_code)]
impl DeviceModel {
    pub fn running(app: &str, installed: &[&str]) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            running: app.to_owned(),
            installed: installed.iter().map(|s| (*s).to_owned()).collect(),
            drop_install_at: None,
            stay_away: false,
            confirm_delay: None,
        }))
    }

    pub fn on_dashboard(installed: &[&str]) -> Rc<RefCell<Self>> {
        Self::running(DASHBOARD_APP_NAME, installed)
    }
}

fn status(sw: u16) -> ApduResponse {
    ApduResponse::new(StatusWord(sw), Vec::new())
}

/// Handler answering dashboard and install commands from `model`.
pub fn model_device(
    model: Rc<RefCell<DeviceModel>>,
    control: PipeControl,
) -> impl FnMut(&Apdu, &DevicePipe) -> Reply {
    move |apdu: &Apdu, _: &DevicePipe| {
        let mut m = model.borrow_mut();
        let name = String::from_utf8_lossy(apdu.data()).into_owned();
        match (apdu.cla(), apdu.ins()) {
            (0xb0, 0x01) => {
                let info = AppAndVersion {
                    name: m.running.clone(),
                    version: "1.0.0".into(),
                    flags: None,
                };
                Reply::Respond(ApduResponse::new(StatusWord::SUCCESS, info.encode()))
            }
            (0xb0, 0xa7) => {
                m.running = DASHBOARD_APP_NAME.into();
                Reply::RespondThenDisconnect(ApduResponse::success())
            }
            (0xe0, 0xd8) if !m.installed.contains(&name) => Reply::Respond(status(0x6807)),
            (0xe0, 0xd8) => {
                m.running = name;
                match m.confirm_delay {
                    Some(delay) => Reply::RespondAfter(delay, ApduResponse::success()),
                    None => Reply::RespondThenDisconnect(ApduResponse::success()),
                }
            }
            (0xe0, INS_INSTALL_CHUNK) => {
                let chunk = apdu.p1();
                if m.drop_install_at.as_ref() == Some(&(name.clone(), chunk)) {
                    m.drop_install_at = None;
                    if m.stay_away {
                        control.set_reachable(false);
                    }
                    return Reply::Disconnect;
                }
                if chunk.checked_add(1) == Some(apdu.p2()) && !m.installed.contains(&name) {
                    m.installed.push(name);
                }
                Reply::Respond(ApduResponse::success())
            }
            _ => Reply::Respond(status(0x6d00)),
        }
    }
}
