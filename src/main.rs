//! Device session demo.
//!
//! Opens the Bitcoin app on an emulated device that starts in another app,
//! over the in-memory pipe transport.  Pass a JSON `SessionConfig` path as
//! the first argument to override the timing defaults.
//!
//! ```text
//!  ┌──────────────────── edge_executor::LocalExecutor ────────────────────┐
//!  │                                                                      │
//!  │  OpenAppAction ──► DeviceConnection::run ──► PipeTransport ──► DeviceEmulator
//!  │       │                                                              │
//!  │       └── state watcher (logs Pending / terminal states)             │
//!  └──────────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use core::time::Duration;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use edge_executor::LocalExecutor;
use futures_lite::StreamExt;
use log::{LevelFilter, info, warn};

use ledger_session::action::os::OpenAppAction;
use ledger_session::action::{DeviceActionState, UserInteraction, execute};
use ledger_session::apdu::{Apdu, ApduResponse, StatusWord};
use ledger_session::command::os::{AppAndVersion, DASHBOARD_APP_NAME};
use ledger_session::config::SessionConfig;
use ledger_session::connection::DeviceConnection;
use ledger_session::framing::FrameProfile;
use ledger_session::transport::Handshake;
use ledger_session::transport::emulator::{DeviceEmulator, Reply};
use ledger_session::transport::pipe::{DevicePipe, PipeConnector};

const TARGET_APP: &str = "Bitcoin";
const DEVICE_MTU: u8 = 156;

/// Emulated device: starts in Ethereum, restarts its link on app switches.
fn demo_device() -> impl FnMut(&Apdu, &DevicePipe) -> Reply {
    let mut running = String::from("Ethereum");
    move |apdu: &Apdu, _: &DevicePipe| match (apdu.cla(), apdu.ins()) {
        (0xb0, 0x01) => {
            let info = AppAndVersion {
                name: running.clone(),
                version: "1.3.0".into(),
                flags: None,
            };
            Reply::Respond(ApduResponse::new(StatusWord::SUCCESS, info.encode()))
        }
        (0xb0, 0xa7) => {
            running = DASHBOARD_APP_NAME.into();
            Reply::RespondThenDisconnect(ApduResponse::success())
        }
        (0xe0, 0xd8) => {
            running = String::from_utf8_lossy(apdu.data()).into_owned();
            Reply::RespondThenDisconnect(ApduResponse::success())
        }
        _ => Reply::Respond(ApduResponse::new(StatusWord(0x6d00), Vec::new())),
    }
}

fn load_config() -> Result<SessionConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            SessionConfig::from_json(&json)?
        }
        None => SessionConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Debug)
        .init()?;

    info!("ledger-session demo v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config()?;

    // ── Emulated device + connection ─────────────────────────
    let profile = FrameProfile::ble();
    let (connector, listener) = PipeConnector::new(profile, Handshake::Negotiate);
    let mut device = DeviceEmulator::new(listener, profile, DEVICE_MTU, demo_device());
    let connection = Rc::new(DeviceConnection::new(config));

    // ── Action ───────────────────────────────────────────────
    let action = OpenAppAction::new(TARGET_APP).map_err(ledger_session::Error::from)?;
    let (handle, run) = execute(action, connection.clone());

    let executor: LocalExecutor<'_, 8> = LocalExecutor::new();
    executor.spawn(async move { device.run().await }).detach();

    let driver = connection.clone();
    executor
        .spawn(async move {
            driver
                .run(connector, &mut |event| info!("connection: {:?}", event))
                .await;
        })
        .detach();

    let watcher = handle.clone();
    executor
        .spawn(async move {
            let mut states = watcher.subscribe();
            while let Some(state) = states.next().await {
                match state.required_interaction() {
                    UserInteraction::None => info!("action: {:?}", state),
                    interaction => info!("action: waiting for user ({interaction})"),
                }
            }
        })
        .detach();

    let outcome = futures_lite::future::block_on(executor.run(async {
        run.await;
        let outcome = handle.finished().await;
        connection.close();
        // Let the driver fail anything still queued before the executor stops.
        async_io_mini::Timer::after(Duration::from_millis(10)).await;
        outcome
    }));

    match outcome {
        DeviceActionState::Completed(()) => {
            info!("{TARGET_APP} is open");
            Ok(())
        }
        DeviceActionState::Error(e) => bail!("opening {TARGET_APP} failed: {e}"),
        other => {
            warn!("action ended as {:?}", other);
            Ok(())
        }
    }
}
