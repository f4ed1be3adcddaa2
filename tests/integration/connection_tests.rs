//! Connection behavior against the emulated device: single-flight
//! ordering, reconnection, budget exhaustion and close.

use core::time::Duration;
use std::time::Instant;

use futures_lite::future;

use ledger_session::apdu::{Apdu, ApduResponse, StatusWord};
use ledger_session::command::os::{OpenAppCommand, OpenAppError};
use ledger_session::command::{Command, CommandError, SendOptions, send_command};
use ledger_session::connection::{ConnectionEvent, LinkState};
use ledger_session::config::SessionConfig;
use ledger_session::framing::{FrameProfile, Framer};
use ledger_session::transport::emulator::{JournalEntry, Reply};
use ledger_session::transport::pipe::{DevicePipe, PipeControl};
use ledger_session::{ConnectionError, LinkError};

use crate::mock_link::{
    DeviceModel, MTU, Session, fast_config, model_device, run_session, wait_until,
};

const SLOW: u8 = 0x10;
const ECHO: u8 = 0x11;
const VANISH: u8 = 0xdd;
const SILENT: u8 = 0x77;
const GAPPED: u8 = 0x12;

/// Echoes data; `SLOW` answers late, `VANISH` drops the link (and stops
/// advertising when `stay_away`), `SILENT` never answers.
fn echo_device(
    control: PipeControl,
    stay_away: bool,
    failed_opens: u32,
) -> impl FnMut(&Apdu, &DevicePipe) -> Reply {
    move |apdu: &Apdu, _: &DevicePipe| {
        let echo = ApduResponse::new(StatusWord::SUCCESS, apdu.data().to_vec());
        match apdu.ins() {
            SLOW => Reply::RespondAfter(Duration::from_millis(150), echo),
            VANISH => {
                if stay_away {
                    control.set_reachable(false);
                }
                for _ in 0..failed_opens {
                    control.fail_next_open(LinkError::OpenFailed("pairing refused"));
                }
                Reply::Disconnect
            }
            SILENT => Reply::Ignore,
            GAPPED => Reply::Frames(gapped_response()),
            _ => Reply::Respond(echo),
        }
    }
}

fn ping() -> Apdu {
    Apdu::new(0xe0, ECHO, 0x00, 0x00)
}

/// A four-frame response with its second frame missing.
fn gapped_response() -> Vec<Vec<u8>> {
    let response = ApduResponse::new(StatusWord::SUCCESS, vec![0x5a; 180]);
    let framer = Framer::new(FrameProfile::ble(), usize::from(MTU)).unwrap();
    let mut frames: Vec<Vec<u8>> = framer.frame_message(&response.to_bytes()).unwrap().collect();
    assert_eq!(frames.len(), 4);
    frames.remove(1);
    frames
}

fn echo(data: u8) -> Apdu {
    Apdu::with_data(0xe0, ECHO, 0, 0, &[data]).unwrap()
}

// ── Single flight ─────────────────────────────────────────────

#[test]
fn concurrent_requests_never_overlap_on_the_wire() {
    let finished = run_session(
        fast_config(),
        |control| echo_device(control, false, 0),
        async |s: &Session| {
            let slow = Apdu::new(0xe0, SLOW, 0, 0);
            let long = Apdu::with_data(0xe0, ECHO, 0, 0, &[7; 150]).unwrap();
            let (a, b) = future::zip(
                s.connection.send_apdu(&slow),
                s.connection.send_apdu(&long),
            )
            .await;
            assert!(a.unwrap().is_success());
            assert_eq!(b.unwrap().data, vec![7; 150]);
        },
    );

    let entries = finished.journal.entries();
    let responses: Vec<u32> = entries
        .iter()
        .filter_map(|e| match e {
            JournalEntry::Responded { unread, .. } => Some(*unread),
            _ => None,
        })
        .collect();
    assert_eq!(responses, [0, 0], "host wrote frames before a response was read");

    let order: Vec<u8> = finished.journal.commands().iter().map(Apdu::ins).collect();
    assert_eq!(order, [SLOW, ECHO]);
}

#[test]
fn gapped_response_never_leaks_into_later_requests() {
    let finished = run_session(
        fast_config(),
        |control| echo_device(control, false, 0),
        async |s: &Session| {
            let gapped = Apdu::new(0xe0, GAPPED, 0, 0);
            let (first, (second, third)) = future::zip(
                s.connection.send_apdu(&gapped),
                future::zip(
                    s.connection.send_apdu(&echo(2)),
                    s.connection.send_apdu(&echo(3)),
                ),
            )
            .await;
            (first, second, third)
        },
    );

    let (first, second, third) = finished.value;
    assert!(matches!(first, Err(ConnectionError::Protocol(_))), "{first:?}");
    assert_eq!(second.map(|r| r.data), Ok(vec![2]));
    assert_eq!(third.map(|r| r.data), Ok(vec![3]));
    assert!(finished.events.contains(&ConnectionEvent::Disconnected { generation: 1 }));
    assert!(finished.events.contains(&ConnectionEvent::Reconnected { generation: 2 }));
}

#[test]
fn dropped_request_is_never_sent() {
    let finished = run_session(
        fast_config(),
        |control| echo_device(control, false, 0),
        async |s: &Session| {
            let slow = Apdu::new(0xe0, SLOW, 0, 0);
            let open = OpenAppCommand::new("Bitcoin").unwrap().apdu();
            let (slow_reply, ping_reply) = future::zip(s.connection.send_apdu(&slow), async {
                // Queued behind the slow exchange, then given up on.
                let mut dropped = Box::pin(s.connection.send_apdu(&open));
                assert!(future::poll_once(&mut dropped).await.is_none());
                drop(dropped);
                s.connection.send_apdu(&ping()).await
            })
            .await;
            assert!(slow_reply.unwrap().is_success());
            assert!(ping_reply.unwrap().is_success());
        },
    );

    let order: Vec<u8> = finished.journal.commands().iter().map(Apdu::ins).collect();
    assert_eq!(order, [SLOW, ECHO]);
    assert!(!finished.events.contains(&ConnectionEvent::Disconnected { generation: 1 }));
}

// ── Command scenarios ─────────────────────────────────────────

#[test]
fn open_app_success_has_no_payload() {
    let model = DeviceModel::on_dashboard(&["Bitcoin"]);
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let open = OpenAppCommand::new("Bitcoin").unwrap();
            assert_eq!(send_command(&*s.connection, &open).await, Ok(()));
            // The device restarts its link after switching apps.
            assert!(wait_until(|| s.connection.generation() == Some(2), Duration::from_secs(2)).await);
        },
    );
    assert_eq!(model.borrow().running, "Bitcoin");
    assert!(finished.events.contains(&ConnectionEvent::Reconnected { generation: 2 }));
}

#[test]
fn unknown_app_is_a_typed_error() {
    let model = DeviceModel::on_dashboard(&[]);
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let open = OpenAppCommand::new("Bitcoin").unwrap();
            send_command(&*s.connection, &open).await
        },
    );
    assert_eq!(
        finished.value,
        Err(CommandError::Device(OpenAppError::UnknownApplicationName))
    );
    assert!(!finished.events.contains(&ConnectionEvent::Disconnected { generation: 1 }));
}

// ── Reconnection ──────────────────────────────────────────────

#[test]
fn link_loss_fails_in_flight_request_then_reconnects() {
    let finished = run_session(
        fast_config(),
        |control| echo_device(control, false, 0),
        async |s: &Session| {
            let vanish = Apdu::new(0xe0, VANISH, 0, 0);
            assert_eq!(
                s.connection.send_apdu(&vanish).await,
                Err(ConnectionError::DisconnectedWhileSending)
            );
            assert!(s.connection.send_apdu(&ping()).await.unwrap().is_success());
            assert_eq!(s.connection.generation(), Some(2));
        },
    );
    assert_eq!(
        finished.events,
        [
            ConnectionEvent::Connected { generation: 1 },
            ConnectionEvent::Disconnected { generation: 1 },
            ConnectionEvent::Reconnected { generation: 2 },
            ConnectionEvent::Terminated,
        ]
    );
}

#[test]
fn exchange_timeout_recycles_the_link() {
    let finished = run_session(
        fast_config(),
        |control| echo_device(control, false, 0),
        async |s: &Session| {
            let options = SendOptions {
                timeout: Some(Duration::from_millis(100)),
                ..SendOptions::default()
            };
            let silent = Apdu::new(0xe0, SILENT, 0, 0);
            assert_eq!(
                s.connection.send_apdu_with(&silent, options).await,
                Err(ConnectionError::Timeout)
            );
            assert!(s.connection.send_apdu(&ping()).await.is_ok());
        },
    );
    assert!(finished.events.contains(&ConnectionEvent::Disconnected { generation: 1 }));
    assert!(finished.events.contains(&ConnectionEvent::Reconnected { generation: 2 }));
}

#[test]
fn unreachable_device_terminates_within_budget() {
    let config = SessionConfig {
        reconnect_budget_ms: 300,
        ..fast_config()
    };
    let budget = config.reconnect_budget();
    run_session(
        config,
        |control| echo_device(control, true, 0),
        async |s: &Session| {
            let vanish = Apdu::new(0xe0, VANISH, 0, 0);
            assert_eq!(
                s.connection.send_apdu(&vanish).await,
                Err(ConnectionError::DisconnectedWhileSending)
            );

            // Queued while disconnected: fails once, when the budget runs out.
            assert_eq!(
                s.connection.send_apdu(&ping()).await,
                Err(ConnectionError::DisconnectedBeforeSending)
            );
            assert_eq!(s.connection.state(), LinkState::Terminated);

            let lost = s.event_time(ConnectionEvent::Disconnected { generation: 1 }).unwrap();
            let ended = s.event_time(ConnectionEvent::Terminated).unwrap();
            assert!(ended.duration_since(lost) <= budget + Duration::from_millis(200));

            assert_eq!(
                s.connection.send_apdu(&ping()).await,
                Err(ConnectionError::Terminated)
            );
        },
    );
}

#[test]
fn close_interrupts_reconnection_backoff() {
    let config = SessionConfig {
        reconnect_budget_ms: 20_000,
        reconnect_delay_ms: 5_000,
        out_of_range_delay_ms: 5_000,
        ..fast_config()
    };
    run_session(
        config,
        |control| echo_device(control, false, 10),
        async |s: &Session| {
            let vanish = Apdu::new(0xe0, VANISH, 0, 0);
            let _ = s.connection.send_apdu(&vanish).await;
            let failed = || {
                s.events()
                    .iter()
                    .any(|e| matches!(e, ConnectionEvent::ReconnectAttemptFailed { .. }))
            };
            assert!(wait_until(failed, Duration::from_secs(2)).await);

            let closing = Instant::now();
            s.connection.close();
            let terminated = || s.connection.state() == LinkState::Terminated;
            assert!(wait_until(terminated, Duration::from_secs(1)).await);
            assert!(closing.elapsed() < Duration::from_millis(500));
        },
    );
}
