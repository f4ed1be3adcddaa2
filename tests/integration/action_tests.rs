//! Device actions over a live connection: app switching, typed failures,
//! cancellation and a multi-app install that survives a link drop.

use core::convert::Infallible;
use core::time::Duration;
use std::rc::Rc;

use futures_lite::{StreamExt, future};

use ledger_session::ConnectionError;
use ledger_session::action::os::{GoToDashboardAction, OpenAppAction, OsActionError};
use ledger_session::action::{
    DeviceAction, DeviceActionState, Env, Intermediate, Invocation, Node, Outcome, StepIntermediate,
    UserInteraction, execute,
};
use ledger_session::apdu::{Apdu, ApduBuilder, ApduResponse};
use ledger_session::command::os::{DASHBOARD_APP_NAME, OpenAppError};
use ledger_session::command::{
    Command, CommandError, CommandResult, CommandSender, check_status, send_command,
};
use ledger_session::connection::ConnectionEvent;
use ledger_session::transport::emulator::Reply;
use ledger_session::transport::pipe::{DevicePipe, PipeControl};

use crate::mock_link::{
    DeviceModel, INS_INSTALL_CHUNK, Session, fast_config, model_device, run_session, wait_until,
};

fn sender(s: &Session) -> Rc<dyn CommandSender> {
    s.connection.clone()
}

// ── Open app ──────────────────────────────────────────────────

#[test]
fn open_app_switches_through_the_dashboard() {
    let model = DeviceModel::running("Ethereum", &["Bitcoin"]);
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let (handle, run) = execute(OpenAppAction::new("Bitcoin").unwrap(), sender(s));
            run.await;
            handle.finished().await
        },
    );
    assert_eq!(finished.value, DeviceActionState::Completed(()));
    assert_eq!(model.borrow().running, "Bitcoin");
    // Closing Ethereum restarts the link.
    assert!(finished.events.contains(&ConnectionEvent::Reconnected { generation: 2 }));
}

#[test]
fn missing_app_fails_with_typed_error() {
    let model = DeviceModel::on_dashboard(&[]);
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let (handle, run) = execute(OpenAppAction::new("Bitcoin").unwrap(), sender(s));
            run.await;
            handle.finished().await
        },
    );
    assert_eq!(
        finished.value,
        DeviceActionState::Error(OsActionError::OpenApp(OpenAppError::UnknownApplicationName))
    );
}

#[test]
fn cancel_while_waiting_for_confirmation() {
    let model = DeviceModel::on_dashboard(&["Bitcoin"]);
    model.borrow_mut().confirm_delay = Some(Duration::from_millis(500));
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let (handle, run) = execute(OpenAppAction::new("Bitcoin").unwrap(), sender(s));
            let states = handle.subscribe();
            let confirming = || handle.latest().required_interaction() == UserInteraction::ConfirmOpenApp;
            let ((), seen) = future::zip(run, async {
                let seen = wait_until(confirming, Duration::from_secs(2)).await;
                handle.cancel();
                seen
            })
            .await;
            assert!(seen, "never asked for confirmation");
            states.collect::<Vec<_>>().await
        },
    );

    let states = finished.value;
    let terminals: Vec<_> = states.iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(terminals, [&DeviceActionState::Stopped]);
    assert_eq!(states.last(), Some(&DeviceActionState::Stopped));
}

const INS_SLOW: u8 = 0x10;

/// `model_device`, but app info takes 100 ms and `INS_SLOW` takes 200 ms.
fn sluggish_device(
    model: Rc<core::cell::RefCell<DeviceModel>>,
    control: PipeControl,
) -> impl FnMut(&Apdu, &DevicePipe) -> Reply {
    let mut inner = model_device(model, control);
    move |apdu: &Apdu, link: &DevicePipe| match (apdu.ins(), inner(apdu, link)) {
        (INS_SLOW, _) => Reply::RespondAfter(Duration::from_millis(200), ApduResponse::success()),
        (0x01, Reply::Respond(info)) => Reply::RespondAfter(Duration::from_millis(100), info),
        (_, reply) => reply,
    }
}

#[test]
fn cancelled_open_never_reaches_the_device() {
    let model = DeviceModel::on_dashboard(&["Bitcoin"]);
    let finished = run_session(
        fast_config(),
        |control| sluggish_device(model.clone(), control),
        async |s: &Session| {
            let (handle, run) = execute(OpenAppAction::new("Bitcoin").unwrap(), sender(s));
            let slow = Apdu::new(0xe0, INS_SLOW, 0, 0);
            let asked_for_app = || s.journal.commands().iter().any(|a| a.ins() == 0x01);
            let confirming = || handle.latest().required_interaction() == UserInteraction::ConfirmOpenApp;

            let ((), (slow_reply, seen)) = future::zip(run, async {
                assert!(wait_until(asked_for_app, Duration::from_secs(2)).await);
                // Occupies the link while the open request waits in the queue.
                future::zip(s.connection.send_apdu(&slow), async {
                    let seen = wait_until(confirming, Duration::from_secs(2)).await;
                    handle.cancel();
                    seen
                })
                .await
            })
            .await;
            assert!(seen, "never asked for confirmation");
            assert!(slow_reply.unwrap().is_success());
            // Give the driver a chance to pick up the abandoned request.
            s.connection.send_apdu(&Apdu::new(0xb0, 0x01, 0, 0)).await.unwrap();
            handle.latest()
        },
    );

    assert_eq!(finished.value, DeviceActionState::Stopped);
    let order: Vec<u8> = finished.journal.commands().iter().map(Apdu::ins).collect();
    assert_eq!(order, [0x01, INS_SLOW, 0x01]);
    assert_eq!(model.borrow().running, DASHBOARD_APP_NAME);
}

// ── Multi-app install ─────────────────────────────────────────

const CHUNKS: u8 = 4;

/// One chunk of an app image: `E0 0B <chunk> <chunks> <name>`.
struct InstallChunk(Apdu);

impl InstallChunk {
    fn new(name: &str, chunk: u8) -> Self {
        let apdu = ApduBuilder::new(0xe0, INS_INSTALL_CHUNK, chunk, CHUNKS)
            .add_ascii(name)
            .build()
            .unwrap();
        Self(apdu)
    }
}

impl Command for InstallChunk {
    type Response = ();
    type Error = Infallible;

    fn apdu(&self) -> Apdu {
        self.0.clone()
    }

    fn parse(&self, response: &ApduResponse) -> CommandResult<(), Infallible> {
        check_status(response)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InstallProgress {
    interaction: UserInteraction,
    app: usize,
    percent: u8,
}

impl Intermediate for InstallProgress {
    fn required_interaction(&self) -> UserInteraction {
        self.interaction
    }
}

fn progress(app: usize, chunks_done: u8) -> InstallProgress {
    InstallProgress {
        interaction: UserInteraction::None,
        app,
        percent: (u16::from(chunks_done) * 100 / u16::from(CHUNKS)) as u8,
    }
}

/// Go to the dashboard, then stream every app chunk by chunk.  A chunk
/// lost to a link drop is resent once.  Progress is reported as each
/// chunk is acknowledged.
struct InstallAppsAction {
    apps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallState {
    GoToDashboard,
    Install,
    Done,
    Failed,
    Stopped,
}

#[derive(Default)]
struct InstallContext {
    app: usize,
    chunk: u8,
    resent: bool,
    error: Option<OsActionError>,
}

enum InstallEvent {
    Dashboard(Outcome<(), OsActionError>),
    Chunk(CommandResult<(), Infallible>),
}

impl DeviceAction for InstallAppsAction {
    type Output = usize;
    type Error = OsActionError;
    type Intermediate = InstallProgress;
    type State = InstallState;
    type Context = InstallContext;
    type Event = InstallEvent;

    fn name(&self) -> &'static str {
        "install apps"
    }

    fn initial(&self) -> (InstallState, InstallContext) {
        (InstallState::GoToDashboard, InstallContext::default())
    }

    fn enter(&self, state: InstallState, ctx: &mut InstallContext) -> Node<Self> {
        match state {
            InstallState::GoToDashboard => Node::Invoke(Invocation::sub_action(
                GoToDashboardAction,
                |i: StepIntermediate| InstallProgress {
                    interaction: i.required_interaction,
                    ..InstallProgress::default()
                },
                InstallEvent::Dashboard,
            )),
            InstallState::Install => match self.apps.get(ctx.app) {
                Some(name) => {
                    let (app, chunk) = (ctx.app, ctx.chunk);
                    let command = InstallChunk::new(name, chunk);
                    Node::Invoke(Invocation::task(move |env: Env<InstallProgress>| async move {
                        let result = send_command(env.sender(), &command).await;
                        if result.is_ok() {
                            env.report(progress(app, chunk + 1));
                        }
                        InstallEvent::Chunk(result)
                    }))
                }
                None => Node::Decide(InstallState::Done),
            },
            InstallState::Done => Node::Success(self.apps.len()),
            InstallState::Failed => match ctx.error.take() {
                Some(e) => Node::Failure(e),
                None => Node::Stopped,
            },
            InstallState::Stopped => Node::Stopped,
        }
    }

    fn on_event(
        &self,
        _: InstallState,
        event: InstallEvent,
        ctx: &mut InstallContext,
    ) -> InstallState {
        match event {
            InstallEvent::Dashboard(Outcome::Completed(())) => InstallState::Install,
            InstallEvent::Dashboard(Outcome::Error(e)) => {
                ctx.error = Some(e);
                InstallState::Failed
            }
            InstallEvent::Dashboard(Outcome::Stopped) => InstallState::Stopped,
            InstallEvent::Chunk(Ok(())) => {
                ctx.resent = false;
                ctx.chunk += 1;
                if ctx.chunk == CHUNKS {
                    ctx.chunk = 0;
                    ctx.app += 1;
                }
                InstallState::Install
            }
            InstallEvent::Chunk(Err(CommandError::Connection(
                ConnectionError::DisconnectedWhileSending,
            ))) if !ctx.resent => {
                ctx.resent = true;
                InstallState::Install
            }
            InstallEvent::Chunk(Err(e)) => {
                ctx.error = Some(e.into());
                InstallState::Failed
            }
        }
    }

    fn intermediate(&self, _: InstallState, ctx: &InstallContext) -> InstallProgress {
        progress(ctx.app, ctx.chunk)
    }
}

type InstallStates = Vec<DeviceActionState<usize, OsActionError, InstallProgress>>;

fn install(model: &Rc<core::cell::RefCell<DeviceModel>>) -> InstallStates {
    let finished = run_session(
        fast_config(),
        |control| model_device(model.clone(), control),
        async |s: &Session| {
            let action = InstallAppsAction {
                apps: vec!["A".into(), "B".into()],
            };
            let (handle, run) = execute(action, sender(s));
            let states = handle.subscribe();
            run.await;
            states.collect::<Vec<_>>().await
        },
    );
    finished.value
}

#[test]
fn install_resumes_after_a_dropped_chunk() {
    let model = DeviceModel::running("Ethereum", &[]);
    model.borrow_mut().drop_install_at = Some(("A".into(), 2));

    let states = install(&model);
    assert_eq!(states.last(), Some(&DeviceActionState::Completed(2)));
    assert_eq!(model.borrow().installed, ["A", "B"]);

    let progress: Vec<(usize, u8)> = states
        .iter()
        .filter_map(|s| s.intermediate())
        .map(|p| (p.app, p.percent))
        .collect();
    assert!(progress.contains(&(0, 50)));
    assert!(progress.contains(&(1, 100)));
}

#[test]
fn install_fails_when_the_device_stays_away() {
    let model = DeviceModel::on_dashboard(&[]);
    {
        let mut m = model.borrow_mut();
        m.drop_install_at = Some(("A".into(), 2));
        m.stay_away = true;
    }

    let states = install(&model);
    assert!(!states.iter().any(|s| matches!(s, DeviceActionState::Completed(_))));
    assert_eq!(
        states.last(),
        Some(&DeviceActionState::Error(OsActionError::Connection(
            ConnectionError::DisconnectedBeforeSending
        )))
    );
    assert!(model.borrow().installed.len() < 2);
}
