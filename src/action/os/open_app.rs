use core::time::Duration;

use log::warn;

use super::{GetDeviceStatusAction, GoToDashboardAction, OsActionError};
use crate::action::engine::{DeviceAction, Invocation, Node, Outcome};
use crate::action::state::{StepIntermediate, UserInteraction};
use crate::command::os::{AppAndVersion, OpenAppCommand, OpenAppError};
use crate::command::{CommandError, CommandResult};
use crate::error::{BuildError, ConnectionError};

/// Make sure `name` is the running app, going through the dashboard if
/// another app is open.
///
/// A locked device is first given the unlock timeout to be unlocked.  If
/// the link drops before the open request is answered, the running app is
/// read again, since the device may have switched before dropping it.
#[derive(Debug, Clone)]
pub struct OpenAppAction {
    command: OpenAppCommand,
    status: GetDeviceStatusAction,
}

impl OpenAppAction {
    pub fn new(name: &str) -> Result<Self, BuildError> {
        Ok(Self {
            command: OpenAppCommand::new(name)?,
            status: GetDeviceStatusAction::default(),
        })
    }

    pub fn with_unlock_timeout(mut self, unlock_timeout: Duration) -> Self {
        self.status = GetDeviceStatusAction::new(unlock_timeout);
        self
    }

    #[cfg(test)]
    fn with_status(mut self, status: GetDeviceStatusAction) -> Self {
        self.status = status;
        self
    }

    pub fn app_name(&self) -> &str {
        self.command.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAppState {
    GetApp,
    Route,
    GoToDashboard,
    OpenApp,
    Done,
    Failed,
    Stopped,
}

#[derive(Debug, Default)]
pub struct OpenAppContext {
    app: Option<AppAndVersion>,
    /// The link already dropped once while opening.
    rechecked: bool,
    error: Option<OsActionError>,
}

pub enum OpenAppEvent {
    Status(Outcome<AppAndVersion, OsActionError>),
    Dashboard(Outcome<(), OsActionError>),
    Opened(CommandResult<(), OpenAppError>),
}

impl DeviceAction for OpenAppAction {
    type Output = ();
    type Error = OsActionError;
    type Intermediate = StepIntermediate;
    type State = OpenAppState;
    type Context = OpenAppContext;
    type Event = OpenAppEvent;

    fn name(&self) -> &'static str {
        "open app"
    }

    fn initial(&self) -> (OpenAppState, OpenAppContext) {
        (OpenAppState::GetApp, OpenAppContext::default())
    }

    fn enter(&self, state: OpenAppState, ctx: &mut OpenAppContext) -> Node<Self> {
        match state {
            OpenAppState::GetApp => Node::Invoke(Invocation::sub_action(
                self.status,
                |i| i,
                OpenAppEvent::Status,
            )),
            OpenAppState::Route => Node::Decide(match &ctx.app {
                Some(app) if app.name == self.app_name() => OpenAppState::Done,
                Some(app) if app.is_dashboard() => OpenAppState::OpenApp,
                Some(_) => OpenAppState::GoToDashboard,
                None => OpenAppState::GetApp,
            }),
            OpenAppState::GoToDashboard => Node::Invoke(Invocation::sub_action(
                GoToDashboardAction,
                |i| i,
                OpenAppEvent::Dashboard,
            )),
            OpenAppState::OpenApp => Node::Invoke(Invocation::command(
                self.command.clone(),
                OpenAppEvent::Opened,
            )),
            OpenAppState::Done => Node::Success(()),
            OpenAppState::Failed => match ctx.error.take() {
                Some(e) => Node::Failure(e),
                None => Node::Stopped,
            },
            OpenAppState::Stopped => Node::Stopped,
        }
    }

    fn on_event(
        &self,
        _: OpenAppState,
        event: OpenAppEvent,
        ctx: &mut OpenAppContext,
    ) -> OpenAppState {
        match event {
            OpenAppEvent::Status(Outcome::Completed(app)) => {
                ctx.app = Some(app);
                OpenAppState::Route
            }
            OpenAppEvent::Status(Outcome::Error(e)) => {
                ctx.error = Some(e);
                OpenAppState::Failed
            }
            OpenAppEvent::Status(Outcome::Stopped) => OpenAppState::Stopped,
            OpenAppEvent::Dashboard(Outcome::Completed(())) => OpenAppState::OpenApp,
            OpenAppEvent::Dashboard(Outcome::Error(e)) => {
                ctx.error = Some(e);
                OpenAppState::Failed
            }
            OpenAppEvent::Dashboard(Outcome::Stopped) => OpenAppState::Stopped,
            OpenAppEvent::Opened(Ok(())) => OpenAppState::Done,
            OpenAppEvent::Opened(Err(CommandError::Connection(
                ConnectionError::DisconnectedWhileSending,
            ))) if !ctx.rechecked => {
                warn!("link dropped while opening {}, checking the device", self.app_name());
                ctx.rechecked = true;
                ctx.app = None;
                OpenAppState::GetApp
            }
            OpenAppEvent::Opened(Err(e)) => {
                ctx.error = Some(e.into());
                OpenAppState::Failed
            }
        }
    }

    fn intermediate(&self, state: OpenAppState, _: &OpenAppContext) -> StepIntermediate {
        match state {
            OpenAppState::OpenApp => StepIntermediate::new(UserInteraction::ConfirmOpenApp),
            _ => StepIntermediate::default(),
        }
    }
}
