use core::convert::Infallible;

use super::OsActionError;
use crate::action::engine::{DeviceAction, Invocation, Node};
use crate::action::state::StepIntermediate;
use crate::command::CommandResult;
use crate::command::os::{AppAndVersion, CloseAppCommand, GetAppAndVersionCommand};

/// Close requests sent before giving up.
pub const MAX_CLOSE_ATTEMPTS: u8 = 2;

/// Leave whatever app is running and return to the dashboard.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoToDashboardAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardState {
    GetApp,
    Route,
    CloseApp,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct DashboardContext {
    app: Option<AppAndVersion>,
    closes: u8,
    error: Option<OsActionError>,
}

pub enum DashboardEvent {
    AppInfo(CommandResult<AppAndVersion, Infallible>),
    Closed(CommandResult<(), Infallible>),
}

impl DeviceAction for GoToDashboardAction {
    type Output = ();
    type Error = OsActionError;
    type Intermediate = StepIntermediate;
    type State = DashboardState;
    type Context = DashboardContext;
    type Event = DashboardEvent;

    fn name(&self) -> &'static str {
        "go to dashboard"
    }

    fn initial(&self) -> (DashboardState, DashboardContext) {
        (DashboardState::GetApp, DashboardContext::default())
    }

    fn enter(&self, state: DashboardState, ctx: &mut DashboardContext) -> Node<Self> {
        match state {
            DashboardState::GetApp => Node::Invoke(Invocation::command(
                GetAppAndVersionCommand,
                DashboardEvent::AppInfo,
            )),
            DashboardState::Route => Node::Decide(route(ctx)),
            DashboardState::CloseApp => {
                Node::Invoke(Invocation::command(CloseAppCommand, DashboardEvent::Closed))
            }
            DashboardState::Done => Node::Success(()),
            DashboardState::Failed => {
                let name = ctx.app.as_ref().map_or_else(String::new, |a| a.name.clone());
                Node::Failure(ctx.error.take().unwrap_or(OsActionError::StillInApp(name)))
            }
        }
    }

    fn on_event(
        &self,
        _: DashboardState,
        event: DashboardEvent,
        ctx: &mut DashboardContext,
    ) -> DashboardState {
        match event {
            DashboardEvent::AppInfo(Ok(app)) => {
                ctx.app = Some(app);
                DashboardState::Route
            }
            DashboardEvent::Closed(Ok(())) => {
                ctx.closes += 1;
                DashboardState::GetApp
            }
            DashboardEvent::AppInfo(Err(e)) | DashboardEvent::Closed(Err(e)) => {
                ctx.error = Some(e.into());
                DashboardState::Failed
            }
        }
    }

    fn intermediate(&self, _: DashboardState, _: &DashboardContext) -> StepIntermediate {
        StepIntermediate::default()
    }
}

fn route(ctx: &DashboardContext) -> DashboardState {
    match &ctx.app {
        Some(app) if app.is_dashboard() => DashboardState::Done,
        Some(_) if ctx.closes < MAX_CLOSE_ATTEMPTS => DashboardState::CloseApp,
        _ => DashboardState::Failed,
    }
}
