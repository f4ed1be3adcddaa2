use core::convert::Infallible;
use core::time::Duration;
use std::time::Instant;

use async_io_mini::Timer;
use log::info;

use super::OsActionError;
use crate::action::engine::{DeviceAction, Env, Invocation, Node};
use crate::action::state::{StepIntermediate, UserInteraction};
use crate::apdu::StatusWord;
use crate::command::os::{AppAndVersion, GetAppAndVersionCommand};
use crate::command::{CommandError, CommandResult};

/// How long a locked device is given to be unlocked.
pub const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between checks while the device is locked.
pub const UNLOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

const DEVICE_LOCKED: StatusWord = StatusWord(0x5515);

/// Read the running app, first waiting for a locked device to be unlocked.
///
/// While locked the action reports [`UserInteraction::UnlockDevice`] and
/// asks again every poll interval until the unlock timeout runs out.
#[derive(Debug, Clone, Copy)]
pub struct GetDeviceStatusAction {
    unlock_timeout: Duration,
    poll_interval: Duration,
}

impl Default for GetDeviceStatusAction {
    fn default() -> Self {
        Self::new(DEFAULT_UNLOCK_TIMEOUT)
    }
}

impl GetDeviceStatusAction {
    pub const fn new(unlock_timeout: Duration) -> Self {
        Self {
            unlock_timeout,
            poll_interval: UNLOCK_POLL_INTERVAL,
        }
    }

    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn unlock_timeout(&self) -> Duration {
        self.unlock_timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatusState {
    GetApp,
    WaitUnlock,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct DeviceStatusContext {
    app: Option<AppAndVersion>,
    locked_since: Option<Instant>,
    error: Option<OsActionError>,
}

pub enum DeviceStatusEvent {
    AppInfo(CommandResult<AppAndVersion, Infallible>),
    Waited,
}

impl DeviceAction for GetDeviceStatusAction {
    type Output = AppAndVersion;
    type Error = OsActionError;
    type Intermediate = StepIntermediate;
    type State = DeviceStatusState;
    type Context = DeviceStatusContext;
    type Event = DeviceStatusEvent;

    fn name(&self) -> &'static str {
        "get device status"
    }

    fn initial(&self) -> (DeviceStatusState, DeviceStatusContext) {
        (DeviceStatusState::GetApp, DeviceStatusContext::default())
    }

    fn enter(&self, state: DeviceStatusState, ctx: &mut DeviceStatusContext) -> Node<Self> {
        match state {
            DeviceStatusState::GetApp => Node::Invoke(Invocation::command(
                GetAppAndVersionCommand,
                DeviceStatusEvent::AppInfo,
            )),
            DeviceStatusState::WaitUnlock => {
                let remaining = ctx
                    .locked_since
                    .map_or(Duration::ZERO, |since| {
                        self.unlock_timeout.saturating_sub(since.elapsed())
                    });
                let delay = self.poll_interval.min(remaining);
                Node::Invoke(Invocation::task(move |_: Env<StepIntermediate>| async move {
                    Timer::after(delay).await;
                    DeviceStatusEvent::Waited
                }))
            }
            DeviceStatusState::Done => match ctx.app.take() {
                Some(app) => Node::Success(app),
                None => Node::Decide(DeviceStatusState::GetApp),
            },
            DeviceStatusState::Failed => {
                Node::Failure(ctx.error.take().unwrap_or(OsActionError::DeviceLocked))
            }
        }
    }

    fn on_event(
        &self,
        _: DeviceStatusState,
        event: DeviceStatusEvent,
        ctx: &mut DeviceStatusContext,
    ) -> DeviceStatusState {
        match event {
            DeviceStatusEvent::AppInfo(Ok(app)) => {
                if ctx.locked_since.take().is_some() {
                    info!("device unlocked");
                }
                ctx.app = Some(app);
                DeviceStatusState::Done
            }
            DeviceStatusEvent::AppInfo(Err(CommandError::UnknownDeviceExchange(DEVICE_LOCKED))) => {
                let since = *ctx.locked_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.unlock_timeout {
                    DeviceStatusState::Failed
                } else {
                    DeviceStatusState::WaitUnlock
                }
            }
            DeviceStatusEvent::AppInfo(Err(e)) => {
                ctx.error = Some(e.into());
                DeviceStatusState::Failed
            }
            DeviceStatusEvent::Waited => DeviceStatusState::GetApp,
        }
    }

    fn intermediate(&self, _: DeviceStatusState, ctx: &DeviceStatusContext) -> StepIntermediate {
        match ctx.locked_since {
            Some(_) => StepIntermediate::new(UserInteraction::UnlockDevice),
            None => StepIntermediate::default(),
        }
    }
}
