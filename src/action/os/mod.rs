//! Dashboard workflows built on the engine.

mod dashboard;
mod device_status;
mod open_app;

use core::convert::Infallible;
use core::fmt;

pub use dashboard::{
    DashboardContext, DashboardEvent, DashboardState, GoToDashboardAction, MAX_CLOSE_ATTEMPTS,
};
pub use device_status::{
    DEFAULT_UNLOCK_TIMEOUT, DeviceStatusContext, DeviceStatusEvent, DeviceStatusState,
    GetDeviceStatusAction, UNLOCK_POLL_INTERVAL,
};
pub use open_app::{OpenAppAction, OpenAppContext, OpenAppEvent, OpenAppState};

use crate::apdu::StatusWord;
use crate::command::CommandError;
use crate::command::os::OpenAppError;
use crate::error::{ConnectionError, MissingField};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsActionError {
    OpenApp(OpenAppError),
    UnknownDeviceExchange(StatusWord),
    InvalidResponse(MissingField),
    Connection(ConnectionError),
    /// The named app kept running after repeated close requests.
    StillInApp(String),
    /// The device stayed locked for the whole unlock timeout.
    DeviceLocked,
}

impl fmt::Display for OsActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenApp(e) => write!(f, "open app: {e}"),
            Self::UnknownDeviceExchange(sw) => write!(f, "unknown device exchange error {sw}"),
            Self::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            Self::Connection(e) => write!(f, "{e}"),
            Self::StillInApp(name) => write!(f, "device still running {name}"),
            Self::DeviceLocked => write!(f, "device still locked"),
        }
    }
}

impl std::error::Error for OsActionError {}

impl From<CommandError<OpenAppError>> for OsActionError {
    fn from(e: CommandError<OpenAppError>) -> Self {
        match e {
            CommandError::Device(e) => Self::OpenApp(e),
            CommandError::UnknownDeviceExchange(sw) => Self::UnknownDeviceExchange(sw),
            CommandError::InvalidResponse(e) => Self::InvalidResponse(e),
            CommandError::Connection(e) => Self::Connection(e),
        }
    }
}

impl From<CommandError<Infallible>> for OsActionError {
    fn from(e: CommandError<Infallible>) -> Self {
        match e {
            CommandError::Device(never) => match never {},
            CommandError::UnknownDeviceExchange(sw) => Self::UnknownDeviceExchange(sw),
            CommandError::InvalidResponse(e) => Self::InvalidResponse(e),
            CommandError::Connection(e) => Self::Connection(e),
        }
    }
}
