//! Dashboard (OS) commands used by the built-in actions.

use core::convert::Infallible;
use core::fmt;

use super::{Command, CommandResult, DeviceErrorCode, check_status};
use crate::apdu::{Apdu, ApduBuilder, ApduParser, ApduResponse, StatusWord};
use crate::error::BuildError;

/// Application name the device reports while on its dashboard.
pub const DASHBOARD_APP_NAME: &str = "BOLOS";

const OPEN_APP: (u8, u8) = (0xe0, 0xd8);
const CLOSE_APP: (u8, u8) = (0xb0, 0xa7);
const GET_APP_AND_VERSION: (u8, u8) = (0xb0, 0x01);

/// Commands after which the device drops and re-establishes its link.
pub fn is_apdu_that_triggers_disconnection(apdu: &Apdu) -> bool {
    let head = (apdu.cla(), apdu.ins());
    (head == OPEN_APP || head == CLOSE_APP) && apdu.p1() == 0 && apdu.p2() == 0
}

// ---------------------------------------------------------------------------
// Open app
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAppError {
    UnknownApplicationName,
    NoAppName,
    RefusedByUser,
    DeviceLocked,
}

impl fmt::Display for OpenAppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownApplicationName => write!(f, "unknown application name"),
            Self::NoAppName => write!(f, "no app name provided"),
            Self::RefusedByUser => write!(f, "action refused on device"),
            Self::DeviceLocked => write!(f, "device locked"),
        }
    }
}

impl DeviceErrorCode for OpenAppError {
    fn from_status(status: StatusWord) -> Option<Self> {
        match status.0 {
            0x6807 => Some(Self::UnknownApplicationName),
            0x670a => Some(Self::NoAppName),
            0x6985 | 0x5501 => Some(Self::RefusedByUser),
            0x5515 => Some(Self::DeviceLocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAppCommand {
    name: String,
    apdu: Apdu,
}

impl OpenAppCommand {
    pub fn new(name: &str) -> Result<Self, BuildError> {
        let apdu = ApduBuilder::new(OPEN_APP.0, OPEN_APP.1, 0x00, 0x00)
            .add_ascii(name)
            .build()?;
        Ok(Self {
            name: name.to_owned(),
            apdu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Command for OpenAppCommand {
    type Response = ();
    type Error = OpenAppError;

    fn apdu(&self) -> Apdu {
        self.apdu.clone()
    }

    fn parse(&self, response: &ApduResponse) -> CommandResult<(), OpenAppError> {
        check_status(response)
    }

    fn triggers_disconnection(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Close app
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseAppCommand;

impl Command for CloseAppCommand {
    type Response = ();
    type Error = Infallible;

    fn apdu(&self) -> Apdu {
        Apdu::new(CLOSE_APP.0, CLOSE_APP.1, 0x00, 0x00)
    }

    fn parse(&self, response: &ApduResponse) -> CommandResult<(), Infallible> {
        check_status(response)
    }

    fn triggers_disconnection(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Get app and version
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAndVersion {
    pub name: String,
    pub version: String,
    /// Present only on firmwares that report app flags.
    pub flags: Option<Vec<u8>>,
}

impl AppAndVersion {
    pub fn is_dashboard(&self) -> bool {
        self.name == DASHBOARD_APP_NAME
    }

    /// Response payload as the device encodes it.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0x01, self.name.len() as u8];
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.version.len() as u8);
        out.extend_from_slice(self.version.as_bytes());
        if let Some(flags) = &self.flags {
            out.push(flags.len() as u8);
            out.extend_from_slice(flags);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAppAndVersionCommand;

impl Command for GetAppAndVersionCommand {
    type Response = AppAndVersion;
    type Error = Infallible;

    fn apdu(&self) -> Apdu {
        Apdu::new(GET_APP_AND_VERSION.0, GET_APP_AND_VERSION.1, 0x00, 0x00)
    }

    fn parse(&self, response: &ApduResponse) -> CommandResult<AppAndVersion, Infallible> {
        check_status(response)?;
        let mut parser = ApduParser::new(response);
        let _format = parser.read_u8()?;
        let name = parser.read_lv_ascii()?;
        let version = parser.read_lv_ascii()?;
        let flags = if parser.remaining_len() > 0 {
            Some(parser.read_lv()?.to_vec())
        } else {
            None
        };
        Ok(AppAndVersion {
            name,
            version,
            flags,
        })
    }
}
