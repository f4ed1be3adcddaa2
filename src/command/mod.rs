//! Typed commands over the APDU capability.
//!
//! A [`Command`] knows how to turn itself into an [`Apdu`] and how to turn
//! the [`ApduResponse`] back into its typed result.  Status words other than
//! `0x9000` are mapped through the command's own error table
//! ([`DeviceErrorCode`]), falling back to
//! [`CommandError::UnknownDeviceExchange`].
//!
//! ```text
//!  DeviceAction ──send_command──► CommandSender (DeviceConnection)
//!       ▲                              │ send_apdu_with
//!       └──── CommandResult ◄── parse ◄┘ ApduResponse
//! ```

pub mod os;

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::time::Duration;

use crate::apdu::{Apdu, ApduResponse, StatusWord};
pub use crate::error::CommandError;
use crate::error::ConnectionError;

/// Boxed, non-`Send` future returned by object-safe async capabilities.
pub type LocalFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub type CommandResult<T, E> = Result<T, CommandError<E>>;

/// Per-request overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Replaces the connection's default exchange timeout.
    pub timeout: Option<Duration>,
    /// The device restarts its link after answering this command.
    pub triggers_disconnection: bool,
}

/// The command-sending capability injected into device actions.
pub trait CommandSender {
    fn send_apdu_with<'a>(
        &'a self,
        apdu: &'a Apdu,
        options: SendOptions,
    ) -> LocalFuture<'a, Result<ApduResponse, ConnectionError>>;

    fn send_apdu<'a>(
        &'a self,
        apdu: &'a Apdu,
    ) -> LocalFuture<'a, Result<ApduResponse, ConnectionError>> {
        self.send_apdu_with(apdu, SendOptions::default())
    }
}

/// Status-word table of one command.
pub trait DeviceErrorCode: Sized {
    fn from_status(status: StatusWord) -> Option<Self>;
}

/// For commands whose failures are all unknown exchanges.
impl DeviceErrorCode for Infallible {
    fn from_status(_: StatusWord) -> Option<Self> {
        None
    }
}

pub trait Command {
    type Response;
    type Error: DeviceErrorCode;

    fn apdu(&self) -> Apdu;

    fn parse(&self, response: &ApduResponse) -> CommandResult<Self::Response, Self::Error>;

    fn triggers_disconnection(&self) -> bool {
        false
    }
}

/// Success test plus error-table lookup.
pub fn check_status<E: DeviceErrorCode>(response: &ApduResponse) -> CommandResult<(), E> {
    if response.is_success() {
        return Ok(());
    }
    Err(E::from_status(response.status)
        .map_or(CommandError::UnknownDeviceExchange(response.status), CommandError::Device))
}

pub async fn send_command<S, C>(sender: &S, command: &C) -> CommandResult<C::Response, C::Error>
where
    S: CommandSender + ?Sized,
    C: Command + ?Sized,
{
    let apdu = command.apdu();
    let options = SendOptions {
        triggers_disconnection: command.triggers_disconnection(),
        ..SendOptions::default()
    };
    let response = sender.send_apdu_with(&apdu, options).await?;
    command.parse(&response)
}
