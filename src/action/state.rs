//! Observable state of a running device action.

use core::fmt;

/// What the user has to do on the device right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UserInteraction {
    #[default]
    None,
    UnlockDevice,
    ConfirmOpenApp,
    AllowSecureConnection,
    SignTransaction,
    VerifyAddress,
}

impl fmt::Display for UserInteraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::UnlockDevice => "unlock device",
            Self::ConfirmOpenApp => "confirm open app",
            Self::AllowSecureConnection => "allow secure connection",
            Self::SignTransaction => "sign transaction",
            Self::VerifyAddress => "verify address",
        };
        f.write_str(s)
    }
}

/// Progress value carried by `Pending`.
pub trait Intermediate: Clone + 'static {
    fn required_interaction(&self) -> UserInteraction;
}

/// Intermediate value for actions with nothing to report but the
/// interaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepIntermediate {
    pub required_interaction: UserInteraction,
}

impl StepIntermediate {
    pub const fn new(required_interaction: UserInteraction) -> Self {
        Self {
            required_interaction,
        }
    }
}

impl Intermediate for StepIntermediate {
    fn required_interaction(&self) -> UserInteraction {
        self.required_interaction
    }
}

/// One emitted state.  A run emits `Pending` any number of times and then
/// exactly one of `Completed`, `Error` or `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceActionState<O, E, I> {
    NotStarted,
    Pending(I),
    Completed(O),
    Error(E),
    Stopped,
}

impl<O, E, I> DeviceActionState<O, E, I> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Error(_) | Self::Stopped)
    }

    pub fn intermediate(&self) -> Option<&I> {
        match self {
            Self::Pending(i) => Some(i),
            _ => None,
        }
    }
}

impl<O, E, I: Intermediate> DeviceActionState<O, E, I> {
    /// `UserInteraction::None` outside `Pending`.
    pub fn required_interaction(&self) -> UserInteraction {
        self.intermediate()
            .map_or(UserInteraction::None, Intermediate::required_interaction)
    }
}
