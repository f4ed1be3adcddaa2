//! Device actions: multi-step device workflows as observable, cancellable
//! state machines.
//!
//! ```text
//!   execute(action, sender) ──► ActionHandle ── subscribe() ──► Subscription (Stream)
//!                          └──► ActionRun (poll on the executor)
//!                                   │
//!                                   │ Invoke nodes
//!                                   ▼
//!                     CommandSender (DeviceConnection)
//! ```

pub mod broadcast;
pub mod cancel;
pub mod engine;
pub mod os;
pub mod state;

pub use broadcast::{StateLog, Subscription};
pub use cancel::CancelToken;
pub use engine::{
    ActionHandle, ActionRun, ActionState, DeviceAction, Env, Invocation, Node, Outcome, execute,
};
pub use state::{DeviceActionState, Intermediate, StepIntermediate, UserInteraction};
