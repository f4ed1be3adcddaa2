//! Device session library.
//!
//! Host-side engine for talking to a hardware wallet over an unreliable,
//! MTU-limited link: APDU construction and parsing, frame codec, a
//! reconnecting request-serializing connection, and the device action
//! engine that runs multi-step workflows on top of it.
//!
//! ```text
//!  DeviceAction ─► CommandSender ─► DeviceConnection ─► DeviceApduSender ─► Transport
//!  (action)        (command)        (connection)        (sender, framing)    (transport)
//! ```

#![deny(unused_must_use)]

pub mod action;
pub mod apdu;
pub mod command;
pub mod config;
pub mod connection;
pub mod framing;
pub mod sender;
pub mod transport;

mod error;

pub use error::{
    BuildError, CommandError, ConnectionError, Error, ExchangeError, FrameError, LinkError,
    MissingField, Result,
};
