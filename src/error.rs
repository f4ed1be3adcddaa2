//! Unified error types for the device session engine.
//!
//! Each layer owns a small error enum and the crate-level [`Error`] wraps
//! all of them.  Lower layers (framing, sender) hand back typed results;
//! only the connection layer turns a link failure into a lifecycle
//! transition, and only the action engine turns a failure into a terminal
//! `Error` state.

use core::fmt;

use crate::apdu::StatusWord;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate can be funneled into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed frame sequence or unparseable frame.
    Protocol(FrameError),
    /// The physical link failed.
    Link(LinkError),
    /// A single exchange on a live link failed.
    Exchange(ExchangeError),
    /// The connection could not deliver the request.
    Connection(ConnectionError),
    /// An APDU could not be built.
    Build(BuildError),
    /// A mandatory response field was absent.
    Parse(MissingField),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Exchange(e) => write!(f, "exchange: {e}"),
            Self::Connection(e) => write!(f, "connection: {e}"),
            Self::Build(e) => write!(f, "build: {e}"),
            Self::Parse(e) => write!(f, "parse: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Protocol (frame codec) errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than its own header.
    FrameTooShort,
    /// Head tag byte is not the APDU tag.
    UnexpectedTag(u8),
    /// Frame was addressed to another channel.
    ChannelMismatch { expected: u16, received: u16 },
    /// Sequence index skipped or went backwards mid-message.
    SequenceGap { expected: u16, received: u16 },
    /// Continuation frame arrived with no message in progress.
    UnexpectedContinuation(u16),
    /// Reassembled response cannot hold a status word.
    ResponseTooShort,
    /// MTU cannot carry a single payload byte after the header.
    MtuTooSmall(usize),
    /// Serialized APDU exceeds what the 2-byte length can declare.
    MessageTooLong(usize),
    /// MTU negotiation answer was malformed.
    InvalidMtuResponse,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooShort => write!(f, "frame shorter than header"),
            Self::UnexpectedTag(tag) => write!(f, "unexpected head tag 0x{tag:02x}"),
            Self::ChannelMismatch { expected, received } => write!(
                f,
                "frame for channel 0x{received:04x}, expected 0x{expected:04x}"
            ),
            Self::SequenceGap { expected, received } => {
                write!(f, "sequence gap: expected {expected}, received {received}")
            }
            Self::UnexpectedContinuation(index) => {
                write!(f, "continuation frame {index} without a first frame")
            }
            Self::ResponseTooShort => write!(f, "response shorter than a status word"),
            Self::MtuTooSmall(mtu) => write!(f, "MTU {mtu} too small for framing"),
            Self::MessageTooLong(len) => write!(f, "message of {len} bytes too long"),
            Self::InvalidMtuResponse => write!(f, "invalid MTU negotiation response"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Link (transport) errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The peer is gone; retrying on this handle is pointless.
    Disconnected,
    /// A single write failed but the link may still be usable.
    WriteFailed,
    /// The peer is out of radio range (longer backoff).
    OutOfRange,
    /// The link could not be opened or its service resolved.
    OpenFailed(&'static str),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "device disconnected"),
            Self::WriteFailed => write!(f, "frame write failed"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::OpenFailed(msg) => write!(f, "open failed: {msg}"),
        }
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

// ---------------------------------------------------------------------------
// Exchange errors (one command/response on one physical link)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    /// No MTU has been negotiated yet.
    NotReady,
    /// Response frames could not be reassembled.
    Protocol(FrameError),
    /// The link reported a failure.
    Link(LinkError),
    /// A frame write kept failing after every retry.
    WriteRetriesExhausted,
    /// No complete response within the deadline.
    Timeout,
}

impl ExchangeError {
    /// Whether this failure must be escalated to a disconnection.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::Link(_) | Self::WriteRetriesExhausted)
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "sender not ready (no MTU)"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Link(e) => write!(f, "{e}"),
            Self::WriteRetriesExhausted => write!(f, "frame write retries exhausted"),
            Self::Timeout => write!(f, "exchange timed out"),
        }
    }
}

impl From<FrameError> for ExchangeError {
    fn from(e: FrameError) -> Self {
        Self::Protocol(e)
    }
}

impl From<LinkError> for ExchangeError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<ExchangeError> for Error {
    fn from(e: ExchangeError) -> Self {
        Self::Exchange(e)
    }
}

// ---------------------------------------------------------------------------
// Connection errors (what `send_apdu` callers see)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The link dropped while this request was on the wire.
    DisconnectedWhileSending,
    /// The reconnection budget ran out before the request could be sent.
    DisconnectedBeforeSending,
    /// The connection is terminated; no request will ever be sent.
    Terminated,
    /// The bounded request queue is full.
    QueueFull,
    /// No response within the request timeout.
    Timeout,
    /// The response could not be reassembled.
    Protocol(FrameError),
    /// The sender was not ready to frame the request.
    NotReady,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DisconnectedWhileSending => write!(f, "device disconnected while sending"),
            Self::DisconnectedBeforeSending => {
                write!(f, "device disconnected before sending (reconnection budget exhausted)")
            }
            Self::Terminated => write!(f, "device terminated"),
            Self::QueueFull => write!(f, "request queue full"),
            Self::Timeout => write!(f, "send APDU timeout"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::NotReady => write!(f, "device not initialized"),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

// ---------------------------------------------------------------------------
// APDU builder errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Appending would exceed the short-form payload limit.
    DataOverflow { needed: usize, available: usize },
    /// A hex string had odd length or non-hex characters.
    InvalidHex,
    /// A string contained non-ASCII characters.
    NotAscii,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataOverflow { needed, available } => write!(
                f,
                "data overflow: {needed} bytes needed, {available} available"
            ),
            Self::InvalidHex => write!(f, "invalid hex string"),
            Self::NotAscii => write!(f, "string is not ASCII"),
        }
    }
}

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

// ---------------------------------------------------------------------------
// Response parsing errors
// ---------------------------------------------------------------------------

/// A read ran past the end of the response data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingField {
    /// Cursor position when the read was attempted.
    pub offset: usize,
    /// Bytes the read needed.
    pub wanted: usize,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing field: {} bytes wanted at offset {}",
            self.wanted, self.offset
        )
    }
}

impl From<MissingField> for Error {
    fn from(e: MissingField) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// Per-command errors
// ---------------------------------------------------------------------------

/// Failure of a typed command; `E` is the command's own error table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError<E> {
    /// The device reported a status word the command knows.
    Device(E),
    /// The device reported a status word no table maps.
    UnknownDeviceExchange(StatusWord),
    /// The response lacked a mandatory field.
    InvalidResponse(MissingField),
    /// The request never produced a response.
    Connection(ConnectionError),
}

impl<E: fmt::Display> fmt::Display for CommandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "device: {e}"),
            Self::UnknownDeviceExchange(sw) => write!(f, "unknown device exchange error {sw}"),
            Self::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            Self::Connection(e) => write!(f, "{e}"),
        }
    }
}

impl<E> From<MissingField> for CommandError<E> {
    fn from(e: MissingField) -> Self {
        Self::InvalidResponse(e)
    }
}

impl<E> From<ConnectionError> for CommandError<E> {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
