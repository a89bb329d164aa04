//! The call error taxonomy.

use std::fmt;

use apache_avro::types::Value;

/// Error surfaced to callers, classified by origin.
///
/// Transport and handshake failures are channel-fatal: every in-flight call
/// on the channel fails with them. Codec failures abort only the offending
/// call. Application errors carry a declared error-union value and travel
/// inside [`WrappedResponse::error`](crate::WrappedResponse) rather than
/// aborting the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// Socket/connect/EOF level failure, including channel destruction.
    Transport(String),
    /// Protocol reconciliation failed (unknown protocol, bad hash).
    Handshake(String),
    /// Avro encode/decode failure for a single call.
    Codec(String),
    /// An error declared in the message's error union.
    Application(Value),
    /// Handler-reported error outside the declared variants.
    System(String),
    /// Raised by a middleware forward phase (or carried through reverse).
    Middleware(String),
    /// Raised by the tracing middleware (missing/duplicate/bad trace).
    Tracing(String),
    /// The per-call timeout fired before a response arrived.
    Timeout,
}

/// Coarse classification of a [`ServiceError`], mirroring the origins a
/// caller can sensibly branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel-fatal I/O failure.
    Transport,
    /// Channel-fatal negotiation failure.
    Handshake,
    /// Per-call coding failure.
    Codec,
    /// Declared application error.
    Application,
    /// Undeclared handler error.
    System,
    /// Middleware-originated error.
    Middleware,
    /// Tracing-originated error.
    Tracing,
    /// Call timeout.
    Timeout,
}

impl ServiceError {
    /// The error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Transport(_) => ErrorKind::Transport,
            ServiceError::Handshake(_) => ErrorKind::Handshake,
            ServiceError::Codec(_) => ErrorKind::Codec,
            ServiceError::Application(_) => ErrorKind::Application,
            ServiceError::System(_) => ErrorKind::System,
            ServiceError::Middleware(_) => ErrorKind::Middleware,
            ServiceError::Tracing(_) => ErrorKind::Tracing,
            ServiceError::Timeout => ErrorKind::Timeout,
        }
    }

    /// The declared error value, for application errors.
    pub fn application_value(&self) -> Option<&Value> {
        match self {
            ServiceError::Application(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Transport(msg) => write!(f, "transport error: {msg}"),
            ServiceError::Handshake(msg) => write!(f, "handshake error: {msg}"),
            ServiceError::Codec(msg) => write!(f, "codec error: {msg}"),
            ServiceError::Application(value) => write!(f, "application error: {value:?}"),
            ServiceError::System(msg) => write!(f, "system error: {msg}"),
            ServiceError::Middleware(msg) => write!(f, "middleware error: {msg}"),
            ServiceError::Tracing(msg) => write!(f, "tracing error: {msg}"),
            ServiceError::Timeout => write!(f, "call timed out"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::Transport(e.to_string())
    }
}

impl From<parley_wire::WireError> for ServiceError {
    fn from(e: parley_wire::WireError) -> Self {
        ServiceError::Codec(e.to_string())
    }
}

impl From<apache_avro::Error> for ServiceError {
    fn from(e: apache_avro::Error) -> Self {
        ServiceError::Codec(e.to_string())
    }
}

/// Error reported by a server-side handler.
///
/// `Declared` carries a value of the message's error union (branch 0 is the
/// string branch); `Message` is shorthand for a plain string error. With
/// `strict_errors`, anything that is not a declared variant is normalized to
/// a system error before it goes on the wire.
#[derive(Debug, Clone)]
pub enum RemoteError {
    /// Plain string error (the union's implicit first branch).
    Message(String),
    /// A value of the message's declared error union.
    Declared(Value),
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        RemoteError::Message(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        RemoteError::Message(message.to_owned())
    }
}

impl From<Value> for RemoteError {
    fn from(value: Value) -> Self {
        RemoteError::Declared(value)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Message(msg) => write!(f, "{msg}"),
            RemoteError::Declared(value) => write!(f, "{value:?}"),
        }
    }
}

impl std::error::Error for RemoteError {}
