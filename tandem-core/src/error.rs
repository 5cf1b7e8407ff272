//! Domain-specific error types for the tandem coordinator.
//!
//! All fallible operations return `Result<T, TandemError>`.
//! No panics on invalid input — every error is typed and recoverable.

use thiserror::Error;

use crate::session::SessionPhase;

/// The canonical error type for the tandem coordination core.
#[derive(Debug, Error)]
pub enum TandemError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// An inbound frame could not be interpreted as a protocol message.
    ///
    /// Malformed messages are logged and discarded at the codec
    /// boundary; this variant only surfaces when a caller explicitly
    /// demands a well-formed message.
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding a message to JSON failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    // ── Device Errors ────────────────────────────────────────────
    /// A device id was not present in the registry.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// A device has no live connection to send through.
    #[error("device not connected: {0}")]
    DeviceNotConnected(String),

    // ── Session Errors ───────────────────────────────────────────
    /// A session operation was requested from a phase that does not
    /// permit it.
    #[error("invalid session transition: cannot {operation} from {from}")]
    InvalidTransition {
        from: SessionPhase,
        operation: &'static str,
    },

    /// A session-level terminal failure with a reason code.
    #[error("session failed: {0}")]
    Session(#[from] SessionError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── MalformedMessage ─────────────────────────────────────────────

/// Why an inbound frame was rejected at the codec boundary.
///
/// Rejection never crashes the connection; the frame is logged and
/// dropped, and subsequent frames are processed normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    /// The frame was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// The frame was valid JSON but not a JSON object.
    #[error("frame is not a json object")]
    NotAnObject,

    /// The mandatory `type` field was absent.
    #[error("missing required 'type' field")]
    MissingType,

    /// The mandatory `timestamp` field was absent or non-numeric.
    #[error("missing or invalid 'timestamp' field")]
    MissingTimestamp,

    /// The `type` was recognized but a required field was absent or
    /// had the wrong shape.
    #[error("invalid '{kind}' message: {detail}")]
    InvalidShape { kind: String, detail: String },
}

// ── SessionError ─────────────────────────────────────────────────

/// Reason codes for session-level terminal failures — the only
/// failures surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Session creation was attempted with an empty device set.
    #[error("cannot create session with no devices")]
    NoDevices,

    /// Every targeted device was lost before recording could proceed.
    #[error("no viable devices remain")]
    NoViableDevices,

    /// No device produced any data by the end of finalization.
    #[error("no device produced data")]
    NoDeviceData,

    /// The session was explicitly aborted.
    #[error("session aborted")]
    Aborted,

    /// A session is already active; terminal sessions need a new id.
    #[error("a session is already active")]
    AlreadyActive,

    /// The requested operation needs an active session.
    #[error("no active session")]
    NotActive,
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TandemError {
    fn from(s: String) -> Self {
        TandemError::Other(s)
    }
}

impl From<&str> for TandemError {
    fn from(s: &str) -> Self {
        TandemError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TandemError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TandemError::ChannelClosed
    }
}
