//! Error taxonomy for the streaming pipeline
//!
//! Every failure resolves to one of these values; none of them is allowed to
//! take the process down.

use thiserror::Error;

use crate::pipeline::state::ConnectionState;

/// Capture source could not be acquired. Fatal to capture, never retried.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no capture source found for {0:?}")]
    NotFound(String),
    #[error("permission denied for capture source {0:?}")]
    PermissionDenied(String),
    #[error("capture source {0:?} is already in use")]
    Busy(String),
    #[error("capture source {id:?} is unusable: {reason}")]
    Unusable { id: String, reason: String },
}

/// The streaming connection could not be established.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("connection cannot be opened from state {0}")]
    InvalidState(ConnectionState),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("connection closed before it was established")]
    Aborted,
    #[error("transport failed to establish: {0}")]
    Transport(String),
}

/// A mid-session transport failure.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// A frame could not be handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection is not open")]
    NotConnected,
    #[error("transport has not accepted the previous frame")]
    Busy,
}

/// An inbound message could not be understood. Recoverable.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 preview image: {0}")]
    Preview(#[from] base64::DecodeError),
}

/// Errors surfaced by the lifecycle coordinator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capture is not active")]
    CaptureInactive,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
