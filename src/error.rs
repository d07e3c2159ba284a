//! Errors that may occur while a room is running.

use thiserror::Error;

use crate::proto::UserId;

/// Failure reported by the underlying RTC platform.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RtcError(pub String);

impl RtcError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors of local microphone acquisition.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Could not access microphone. Please check permissions.")]
    PermissionDenied,

    #[error("Microphone is unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Errors of the signaling channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Signaling session is closed")]
    Closed,

    #[error("Malformed signaling envelope: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Errors scoped to a single peer link. Never propagated beyond it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Failed to create peer connection with {remote}: {source}")]
    CreateConnection { remote: UserId, source: RtcError },

    #[error("Failed to create SDP offer: {0}")]
    CreateOffer(RtcError),

    #[error("Failed to create SDP answer: {0}")]
    CreateAnswer(RtcError),

    #[error("Failed to set local description: {0}")]
    SetLocalDescription(RtcError),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescription(RtcError),

    #[error("Failed to attach local track: {0}")]
    AttachTrack(RtcError),

    #[error("Received SDP offer while being the initiator")]
    UnexpectedOffer,

    #[error("Received SDP answer while being the responder")]
    UnexpectedAnswer,
}

/// Failed call to the external room store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Room store operation `{operation}` failed: {message}")]
pub struct StoreError {
    pub operation: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Errors surfaced to the user by [`crate::Room`] operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Room is not joined")]
    NotJoined,
}
