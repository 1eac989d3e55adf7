//! Error types for the voice engine.
//!
//! Each layer has its own `thiserror` enum; [`VoiceError`] wraps them and maps
//! every failure onto an [`ErrorCategory`] so callers can tell a fatal join
//! failure from a per-feature one.

use nexus_common::models::MediaType;

use crate::retry::RetryError;

/// Failures of the signaling channel itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    #[error("request `{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("signaling channel is disconnected")]
    Disconnected,

    #[error("server rejected `{method}`: {message}")]
    Rejected { method: String, message: String },

    #[error("malformed `{method}` payload: {message}")]
    Malformed { method: String, message: String },
}

impl SignalingError {
    pub(crate) fn malformed(method: &str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            method: method.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Failures reported by the media engine or the capture devices.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(MediaType),

    #[error("no {0} device available")]
    DeviceUnavailable(MediaType),

    #[error("media engine is not loaded")]
    NotLoaded,

    #[error("{0} is already closed")]
    Closed(&'static str),

    #[error("track {0} is not producing yet")]
    TrackNotReady(String),

    #[error("media engine error: {0}")]
    Engine(String),
}

/// The taxonomy callers use to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Negotiation,
    Transport,
    Signaling,
    MediaAcquisition,
    ConsumerStall,
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("connection lost, rejoin required")]
    ConnectionLost,

    #[error("consumer {consumer_id} stalled and could not be recovered")]
    ConsumerStalled { consumer_id: String },

    #[error("a join for this room is already in progress")]
    JoinInProgress,

    #[error("not joined to a voice room")]
    NotJoined,

    #[error("operation cancelled by leave")]
    Cancelled,

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("preferences error: {0}")]
    Preferences(String),
}

impl VoiceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Negotiation(_) => ErrorCategory::Negotiation,
            Self::Signaling(_) => ErrorCategory::Signaling,
            Self::Media(MediaError::PermissionDenied(_) | MediaError::DeviceUnavailable(_)) => {
                ErrorCategory::MediaAcquisition
            }
            Self::Media(_) | Self::ConnectionLost => ErrorCategory::Transport,
            Self::ConsumerStalled { .. } => ErrorCategory::ConsumerStall,
            Self::JoinInProgress
            | Self::NotJoined
            | Self::Cancelled
            | Self::UnknownPeer(_)
            | Self::Preferences(_) => ErrorCategory::Usage,
        }
    }
}

impl From<RetryError<VoiceError>> for VoiceError {
    fn from(err: RetryError<VoiceError>) -> Self {
        match err {
            RetryError::Cancelled => VoiceError::Cancelled,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
