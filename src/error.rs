//! Error types for the call client.

use std::time::Duration;
use thiserror::Error;

/// Failure kinds for local device acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    /// The platform refused access to the device.
    PermissionDenied,
    /// No usable device exists (or no alternate camera for a switch).
    DeviceUnavailable,
}

impl std::fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::DeviceUnavailable => write!(f, "device unavailable"),
        }
    }
}

/// Local media failure. Never fatal to a call: the session records the
/// diagnostic and proceeds degraded.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub detail: String,
}

impl MediaError {
    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self {
            kind: MediaErrorKind::PermissionDenied,
            detail: detail.into(),
        }
    }

    pub fn device_unavailable(detail: impl Into<String>) -> Self {
        Self {
            kind: MediaErrorKind::DeviceUnavailable,
            detail: detail.into(),
        }
    }
}

/// Signaling channel failures. Fatal only at connect time.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("relay connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("channel is closed")]
    Closed,

    #[error("event encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Peer-link negotiation failures. Fatal before media has flowed; once the
/// call is connected, link breakage is an ordinary end-of-call instead.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer link has not been created")]
    LinkMissing,

    #[error("no signaling channel bound")]
    ChannelNotBound,

    #[error("signaling emit failed: {0}")]
    Signaling(#[from] ChannelError),

    #[error("malformed negotiation payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Top-level error for the public API surface.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("call is already in progress")]
    AlreadyActive,
}
