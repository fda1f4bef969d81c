//! Local media and the peer link.
//!
//! - [`MediaSource`]: the device-acquisition seam ([`NoMedia`] ships as the
//!   backend-less fallback; `system-audio` adds a cpal microphone source)
//! - [`MediaEndpoint`]: owns device feeds, local tracks, and the single
//!   `RTCPeerConnection`
//! - [`LinkState`]: peer-link connectivity as the session consumes it

#[cfg(feature = "system-audio")]
mod capture;
mod endpoint;
mod source;

#[cfg(feature = "system-audio")]
pub use capture::CpalAudioSource;
pub use endpoint::MediaEndpoint;
pub use source::{CameraFacing, MediaFeed, MediaFrame, MediaSource, NoMedia};
// Re-exported so MediaSource implementations outside the crate can describe
// their feeds without depending on webrtc directly.
pub use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Peer-link connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Self::New,
        }
    }
}
