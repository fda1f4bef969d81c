//! Device acquisition seam.
//!
//! A [`MediaSource`] turns a capture device into a stream of encoded media
//! frames plus the RTP codec capability describing them. The endpoint pumps
//! those frames into local WebRTC tracks; swapping the feed on a live track
//! is how camera switching works without renegotiation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::error::MediaError;

/// Which camera a video feed comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraFacing {
    #[default]
    Front,
    Rear,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            Self::Front => Self::Rear,
            Self::Rear => Self::Front,
        }
    }
}

/// One encoded media frame ready for an RTP track.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// A live feed of encoded frames from one device.
///
/// The producer checks `stop` and winds down once it flips; dropping the
/// receiver has the same effect on sources that block on a full queue.
pub struct MediaFeed {
    pub codec: RTCRtpCodecCapability,
    pub frames: mpsc::Receiver<MediaFrame>,
    pub stop: Arc<AtomicBool>,
}

impl MediaFeed {
    /// Ask the producer to stop capturing.
    pub fn halt(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Capture-device access. Failures here never abort a call; the session
/// proceeds degraded and surfaces the diagnostic.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_audio(&self) -> Result<MediaFeed, MediaError>;

    async fn open_video(&self, facing: CameraFacing) -> Result<MediaFeed, MediaError>;
}

/// A source with no capture backend at all. Every request reports
/// `DeviceUnavailable`, which exercises the degraded-call path: signaling
/// and the peer link still come up, with no local tracks attached.
#[derive(Debug, Default)]
pub struct NoMedia;

#[async_trait]
impl MediaSource for NoMedia {
    async fn open_audio(&self) -> Result<MediaFeed, MediaError> {
        Err(MediaError::device_unavailable("no audio capture backend"))
    }

    async fn open_video(&self, _facing: CameraFacing) -> Result<MediaFeed, MediaError> {
        Err(MediaError::device_unavailable("no camera backend"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facing_flips_both_ways() {
        assert_eq!(CameraFacing::Front.flipped(), CameraFacing::Rear);
        assert_eq!(CameraFacing::Rear.flipped(), CameraFacing::Front);
    }

    #[tokio::test]
    async fn no_media_reports_device_unavailable() {
        let source = NoMedia;
        let err = source.open_audio().await.err().unwrap();
        assert_eq!(err.kind, crate::error::MediaErrorKind::DeviceUnavailable);
        let err = source.open_video(CameraFacing::Front).await.err().unwrap();
        assert_eq!(err.kind, crate::error::MediaErrorKind::DeviceUnavailable);
    }
}
