//! Media endpoint: local tracks plus the single peer link.
//!
//! The endpoint owns everything the call session acquires: device feeds,
//! the `RTCPeerConnection`, and the pump tasks copying encoded frames into
//! local tracks. Negotiation artifacts travel through whichever signaling
//! channel is bound. All resources are released exactly once in
//! [`MediaEndpoint::dispose`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::source::{CameraFacing, MediaFeed, MediaSource};
use super::LinkState;
use crate::error::{MediaError, NegotiationError};
use crate::session::state::SessionEvent;
use crate::signaling::{
    CallId, EV_ICE_CANDIDATE, EV_WEBRTC_OFFER, SignalingChannel, candidate_payload, offer_payload,
};

const MEDIA_STREAM_ID: &str = "gatecall";

/// A local track wired to a device feed.
struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    /// Frames are dropped while the gate is shut; no renegotiation needed.
    gate: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    feed_stop: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Swap the device feed behind the track in place. The track (and its
    /// RTP sender) stay untouched, so the remote side sees no glitch.
    fn replace_feed(&mut self, feed: MediaFeed) {
        self.feed_stop.store(true, Ordering::Relaxed);
        self.pump.abort();
        let MediaFeed { frames, stop, .. } = feed;
        self.feed_stop = stop;
        self.pump = spawn_pump(self.track.clone(), frames, self.gate.clone());
    }

    fn stop(&self) {
        self.feed_stop.store(true, Ordering::Relaxed);
        self.pump.abort();
    }
}

fn spawn_pump(
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<super::source::MediaFrame>,
    gate: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if !gate.load(Ordering::Relaxed) {
                continue;
            }
            let sample = Sample {
                data: frame.data,
                duration: frame.duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(target: "Call/Media", "dropping sample: {e}");
            }
        }
    })
}

/// Owns local media and the peer link for one call session.
pub struct MediaEndpoint {
    source: Arc<dyn MediaSource>,
    ice_servers: Vec<String>,
    events: mpsc::Sender<SessionEvent>,
    channel: Option<Arc<dyn SignalingChannel>>,
    peer: Option<Arc<RTCPeerConnection>>,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    pending_audio: Option<MediaFeed>,
    pending_video: Option<MediaFeed>,
    facing: CameraFacing,
    call_id: Option<CallId>,
    disposed: bool,
}

impl MediaEndpoint {
    pub fn new(
        source: Arc<dyn MediaSource>,
        ice_servers: Vec<String>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            source,
            ice_servers,
            events,
            channel: None,
            peer: None,
            audio: None,
            video: None,
            pending_audio: None,
            pending_video: None,
            facing: CameraFacing::default(),
            call_id: None,
            disposed: false,
        }
    }

    /// Bind the signaling channel negotiation artifacts travel through.
    /// Must happen before any negotiation call.
    pub fn bind_signaling(&mut self, channel: Arc<dyn SignalingChannel>) {
        self.channel = Some(channel);
    }

    /// Request device access, best effort. Feeds that open are held until
    /// the peer link exists; the first failure is returned for diagnostics
    /// but never aborts the call.
    pub async fn acquire_local_media(
        &mut self,
        want_audio: bool,
        want_video: bool,
    ) -> Result<(), MediaError> {
        let mut first_err = None;
        if want_audio {
            match self.source.open_audio().await {
                Ok(feed) => self.pending_audio = Some(feed),
                Err(e) => {
                    warn!(target: "Call/Media", "microphone unavailable: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        if want_video {
            match self.source.open_video(self.facing).await {
                Ok(feed) => self.pending_video = Some(feed),
                Err(e) => {
                    warn!(target: "Call/Media", "camera unavailable: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Allocate the peer connection. Idempotent: a second call while a link
    /// exists is a no-op.
    pub async fn create_peer_link(
        &mut self,
        call_id: Option<CallId>,
    ) -> Result<(), NegotiationError> {
        if self.peer.is_some() {
            return Ok(());
        }
        self.call_id = call_id;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);

        let events = self.events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(SessionEvent::Link(LinkState::from(state))).await;
            })
        }));

        let events = self.events.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                debug!(target: "Call/Media", "remote {} track arrived", track.kind());
                let _ = events.send(SessionEvent::RemoteMedia).await;
            })
        }));

        let channel = self.channel.clone();
        let call_id = self.call_id.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let channel = channel.clone();
            let call_id = call_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(target: "Call/Media", "candidate serialization failed: {e}");
                        return;
                    }
                };
                let Some(channel) = channel else { return };
                let payload = match serde_json::to_value(&init) {
                    Ok(value) => candidate_payload(call_id.as_ref(), value),
                    Err(e) => {
                        warn!(target: "Call/Media", "candidate encode failed: {e}");
                        return;
                    }
                };
                if let Err(e) = channel.emit(EV_ICE_CANDIDATE, payload) {
                    debug!(target: "Call/Media", "candidate emit failed: {e}");
                }
            })
        }));

        if let Some(feed) = self.pending_audio.take() {
            self.audio = Some(attach_track(&peer, feed, "audio").await?);
        }
        if let Some(feed) = self.pending_video.take() {
            self.video = Some(attach_track(&peer, feed, "video").await?);
        }

        self.peer = Some(peer);
        debug!(target: "Call/Media", "peer link created");
        Ok(())
    }

    /// Create the local session description, set it, and relay it as a
    /// `webrtc_offer`. Completion is observed via link-state changes or the
    /// remote answer.
    pub async fn create_and_send_offer(&self, call_id: &CallId) -> Result<(), NegotiationError> {
        let peer = self.peer.as_ref().ok_or(NegotiationError::LinkMissing)?;
        let channel = self
            .channel
            .as_ref()
            .ok_or(NegotiationError::ChannelNotBound)?;

        let offer = peer.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        peer.set_local_description(offer).await?;
        channel.emit(EV_WEBRTC_OFFER, offer_payload(call_id, &sdp))?;
        debug!(target: "Call/Media", "offer sent for call {call_id}");
        Ok(())
    }

    /// Apply the remote answer to our offer.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), NegotiationError> {
        let peer = self.peer.as_ref().ok_or(NegotiationError::LinkMissing)?;
        let answer = RTCSessionDescription::answer(sdp)?;
        peer.set_remote_description(answer).await?;
        Ok(())
    }

    /// Feed a remote ICE candidate into the link.
    pub async fn add_remote_candidate(&self, candidate: Value) -> Result<(), NegotiationError> {
        let peer = self.peer.as_ref().ok_or(NegotiationError::LinkMissing)?;
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        peer.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Mute or unmute the microphone. Local gate flip, no renegotiation.
    pub fn toggle_audio(&self, muted: bool) {
        if let Some(audio) = &self.audio {
            audio.gate.store(!muted, Ordering::Relaxed);
        }
    }

    /// Enable or disable the camera track.
    pub fn toggle_video(&self, enabled: bool) {
        if let Some(video) = &self.video {
            video.gate.store(enabled, Ordering::Relaxed);
        }
    }

    /// Switch to the other camera. The replacement feed is acquired first;
    /// on failure the current feed keeps running untouched.
    pub async fn switch_camera(&mut self) -> Result<(), MediaError> {
        if self.disposed {
            return Err(MediaError::device_unavailable("endpoint disposed"));
        }
        let next = self.facing.flipped();
        let feed = self.source.open_video(next).await?;
        self.facing = next;
        match &mut self.video {
            Some(video) => video.replace_feed(feed),
            None => self.pending_video = Some(feed),
        }
        debug!(target: "Call/Media", "camera switched to {next:?}");
        Ok(())
    }

    /// Release every owned resource. Idempotent; never fails (release
    /// errors are logged and swallowed).
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        for track in [self.audio.take(), self.video.take()].into_iter().flatten() {
            track.stop();
        }
        for feed in [self.pending_audio.take(), self.pending_video.take()]
            .into_iter()
            .flatten()
        {
            feed.halt();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!(target: "Call/Media", "peer link close failed: {e}");
            }
        }
        self.channel = None;
        debug!(target: "Call/Media", "endpoint disposed");
    }
}

async fn attach_track(
    peer: &Arc<RTCPeerConnection>,
    feed: MediaFeed,
    kind: &str,
) -> Result<LocalTrack, NegotiationError> {
    let MediaFeed { codec, frames, stop } = feed;
    let track = Arc::new(TrackLocalStaticSample::new(
        codec,
        kind.to_string(),
        MEDIA_STREAM_ID.to_string(),
    ));
    peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    let gate = Arc::new(AtomicBool::new(true));
    let pump = spawn_pump(track.clone(), frames, gate.clone());
    Ok(LocalTrack {
        track,
        gate,
        pump,
        feed_stop: stop,
    })
}
