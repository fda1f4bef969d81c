//! Visitor-side call client for a building-entrance video intercom.
//!
//! An unauthenticated visitor places an audio/video call to a resident:
//! call setup runs over a WebSocket signaling relay, media over a direct
//! WebRTC peer link. The heart of the crate is the call session state
//! machine in [`session`], which owns the call lifecycle and guarantees
//! deterministic, exactly-once resource teardown on every exit path.

pub mod config;
pub mod error;
pub mod media;
pub mod rest;
pub mod session;
pub mod signaling;

pub use config::SessionConfig;
pub use error::{CallError, ChannelError, MediaError, MediaErrorKind, NegotiationError};
pub use media::{CameraFacing, LinkState, MediaSource, NoMedia};
pub use session::{
    CallParams, CallSnapshot, SessionDriver, SessionHandle, SessionState, format_elapsed,
};
pub use signaling::{CallId, ChannelFactory, SignalingChannel, WsChannelFactory};

#[cfg(feature = "system-audio")]
pub use media::CpalAudioSource;
