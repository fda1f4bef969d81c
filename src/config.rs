//! Session configuration.

use std::time::Duration;

/// Configuration for a call session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    /// Base URL for the best-effort call-status REST mirror, if any.
    pub rest_base_url: Option<String>,
    /// STUN/TURN server URLs handed to the peer link.
    pub ice_servers: Vec<String>,
    /// Bound on establishing the relay connection.
    pub connect_timeout: Duration,
    /// How long to wait for the resident to answer.
    pub ring_timeout: Duration,
    /// Auto-return delay after a rejected or unanswered call.
    pub rejected_return_delay: Duration,
    /// Auto-return delay after the call ends from the remote side.
    pub ended_return_delay: Duration,
    /// Request microphone access when the call starts.
    pub want_audio: bool,
    /// Request camera access when the call starts.
    pub want_video: bool,
}

impl SessionConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5000/signal".to_string(),
            rest_base_url: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            connect_timeout: Duration::from_secs(10),
            ring_timeout: Duration::from_secs(45),
            rejected_return_delay: Duration::from_secs(3),
            ended_return_delay: Duration::from_secs(2),
            want_audio: true,
            want_video: true,
        }
    }
}
