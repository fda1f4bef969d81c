//! Call state machine.
//!
//! Every trigger — visitor intent, relay event, peer-link callback, timer —
//! enters as a [`SessionEvent`]; [`CallSession::apply`] is a pure mapping
//! from `(current state, event)` to `(next state, effects)`. The driver
//! executes the effects; nothing in here touches the network or devices, so
//! the race conditions (stale timers, dual-source connects, late signaling)
//! are all testable as plain transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::media::LinkState;
use crate::signaling::CallId;

/// Current state of the call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum SessionState {
    /// No call yet; waiting for the visitor to confirm.
    #[default]
    Idle,
    /// Acquiring devices and connecting the relay channel.
    AcquiringMedia,
    /// Call requested; waiting for the resident to answer.
    Ringing,
    /// Media session established (or the resident answered).
    Connected,
    /// Declined, unreachable, or unanswered within the ring timeout.
    Rejected,
    /// Over: hung up locally, remotely, or the link dropped.
    Ended,
    /// Initialization failed before the call existed.
    Failed,
}

impl SessionState {
    /// Terminal states never transition again; teardown has run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended | Self::Failed)
    }
}

/// How long to wait before navigating away from a finished call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDelay {
    /// Visitor-initiated: no delay.
    Immediate,
    /// Let the visitor see the rejection first.
    AfterRejected,
    /// Let the visitor see that the call ended first.
    AfterEnded,
}

/// Inbound events, all sources merged into one queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // Visitor intents.
    ConfirmCall,
    HangUp,
    ToggleMute,
    ToggleVideo,
    SwitchCamera,

    // Initialization outcomes.
    /// Device acquisition failed; the call proceeds degraded.
    MediaDegraded { detail: String },
    ChannelReady,
    SetupFailed { detail: String },

    // Relay signaling.
    CallRegistered { call_id: CallId },
    CalleeAnswered { call_id: CallId },
    CalleeRejected { call_id: CallId },
    PeerHungUp { call_id: CallId },
    /// Caller-only client: observed and discarded.
    IncomingCall,
    /// Remote description for the link; applied by the driver, no state
    /// change.
    RemoteAnswer { sdp: String },
    RemoteCandidate { candidate: Value },
    NegotiationFailed { detail: String },

    // Peer link.
    Link(LinkState),
    RemoteMedia,

    // Timers.
    RingTimeout,
    DurationTick,
    AutoReturn,

    // External disposal (navigation away).
    Dispose,
}

/// Side effects the driver executes after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire local media (best effort) and connect the relay channel.
    StartSetup,
    EmitStartCall,
    ArmRingTimeout,
    DisarmRingTimeout,
    CreatePeerLink,
    SendOffer { call_id: CallId },
    StartDurationClock,
    EmitEndCall { call_id: CallId },
    NotifyRestEnd { call_id: CallId },
    SetAudioMuted { muted: bool },
    SetVideoEnabled { enabled: bool },
    SwitchCamera,
    RunTeardown,
    ScheduleReturn { after: ReturnDelay },
}

/// The sole session entity: pure data plus the transition function.
#[derive(Debug, Clone)]
pub struct CallSession {
    state: SessionState,
    callee_id: String,
    caller_name: String,
    call_id: Option<CallId>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    elapsed_seconds: u64,
    last_error: Option<String>,
    audio_muted: bool,
    video_enabled: bool,
    remote_media: bool,
}

impl CallSession {
    pub fn new(callee_id: impl Into<String>, caller_name: impl Into<String>) -> Self {
        Self {
            state: SessionState::Idle,
            callee_id: callee_id.into(),
            caller_name: caller_name.into(),
            call_id: None,
            started_at: Utc::now(),
            connected_at: None,
            elapsed_seconds: 0,
            last_error: None,
            audio_muted: false,
            video_enabled: true,
            remote_media: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    pub fn callee_id(&self) -> &str {
        &self.callee_id
    }

    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn audio_muted(&self) -> bool {
        self.audio_muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn remote_media(&self) -> bool {
        self.remote_media
    }

    /// Apply one event. Terminal states absorb everything, so teardown can
    /// only ever be emitted once per session, and a timer that fires under
    /// stale state is a no-op rather than a command.
    pub fn apply(&mut self, event: SessionEvent) -> Vec<Effect> {
        use SessionEvent as Ev;
        use SessionState as St;

        if self.state.is_terminal() {
            return Vec::new();
        }

        match (self.state, event) {
            (St::Idle, Ev::ConfirmCall) => {
                self.state = St::AcquiringMedia;
                vec![Effect::StartSetup]
            }

            (_, Ev::MediaDegraded { detail }) => {
                self.last_error = Some(detail);
                Vec::new()
            }

            (St::AcquiringMedia, Ev::ChannelReady) => {
                self.state = St::Ringing;
                vec![Effect::EmitStartCall, Effect::ArmRingTimeout]
            }

            (St::AcquiringMedia | St::Ringing, Ev::SetupFailed { detail }) => {
                self.last_error = Some(detail);
                self.state = St::Failed;
                vec![Effect::RunTeardown]
            }

            // Prepare the link as soon as the relay confirms the call, so
            // the offer can go out the instant the resident answers.
            (St::Ringing, Ev::CallRegistered { call_id }) => {
                self.call_id = Some(call_id);
                vec![Effect::CreatePeerLink]
            }

            (St::Ringing, Ev::CalleeAnswered { call_id }) => {
                let mut effects = vec![Effect::DisarmRingTimeout];
                if self.call_id.is_none() {
                    self.call_id = Some(call_id);
                    effects.push(Effect::CreatePeerLink);
                }
                if let Some(id) = self.call_id.clone() {
                    effects.push(Effect::SendOffer { call_id: id });
                }
                self.enter_connected();
                effects.push(Effect::StartDurationClock);
                effects
            }

            // The link callback won the race against the answered event; a
            // connected link means negotiation already completed, so there
            // is no offer left to send.
            (St::Ringing, Ev::Link(LinkState::Connected)) => {
                self.enter_connected();
                vec![Effect::DisarmRingTimeout, Effect::StartDurationClock]
            }

            (St::Connected, Ev::CalleeAnswered { .. }) => Vec::new(),
            (St::Connected, Ev::Link(LinkState::Connected)) => Vec::new(),

            (St::Ringing, Ev::CalleeRejected { .. } | Ev::RingTimeout) => {
                self.state = St::Rejected;
                vec![
                    Effect::RunTeardown,
                    Effect::ScheduleReturn {
                        after: ReturnDelay::AfterRejected,
                    },
                ]
            }

            (St::Ringing | St::Connected, Ev::PeerHungUp { .. }) => self.end_from_remote(),
            (
                St::Ringing | St::Connected,
                Ev::Link(LinkState::Disconnected | LinkState::Failed),
            ) => self.end_from_remote(),

            (St::AcquiringMedia | St::Ringing | St::Connected, Ev::HangUp) => {
                let mut effects = Vec::new();
                if let Some(id) = self.call_id.clone() {
                    effects.push(Effect::EmitEndCall {
                        call_id: id.clone(),
                    });
                    effects.push(Effect::NotifyRestEnd { call_id: id });
                }
                self.state = St::Ended;
                effects.push(Effect::RunTeardown);
                effects.push(Effect::ScheduleReturn {
                    after: ReturnDelay::Immediate,
                });
                effects
            }

            (St::Connected, Ev::DurationTick) => {
                self.elapsed_seconds += 1;
                Vec::new()
            }

            (St::AcquiringMedia | St::Ringing | St::Connected, Ev::ToggleMute) => {
                self.audio_muted = !self.audio_muted;
                vec![Effect::SetAudioMuted {
                    muted: self.audio_muted,
                }]
            }

            (St::AcquiringMedia | St::Ringing | St::Connected, Ev::ToggleVideo) => {
                self.video_enabled = !self.video_enabled;
                vec![Effect::SetVideoEnabled {
                    enabled: self.video_enabled,
                }]
            }

            (St::Ringing | St::Connected, Ev::SwitchCamera) => vec![Effect::SwitchCamera],

            // Once connected, negotiation hiccups are diagnostics; the link
            // state reports real breakage.
            (St::Connected, Ev::NegotiationFailed { detail }) => {
                self.last_error = Some(detail);
                Vec::new()
            }
            (St::AcquiringMedia | St::Ringing, Ev::NegotiationFailed { detail }) => {
                self.last_error = Some(detail);
                self.state = St::Failed;
                vec![Effect::RunTeardown]
            }

            (_, Ev::RemoteMedia) => {
                self.remote_media = true;
                Vec::new()
            }

            (_, Ev::Dispose) => {
                self.state = St::Ended;
                vec![Effect::RunTeardown]
            }

            // Explicitly discarded: this client is caller-only.
            (_, Ev::IncomingCall) => Vec::new(),

            // Stale timers and out-of-state events are signals, not
            // commands.
            (_, Ev::RingTimeout | Ev::DurationTick | Ev::AutoReturn) => Vec::new(),
            (_, Ev::RemoteAnswer { .. } | Ev::RemoteCandidate { .. }) => Vec::new(),
            (_, _) => Vec::new(),
        }
    }

    fn enter_connected(&mut self) {
        self.state = SessionState::Connected;
        if self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
    }

    fn end_from_remote(&mut self) -> Vec<Effect> {
        self.state = SessionState::Ended;
        vec![
            Effect::RunTeardown,
            Effect::ScheduleReturn {
                after: ReturnDelay::AfterEnded,
            },
        ]
    }
}
