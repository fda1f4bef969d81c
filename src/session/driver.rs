//! Session driver: executes the state machine against the real world.
//!
//! One task owns the session. Every trigger — intents from the presenter,
//! relay events, peer-link callbacks, timer firings — lands in a single
//! queue, so transitions never interleave. Timers send events instead of
//! acting directly; a timer that fires under stale state is neutralized by
//! the transition function. Teardown runs exactly once per session no
//! matter which exit path wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use super::state::{CallSession, Effect, ReturnDelay, SessionEvent, SessionState};
use crate::config::SessionConfig;
use crate::media::{MediaEndpoint, MediaSource};
use crate::rest::StatusNotifier;
use crate::signaling::{
    CallId, ChannelFactory, EV_END_CALL, EV_START_CALL, SignalEvent, SignalingChannel,
    end_call_payload, start_call_payload,
};

/// Read model published to the presenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub status: SessionState,
    pub call_id: Option<CallId>,
    pub elapsed_seconds: u64,
    pub error_message: Option<String>,
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub remote_media: bool,
    /// Set when the session decided to navigate back to the entry screen.
    pub returned: bool,
}

/// Immutable inputs for one call.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub callee_id: String,
    pub caller_name: String,
}

impl CallParams {
    pub fn new(callee_id: impl Into<String>, caller_name: impl Into<String>) -> Self {
        Self {
            callee_id: callee_id.into(),
            caller_name: caller_name.into(),
        }
    }
}

/// Presenter-facing handle: intents in, snapshots out.
///
/// Dropping the handle disposes the session, which forces a terminal
/// transition and teardown if none happened yet.
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    disposed: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub async fn confirm_call(&self) {
        self.send(SessionEvent::ConfirmCall).await;
    }

    pub async fn hang_up(&self) {
        self.send(SessionEvent::HangUp).await;
    }

    pub async fn toggle_mute(&self) {
        self.send(SessionEvent::ToggleMute).await;
    }

    pub async fn toggle_video(&self) {
        self.send(SessionEvent::ToggleVideo).await;
    }

    pub async fn switch_camera(&self) {
        self.send(SessionEvent::SwitchCamera).await;
    }

    /// Abrupt disposal (navigation away). Forces teardown out of band.
    pub fn dispose(&self) {
        self.disposed.notify_one();
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait for the driver task to finish.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn send(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: "Call/Session", "intent ignored, session already finished");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.disposed.notify_one();
    }
}

/// Owns one [`CallSession`] and its collaborators for the session's
/// lifetime. Constructed per call; nothing outlives the driver task.
pub struct SessionDriver {
    session: CallSession,
    config: SessionConfig,
    events_rx: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    channel_factory: Arc<dyn ChannelFactory>,
    channel: Option<Arc<dyn SignalingChannel>>,
    endpoint: MediaEndpoint,
    notifier: Option<StatusNotifier>,
    disposed: Arc<Notify>,
    signal_pump: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
    duration_clock: Option<JoinHandle<()>>,
    auto_return: Option<JoinHandle<()>>,
    teardown_done: bool,
    returned: bool,
    finished: bool,
}

impl SessionDriver {
    /// Create the session and start its driver task.
    pub fn spawn(
        config: SessionConfig,
        params: CallParams,
        channel_factory: Arc<dyn ChannelFactory>,
        source: Arc<dyn MediaSource>,
    ) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::channel(64);
        let session = CallSession::new(params.callee_id, params.caller_name);
        let endpoint = MediaEndpoint::new(source, config.ice_servers.clone(), events_tx.clone());
        let notifier = config
            .rest_base_url
            .clone()
            .map(StatusNotifier::new);
        let disposed = Arc::new(Notify::new());

        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&session, false));
        let driver = Self {
            session,
            config,
            events_rx,
            events_tx: events_tx.clone(),
            snapshot: snapshot_tx,
            channel_factory,
            channel: None,
            endpoint,
            notifier,
            disposed: disposed.clone(),
            signal_pump: None,
            ring_timer: None,
            duration_clock: None,
            auto_return: None,
            teardown_done: false,
            returned: false,
            finished: false,
        };
        let task = tokio::spawn(driver.run());

        SessionHandle {
            events: events_tx,
            snapshot: snapshot_rx,
            disposed,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        debug!(
            target: "Call/Session",
            "session driver started for callee {}",
            self.session.callee_id()
        );
        let disposed = self.disposed.clone();
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                        if self.finished {
                            break;
                        }
                    }
                    None => break,
                },
                _ = disposed.notified() => {
                    self.dispatch(SessionEvent::Dispose).await;
                    break;
                }
            }
        }
        self.teardown().await;
        if let Some(pending) = self.auto_return.take() {
            pending.abort();
        }
        self.publish();
        debug!(target: "Call/Session", "session driver finished");
    }

    /// Run one inbound event, plus any follow-up events its effects
    /// produce, to completion.
    async fn dispatch(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::new();
        pending.push_back(event);

        while let Some(event) = pending.pop_front() {
            match event {
                SessionEvent::AutoReturn => {
                    self.mark_returned();
                    self.publish();
                }
                // Negotiation artifacts go straight to the endpoint; they
                // carry no call-state meaning. Stale ones (terminal
                // session) are dropped.
                SessionEvent::RemoteAnswer { sdp } => {
                    if self.session.state().is_terminal() {
                        continue;
                    }
                    if let Err(e) = self.endpoint.apply_remote_answer(sdp).await {
                        warn!(target: "Call/Session", "remote answer rejected: {e}");
                        pending.push_back(SessionEvent::NegotiationFailed {
                            detail: e.to_string(),
                        });
                    }
                }
                SessionEvent::RemoteCandidate { candidate } => {
                    if self.session.state().is_terminal() {
                        continue;
                    }
                    if let Err(e) = self.endpoint.add_remote_candidate(candidate).await {
                        debug!(target: "Call/Session", "candidate dropped: {e}");
                    }
                }
                event => {
                    if !matches!(event, SessionEvent::DurationTick) {
                        debug!(target: "Call/Session", "event: {event:?}");
                    }
                    let disposing = matches!(event, SessionEvent::Dispose);
                    let effects = self.session.apply(event);
                    for effect in effects {
                        let follow = self.perform(effect).await;
                        pending.extend(follow);
                    }
                    if disposing {
                        self.finished = true;
                    }
                    self.publish();
                }
            }
        }
    }

    /// Execute one effect; returns follow-up events to feed back through
    /// the state machine.
    async fn perform(&mut self, effect: Effect) -> Vec<SessionEvent> {
        match effect {
            Effect::StartSetup => self.start_setup().await,

            Effect::EmitStartCall => {
                let payload = start_call_payload(
                    self.session.callee_id(),
                    self.session.caller_name(),
                    self.config.want_video,
                );
                if let Err(e) = self.emit(EV_START_CALL, payload) {
                    warn!(target: "Call/Session", "start_call emit failed: {e}");
                    return vec![SessionEvent::SetupFailed {
                        detail: e.to_string(),
                    }];
                }
                Vec::new()
            }

            Effect::ArmRingTimeout => {
                let tx = self.events_tx.clone();
                let after = self.config.ring_timeout;
                self.ring_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(SessionEvent::RingTimeout).await;
                }));
                Vec::new()
            }

            Effect::DisarmRingTimeout => {
                if let Some(timer) = self.ring_timer.take() {
                    timer.abort();
                }
                Vec::new()
            }

            Effect::CreatePeerLink => {
                let call_id = self.session.call_id().cloned();
                match self.endpoint.create_peer_link(call_id).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![SessionEvent::NegotiationFailed {
                        detail: e.to_string(),
                    }],
                }
            }

            Effect::SendOffer { call_id } => {
                match self.endpoint.create_and_send_offer(&call_id).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![SessionEvent::NegotiationFailed {
                        detail: e.to_string(),
                    }],
                }
            }

            Effect::StartDurationClock => {
                let tx = self.events_tx.clone();
                self.duration_clock = Some(tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(1));
                    tick.tick().await; // first tick is immediate
                    loop {
                        tick.tick().await;
                        if tx.send(SessionEvent::DurationTick).await.is_err() {
                            break;
                        }
                    }
                }));
                Vec::new()
            }

            Effect::EmitEndCall { call_id } => {
                if let Err(e) = self.emit(EV_END_CALL, end_call_payload(&call_id)) {
                    warn!(target: "Call/Session", "end_call emit failed: {e}");
                }
                Vec::new()
            }

            Effect::NotifyRestEnd { call_id } => {
                if let Some(notifier) = self.notifier.clone() {
                    tokio::spawn(async move {
                        notifier.call_ended(&call_id).await;
                    });
                }
                Vec::new()
            }

            Effect::SetAudioMuted { muted } => {
                self.endpoint.toggle_audio(muted);
                Vec::new()
            }

            Effect::SetVideoEnabled { enabled } => {
                self.endpoint.toggle_video(enabled);
                Vec::new()
            }

            Effect::SwitchCamera => match self.endpoint.switch_camera().await {
                Ok(()) => Vec::new(),
                Err(e) => vec![SessionEvent::MediaDegraded {
                    detail: e.to_string(),
                }],
            },

            Effect::RunTeardown => {
                self.teardown().await;
                Vec::new()
            }

            Effect::ScheduleReturn { after } => {
                let delay = match after {
                    ReturnDelay::Immediate => Duration::ZERO,
                    ReturnDelay::AfterRejected => self.config.rejected_return_delay,
                    ReturnDelay::AfterEnded => self.config.ended_return_delay,
                };
                if delay.is_zero() {
                    self.mark_returned();
                } else {
                    let tx = self.events_tx.clone();
                    self.auto_return = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SessionEvent::AutoReturn).await;
                    }));
                }
                Vec::new()
            }
        }
    }

    /// Acquire devices (best effort) and connect the relay channel.
    async fn start_setup(&mut self) -> Vec<SessionEvent> {
        let mut follow = Vec::new();

        if let Err(e) = self
            .endpoint
            .acquire_local_media(self.config.want_audio, self.config.want_video)
            .await
        {
            follow.push(SessionEvent::MediaDegraded {
                detail: e.to_string(),
            });
        }

        match self
            .channel_factory
            .connect(self.session.caller_name())
            .await
        {
            Ok((channel, events)) => {
                self.endpoint.bind_signaling(channel.clone());
                self.channel = Some(channel);
                let tx = self.events_tx.clone();
                self.signal_pump = Some(tokio::spawn(pump_signals(events, tx)));
                follow.push(SessionEvent::ChannelReady);
            }
            Err(e) => {
                warn!(target: "Call/Session", "relay connect failed: {e}");
                follow.push(SessionEvent::SetupFailed {
                    detail: e.to_string(),
                });
            }
        }
        follow
    }

    fn emit(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), crate::error::ChannelError> {
        match &self.channel {
            Some(channel) => channel.emit(event, payload),
            None => Err(crate::error::ChannelError::Closed),
        }
    }

    /// Cancel all timers, release media, close the channel. Exactly once;
    /// never fails (release errors are logged inside the collaborators).
    async fn teardown(&mut self) {
        if self.teardown_done {
            return;
        }
        self.teardown_done = true;
        debug!(target: "Call/Session", "teardown");

        for task in [
            self.ring_timer.take(),
            self.duration_clock.take(),
            self.auto_return.take(),
            self.signal_pump.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.endpoint.dispose().await;
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    fn mark_returned(&mut self) {
        if !self.returned {
            self.returned = true;
            info!(target: "Call/Session", "returning to entry screen");
        }
        self.finished = true;
    }

    fn publish(&self) {
        self.snapshot.send_replace(snapshot_of(&self.session, self.returned));
    }
}

fn snapshot_of(session: &CallSession, returned: bool) -> CallSnapshot {
    CallSnapshot {
        status: session.state(),
        call_id: session.call_id().cloned(),
        elapsed_seconds: session.elapsed_seconds(),
        error_message: session.last_error().map(str::to_string),
        audio_muted: session.audio_muted(),
        video_enabled: session.video_enabled(),
        remote_media: session.remote_media(),
        returned,
    }
}

async fn pump_signals(mut events: mpsc::Receiver<SignalEvent>, tx: mpsc::Sender<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if tx.send(map_signal(event)).await.is_err() {
            break;
        }
    }
}

fn map_signal(event: SignalEvent) -> SessionEvent {
    match event {
        SignalEvent::CallStarted { call_id } => SessionEvent::CallRegistered { call_id },
        SignalEvent::CallAnswered { call_id } => SessionEvent::CalleeAnswered { call_id },
        SignalEvent::CallRejected { call_id } => SessionEvent::CalleeRejected { call_id },
        SignalEvent::CallEnded { call_id } => SessionEvent::PeerHungUp { call_id },
        SignalEvent::IncomingCall => SessionEvent::IncomingCall,
        SignalEvent::PeerAnswer { sdp } => SessionEvent::RemoteAnswer { sdp },
        SignalEvent::PeerCandidate { candidate } => SessionEvent::RemoteCandidate { candidate },
    }
}
