//! End-to-end call flows on simulated time, with the relay and devices
//! replaced by doubles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use gatecall::error::{ChannelError, MediaError};
use gatecall::media::{CameraFacing, MediaFeed, MediaSource, RTCRtpCodecCapability};
use gatecall::signaling::{CallId, ChannelFactory, SignalEvent, SignalingChannel};
use gatecall::{CallParams, CallSnapshot, SessionConfig, SessionDriver, SessionState};

struct MockChannel {
    sent: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

#[async_trait]
impl SignalingChannel for MockChannel {
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Relay double: hands out one mock channel and lets the test inject
/// inbound events.
struct RelayDouble {
    channel: Arc<MockChannel>,
    inject: Mutex<Option<mpsc::Sender<SignalEvent>>>,
    fail_connect: bool,
}

impl RelayDouble {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            channel: Arc::new(MockChannel {
                sent: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            }),
            inject: Mutex::new(None),
            fail_connect: false,
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            channel: Arc::new(MockChannel {
                sent: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            }),
            inject: Mutex::new(None),
            fail_connect: true,
        })
    }

    async fn push(&self, event: SignalEvent) {
        let tx = self
            .inject
            .lock()
            .unwrap()
            .clone()
            .expect("relay not connected yet");
        tx.send(event).await.expect("session stopped listening");
    }

    fn sent_events(&self) -> Vec<String> {
        self.channel
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    fn payload_of(&self, event: &str) -> Option<Value> {
        self.channel
            .sent
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
    }

    fn closes(&self) -> usize {
        self.channel.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelFactory for RelayDouble {
    async fn connect(
        &self,
        _identity: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalEvent>), ChannelError> {
        if self.fail_connect {
            return Err(ChannelError::Unreachable("relay down".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.inject.lock().unwrap() = Some(tx);
        Ok((self.channel.clone() as Arc<dyn SignalingChannel>, rx))
    }
}

struct FakeMedia {
    fail: bool,
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn open_audio(&self) -> Result<MediaFeed, MediaError> {
        if self.fail {
            return Err(MediaError::device_unavailable("no devices in test"));
        }
        let (_tx, rx) = mpsc::channel(4);
        Ok(MediaFeed {
            codec: RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            frames: rx,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn open_video(&self, _facing: CameraFacing) -> Result<MediaFeed, MediaError> {
        Err(MediaError::device_unavailable("no camera in test"))
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        relay_url: "ws://unused.test".to_string(),
        rest_base_url: None,
        ice_servers: Vec::new(),
        connect_timeout: Duration::from_secs(1),
        ring_timeout: Duration::from_secs(45),
        rejected_return_delay: Duration::from_secs(3),
        ended_return_delay: Duration::from_secs(2),
        want_audio: true,
        want_video: false,
    }
}

fn spawn_call(
    relay: Arc<RelayDouble>,
    media_fails: bool,
) -> gatecall::SessionHandle {
    SessionDriver::spawn(
        test_config(),
        CallParams::new("unit-12", "Visitor"),
        relay,
        Arc::new(FakeMedia { fail: media_fails }),
    )
}

async fn wait_for(
    rx: &mut watch::Receiver<CallSnapshot>,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    loop {
        {
            let snapshot = rx.borrow().clone();
            if pred(&snapshot) {
                return snapshot;
            }
        }
        rx.changed().await.expect("session driver ended early");
    }
}

/// Scenario: call accepted; peer link prepared at call_started, offer sent
/// with the relay call id, duration clock ticking once connected.
#[tokio::test(start_paused = true)]
async fn call_connects_and_duration_ticks() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;

    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c1"),
        })
        .await;
    relay
        .push(SignalEvent::CallAnswered {
            call_id: CallId::new("c1"),
        })
        .await;

    let snapshot = wait_for(&mut rx, |s| s.status == SessionState::Connected).await;
    assert_eq!(snapshot.call_id.as_ref().unwrap().as_str(), "c1");

    let offer = relay.payload_of("webrtc_offer").expect("offer relayed");
    assert_eq!(offer["callId"], "c1");
    assert!(relay.sent_events().contains(&"start_call".to_string()));

    let snapshot = wait_for(&mut rx, |s| s.elapsed_seconds >= 1).await;
    assert!(snapshot.elapsed_seconds >= 1);
    assert_eq!(snapshot.status, SessionState::Connected);

    handle.hang_up().await;
    let snapshot = wait_for(&mut rx, |s| s.returned).await;
    assert_eq!(snapshot.status, SessionState::Ended);
    assert!(relay.sent_events().contains(&"end_call".to_string()));
    assert_eq!(relay.closes(), 1);
    handle.finished().await;
}

/// Scenario: no response for 45 simulated seconds, then the auto-return
/// fires once, and further time changes nothing.
#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_returns_once() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    let snapshot = wait_for(&mut rx, |s| s.returned).await;
    assert_eq!(snapshot.status, SessionState::Rejected);
    assert_eq!(snapshot.elapsed_seconds, 0);
    assert_eq!(relay.closes(), 1);
    handle.finished().await;

    // Teardown cancelled the timers: advancing simulated time is inert.
    tokio::time::sleep(Duration::from_secs(120)).await;
    let after = handle.snapshot();
    assert_eq!(after, snapshot);
    assert_eq!(relay.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_by_resident_returns_after_delay() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;
    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c2"),
        })
        .await;
    relay
        .push(SignalEvent::CallRejected {
            call_id: CallId::new("c2"),
        })
        .await;

    let snapshot = wait_for(&mut rx, |s| s.returned).await;
    assert_eq!(snapshot.status, SessionState::Rejected);
    assert_eq!(relay.closes(), 1);
    handle.finished().await;
}

#[tokio::test(start_paused = true)]
async fn remote_hangup_ends_the_call() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;
    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c3"),
        })
        .await;
    relay
        .push(SignalEvent::CallAnswered {
            call_id: CallId::new("c3"),
        })
        .await;
    wait_for(&mut rx, |s| s.status == SessionState::Connected).await;

    relay
        .push(SignalEvent::CallEnded {
            call_id: CallId::new("c3"),
        })
        .await;
    let snapshot = wait_for(&mut rx, |s| s.returned).await;
    assert_eq!(snapshot.status, SessionState::Ended);
    assert_eq!(relay.closes(), 1);
    handle.finished().await;
}

/// Camera/microphone failure degrades the call instead of blocking it.
#[tokio::test(start_paused = true)]
async fn media_failure_still_reaches_connected() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), true);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    let snapshot = wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;
    assert!(snapshot.error_message.is_some());

    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c4"),
        })
        .await;
    relay
        .push(SignalEvent::CallAnswered {
            call_id: CallId::new("c4"),
        })
        .await;
    let snapshot = wait_for(&mut rx, |s| s.status == SessionState::Connected).await;
    assert!(snapshot.error_message.is_some());
    handle.hang_up().await;
    handle.finished().await;
}

#[tokio::test(start_paused = true)]
async fn relay_connect_failure_fails_the_session() {
    let relay = RelayDouble::unreachable();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    let snapshot = wait_for(&mut rx, |s| s.status == SessionState::Failed).await;
    assert!(snapshot.error_message.as_deref().unwrap().contains("relay"));
    assert!(!snapshot.returned);

    handle.dispose();
    handle.finished().await;
}

/// The visitor is caller-only: an incoming_call event must not disturb an
/// outgoing call.
#[tokio::test(start_paused = true)]
async fn incoming_call_event_is_discarded() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;
    relay.push(SignalEvent::IncomingCall).await;
    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c5"),
        })
        .await;

    let snapshot = wait_for(&mut rx, |s| s.call_id.is_some()).await;
    assert_eq!(snapshot.status, SessionState::Ringing);
    handle.dispose();
    handle.finished().await;
}

/// Navigation away mid-ring: teardown runs, no auto-return is scheduled.
#[tokio::test(start_paused = true)]
async fn dispose_mid_ring_tears_down_without_return() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;

    handle.dispose();
    handle.finished().await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, SessionState::Ended);
    assert!(!snapshot.returned);
    assert_eq!(relay.closes(), 1);
}

/// Cancelling during ring still notifies the relay when a call id exists
/// and returns immediately.
#[tokio::test(start_paused = true)]
async fn hangup_while_ringing_cancels_the_call() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;
    relay
        .push(SignalEvent::CallStarted {
            call_id: CallId::new("c6"),
        })
        .await;
    wait_for(&mut rx, |s| s.call_id.is_some()).await;

    handle.hang_up().await;
    let snapshot = wait_for(&mut rx, |s| s.returned).await;
    assert_eq!(snapshot.status, SessionState::Ended);
    assert!(relay.sent_events().contains(&"end_call".to_string()));
    assert_eq!(relay.closes(), 1);
    handle.finished().await;
}

/// Mute and camera toggles surface in the read model.
#[tokio::test(start_paused = true)]
async fn toggles_update_the_read_model() {
    let relay = RelayDouble::new();
    let mut handle = spawn_call(relay.clone(), false);
    let mut rx = handle.subscribe();

    handle.confirm_call().await;
    wait_for(&mut rx, |s| s.status == SessionState::Ringing).await;

    handle.toggle_mute().await;
    let snapshot = wait_for(&mut rx, |s| s.audio_muted).await;
    assert!(snapshot.audio_muted);

    handle.toggle_video().await;
    let snapshot = wait_for(&mut rx, |s| !s.video_enabled).await;
    assert!(!snapshot.video_enabled);

    handle.dispose();
    handle.finished().await;
}
