//! Wire events exchanged with the signaling relay.
//!
//! Every frame is one JSON object: `{"event": <name>, "data": <payload>}`.
//! The visitor side is caller-only: `incoming_call` is parsed so the branch
//! is explicit, then discarded by the session.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Outbound event names.
pub const EV_START_CALL: &str = "start_call";
pub const EV_END_CALL: &str = "end_call";
pub const EV_WEBRTC_OFFER: &str = "webrtc_offer";
pub const EV_ICE_CANDIDATE: &str = "ice_candidate";

/// Inbound event names.
pub const EV_CALL_STARTED: &str = "call_started";
pub const EV_CALL_ANSWERED: &str = "call_answered";
pub const EV_CALL_REJECTED: &str = "call_rejected";
pub const EV_CALL_ENDED: &str = "call_ended";
pub const EV_INCOMING_CALL: &str = "incoming_call";
pub const EV_WEBRTC_ANSWER: &str = "webrtc_answer";

/// Opaque call identifier assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SignalParseError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// A relay event the session consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// The relay registered the call and issued its id.
    CallStarted { call_id: CallId },
    /// The resident accepted.
    CallAnswered { call_id: CallId },
    /// The resident declined or was unreachable.
    CallRejected { call_id: CallId },
    /// The call was terminated by the other side.
    CallEnded { call_id: CallId },
    /// Caller-only client: observed and discarded.
    IncomingCall,
    /// Remote session description answering our offer.
    PeerAnswer { sdp: String },
    /// Remote ICE candidate for the peer link.
    PeerCandidate { candidate: Value },
}

impl SignalEvent {
    /// Parse one wire frame. Unknown event names yield `Ok(None)` so new
    /// relay events never break older clients.
    pub fn parse(text: &str) -> Result<Option<Self>, SignalParseError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let data = &envelope.data;
        let event = match envelope.event.as_str() {
            EV_CALL_STARTED => Self::CallStarted {
                call_id: required_call_id(data)?,
            },
            EV_CALL_ANSWERED => Self::CallAnswered {
                call_id: required_call_id(data)?,
            },
            EV_CALL_REJECTED => Self::CallRejected {
                call_id: required_call_id(data)?,
            },
            EV_CALL_ENDED => Self::CallEnded {
                call_id: required_call_id(data)?,
            },
            EV_INCOMING_CALL => Self::IncomingCall,
            EV_WEBRTC_ANSWER => Self::PeerAnswer {
                sdp: data
                    .get("sdp")
                    .and_then(Value::as_str)
                    .ok_or(SignalParseError::MissingField("sdp"))?
                    .to_string(),
            },
            EV_ICE_CANDIDATE => Self::PeerCandidate {
                candidate: data
                    .get("candidate")
                    .cloned()
                    .ok_or(SignalParseError::MissingField("candidate"))?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn required_call_id(data: &Value) -> Result<CallId, SignalParseError> {
    data.get("callId")
        .and_then(Value::as_str)
        .map(CallId::new)
        .ok_or(SignalParseError::MissingField("callId"))
}

/// Serialize an outbound frame.
pub fn envelope(event: &str, data: Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        event: event.to_string(),
        data,
    })
}

pub fn start_call_payload(callee_id: &str, caller_name: &str, video: bool) -> Value {
    json!({
        "calleeId": callee_id,
        "callerName": caller_name,
        "type": if video { "video" } else { "audio" },
    })
}

pub fn end_call_payload(call_id: &CallId) -> Value {
    json!({ "callId": call_id })
}

pub fn offer_payload(call_id: &CallId, sdp: &str) -> Value {
    json!({ "callId": call_id, "sdp": sdp })
}

pub fn candidate_payload(call_id: Option<&CallId>, candidate: Value) -> Value {
    match call_id {
        Some(id) => json!({ "callId": id, "candidate": candidate }),
        None => json!({ "candidate": candidate }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_lifecycle_events() {
        let ev = SignalEvent::parse(r#"{"event":"call_started","data":{"callId":"c1"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            SignalEvent::CallStarted {
                call_id: CallId::new("c1")
            }
        );

        let ev = SignalEvent::parse(r#"{"event":"call_answered","data":{"callId":"c1"}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(ev, SignalEvent::CallAnswered { .. }));

        let ev = SignalEvent::parse(r#"{"event":"call_ended","data":{"callId":"c1"}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(ev, SignalEvent::CallEnded { .. }));
    }

    #[test]
    fn incoming_call_needs_no_payload() {
        let ev = SignalEvent::parse(r#"{"event":"incoming_call"}"#).unwrap().unwrap();
        assert_eq!(ev, SignalEvent::IncomingCall);
    }

    #[test]
    fn unknown_events_are_tolerated() {
        assert!(
            SignalEvent::parse(r#"{"event":"chat_message","data":{"text":"hi"}}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn missing_call_id_is_an_error() {
        let err = SignalEvent::parse(r#"{"event":"call_started","data":{}}"#).unwrap_err();
        assert!(matches!(err, SignalParseError::MissingField("callId")));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(SignalEvent::parse("not json").is_err());
    }

    #[test]
    fn outbound_envelope_round_trips() {
        let text = envelope(
            EV_START_CALL,
            start_call_payload("unit-12", "Visitor", true),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "start_call");
        assert_eq!(value["data"]["calleeId"], "unit-12");
        assert_eq!(value["data"]["type"], "video");
    }

    #[test]
    fn answer_carries_sdp() {
        let ev = SignalEvent::parse(r#"{"event":"webrtc_answer","data":{"callId":"c1","sdp":"v=0"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            SignalEvent::PeerAnswer {
                sdp: "v=0".to_string()
            }
        );
    }
}
