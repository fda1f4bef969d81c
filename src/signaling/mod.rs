//! Relay signaling: wire events and the channel transport.
//!
//! - [`SignalEvent`]: typed inbound events from the relay
//! - [`SignalingChannel`] / [`ChannelFactory`]: the transport seam
//! - [`WsChannelFactory`]: WebSocket implementation with transparent
//!   reconnection

mod channel;
mod event;

pub use channel::{ChannelFactory, SignalingChannel, WsChannelFactory};
pub use event::{
    CallId, EV_CALL_ANSWERED, EV_CALL_ENDED, EV_CALL_REJECTED, EV_CALL_STARTED, EV_END_CALL,
    EV_ICE_CANDIDATE, EV_INCOMING_CALL, EV_START_CALL, EV_WEBRTC_ANSWER, EV_WEBRTC_OFFER,
    SignalEvent, SignalParseError, candidate_payload, end_call_payload, envelope, offer_payload,
    start_call_payload,
};
