use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

/// Frame discriminants used on the control connection.
pub mod frame_type {
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const CANDIDATE: &str = "CANDIDATE";
    pub const OFFER: &str = "OFFER";
    pub const ANSWER: &str = "ANSWER";
    pub const OPEN: &str = "OPEN";
    pub const ERROR: &str = "ERROR";
    pub const ID_TAKEN: &str = "ID-TAKEN";
    pub const INVALID_KEY: &str = "INVALID-KEY";
    pub const LEAVE: &str = "LEAVE";
    pub const EXPIRE: &str = "EXPIRE";
}

/// One JSON frame on the control connection.
///
/// The discriminant stays a raw string so frames with types this crate does
/// not recognize still decode and can be surfaced as unrecognized-message
/// events instead of being dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
}

impl Frame {
    pub fn heartbeat() -> Self {
        Self {
            kind: frame_type::HEARTBEAT.to_string(),
            payload: None,
            src: None,
            dst: None,
        }
    }

    /// Outbound OFFER/ANSWER/CANDIDATE frame addressed to a remote identity.
    pub fn signal(kind: &str, dst: &str, payload: SignalPayload) -> Result<Self, SignalingError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| SignalingError::Malformed(format!("unserializable signal payload: {err}")))?;
        Ok(Self {
            kind: kind.to_string(),
            payload: Some(payload),
            src: None,
            dst: Some(dst.to_string()),
        })
    }

    /// Message text of an ERROR frame payload, if the server supplied one.
    pub fn error_message(&self) -> String {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("msg"))
            .map(|msg| match msg {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "unknown server error".to_string())
    }
}

/// Payload of an OFFER/ANSWER/CANDIDATE frame: the connection id scoping the
/// exchange plus the opaque negotiation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalPayload {
    pub id: String,
    pub signal: Value,
}

/// Frame type for a peer-produced signal payload, or `None` when the payload
/// should not be sent at all (incomplete candidate gathering events).
pub fn classify_signal(signal: &Value) -> Option<&'static str> {
    match signal.get("type").and_then(Value::as_str) {
        Some("offer") => Some(frame_type::OFFER),
        Some("answer") => Some(frame_type::ANSWER),
        _ if has_candidate(signal) => Some(frame_type::CANDIDATE),
        _ => None,
    }
}

/// A well-formed candidate payload carries a non-empty `candidate.candidate`
/// string. Presence of the field alone is not enough: empty candidates mark
/// end-of-gathering and must not be forwarded.
pub fn has_candidate(signal: &Value) -> bool {
    signal
        .get("candidate")
        .and_then(|candidate| candidate.get("candidate"))
        .and_then(Value::as_str)
        .is_some_and(|text| !text.is_empty())
}
