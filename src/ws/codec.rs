//! Wire format of the real-time channel.
//!
//! Every frame is a JSON object `{ "type": ..., ...payload, "messageId"?: u64 }`.
//! The `ping`, `pong` and `ack` types are reserved for channel plumbing; every
//! other type is an application event handed to subscribers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::error::TransportError;
use crate::Result;
use crate::error::Error;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const ACK: &str = "ack";
pub const MESSAGE_ID: &str = "messageId";

/// An application event received over the channel or from the fallback poller.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Event type used to route the event to subscribers
    #[serde(rename = "type")]
    pub event_type: String,
    /// Remaining fields of the frame
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl InboundEvent {
    #[must_use]
    pub fn new<S: Into<String>>(event_type: S, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Look up a single payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Deserialize the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Ping,
    Pong,
    Ack { message_id: u64 },
    Event(InboundEvent),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(rename = "messageId", default)]
    message_id: Option<u64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl TryFrom<RawFrame> for Frame {
    type Error = TransportError;

    fn try_from(raw: RawFrame) -> std::result::Result<Self, Self::Error> {
        match raw.frame_type.as_str() {
            PING => Ok(Self::Ping),
            PONG => Ok(Self::Pong),
            ACK => raw
                .message_id
                .map(|message_id| Self::Ack { message_id })
                .ok_or_else(|| TransportError::InvalidMessage("ack without messageId".to_owned())),
            "" => Err(TransportError::InvalidMessage("empty frame type".to_owned())),
            _ => Ok(Self::Event(InboundEvent {
                event_type: raw.frame_type,
                payload: raw.rest,
            })),
        }
    }
}

/// Decode a text frame. Blank frames are keepalives and decode to `None`.
pub(crate) fn decode(text: &str) -> std::result::Result<Option<Frame>, TransportError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let raw: RawFrame = serde_json::from_str(text).map_err(TransportError::MessageParse)?;
    Frame::try_from(raw).map(Some)
}

/// Decode one element of a poll response.
pub(crate) fn decode_value(value: Value) -> std::result::Result<Frame, TransportError> {
    let raw: RawFrame = serde_json::from_value(value).map_err(TransportError::MessageParse)?;
    Frame::try_from(raw)
}

/// Serialize an outbound command and check it can travel as a frame.
pub(crate) fn command_payload<R: Serialize>(command: &R) -> Result<Map<String, Value>> {
    let Value::Object(payload) = serde_json::to_value(command)? else {
        return Err(Error::validation("commands must serialize to a JSON object"));
    };

    if payload.contains_key(MESSAGE_ID) {
        return Err(Error::validation(format!(
            "`{MESSAGE_ID}` is assigned by the client and cannot be set on a command"
        )));
    }

    match payload.get("type") {
        Some(Value::String(kind)) if matches!(kind.as_str(), PING | PONG | ACK) => Err(
            Error::validation(format!("`{kind}` is a reserved frame type")),
        ),
        Some(Value::String(kind)) if !kind.is_empty() => Ok(payload),
        _ => Err(Error::validation("commands must carry a string `type` field")),
    }
}

pub(crate) fn encode(payload: &Map<String, Value>, message_id: Option<u64>) -> String {
    let mut frame = payload.clone();
    if let Some(id) = message_id {
        frame.insert(MESSAGE_ID.to_owned(), Value::from(id));
    }
    Value::Object(frame).to_string()
}

pub(crate) fn ping() -> String {
    json!({ "type": PING }).to_string()
}

pub(crate) fn pong() -> String {
    json!({ "type": PONG }).to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_application_event_without_message_id() {
        let frame = decode(r#"{"type":"analysis_progress","analysisId":"a1","percent":40,"messageId":3}"#)
            .unwrap()
            .unwrap();

        let Frame::Event(event) = frame else {
            panic!("expected an application event, got {frame:?}");
        };
        assert_eq!(event.event_type, "analysis_progress");
        assert_eq!(event.get("percent"), Some(&json!(40)));
        assert!(event.get(MESSAGE_ID).is_none(), "messageId must be stripped");
    }

    #[test]
    fn decodes_plumbing_frames() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), Some(Frame::Ping));
        assert_eq!(decode(r#"{"type":"pong"}"#).unwrap(), Some(Frame::Pong));
        assert_eq!(
            decode(r#"{"type":"ack","messageId":17}"#).unwrap(),
            Some(Frame::Ack { message_id: 17 })
        );
    }

    #[test]
    fn blank_frames_are_keepalives() {
        assert_eq!(decode("  \n").unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            decode("{not json"),
            Err(TransportError::MessageParse(_))
        ));
        assert!(matches!(
            decode(r#"["analysis_complete"]"#),
            Err(TransportError::MessageParse(_))
        ));
        assert!(matches!(
            decode(r#"{"payload":1}"#),
            Err(TransportError::MessageParse(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"ack"}"#),
            Err(TransportError::InvalidMessage(_))
        ));
        assert!(matches!(
            decode(r#"{"type":""}"#),
            Err(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn encode_adds_message_id_only_when_assigned() {
        let payload = command_payload(&json!({ "type": "cancel_analysis", "analysisId": "a1" })).unwrap();

        let plain: Value = serde_json::from_str(&encode(&payload, None)).unwrap();
        assert_eq!(plain, json!({ "type": "cancel_analysis", "analysisId": "a1" }));

        let tracked: Value = serde_json::from_str(&encode(&payload, Some(9))).unwrap();
        assert_eq!(
            tracked,
            json!({ "type": "cancel_analysis", "analysisId": "a1", "messageId": 9 })
        );
    }

    #[test]
    fn command_payload_rejects_invalid_commands() {
        assert!(command_payload(&json!(["start"])).is_err(), "arrays are not commands");
        assert!(command_payload(&json!({ "analysisId": "a1" })).is_err(), "type is required");
        assert!(command_payload(&json!({ "type": "ping" })).is_err(), "ping is reserved");
        assert!(
            command_payload(&json!({ "type": "start", "messageId": 1 })).is_err(),
            "messageId is client-assigned"
        );
    }

    #[test]
    fn typed_payload_extraction() {
        #[derive(Deserialize)]
        struct Progress {
            percent: u8,
        }

        let event = InboundEvent::new("analysis_progress", json!({ "percent": 75 }).as_object().cloned().unwrap());
        let progress: Progress = event.payload_as().unwrap();
        assert_eq!(progress.percent, 75);
    }
}
