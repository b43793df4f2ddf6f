//! Wire protocol for the push channel
//!
//! Inbound frames are JSON objects `{"type": ..., "data": ..., "rev": n}` where
//! `rev` is an optional logical revision stamped by the authority. The set of
//! event types is closed: anything else decodes to [`DecodeError::UnknownType`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::view::{SessionConfig, SessionSnapshot, Slot};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    #[serde(alias = "idx")]
    pub index: u32,
    #[serde(default)]
    pub player_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessChange {
    #[serde(alias = "idx")]
    pub index: u32,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    #[serde(alias = "countdownSeconds", alias = "seconds")]
    pub countdown_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    #[serde(alias = "sessionId", alias = "game_id")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kick {
    #[serde(alias = "idx")]
    pub index: u32,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
    #[serde(default)]
    pub level: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default, alias = "detail")]
    pub message: String,
}

impl ServerError {
    /// The authority rejected our token; the session cannot continue
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self.code.as_str(),
            "401" | "403" | "4001" | "4003" | "unauthorized" | "forbidden"
        )
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Every event the authority can push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionSnapshot(SessionSnapshot),
    SlotUpdated(Slot),
    ParticipantJoined(Slot),
    ParticipantLeft(Departure),
    ReadinessChanged(ReadinessChange),
    ConfigChanged(SessionConfig),
    SessionStarting(Countdown),
    SessionStarted(SessionStart),
    ParticipantKicked(Kick),
    LogLine(LogLine),
    HeartbeatAck,
    Error(ServerError),
}

impl ServerEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionSnapshot(_) => "session_snapshot",
            ServerEvent::SlotUpdated(_) => "slot_updated",
            ServerEvent::ParticipantJoined(_) => "participant_joined",
            ServerEvent::ParticipantLeft(_) => "participant_left",
            ServerEvent::ReadinessChanged(_) => "readiness_changed",
            ServerEvent::ConfigChanged(_) => "config_changed",
            ServerEvent::SessionStarting(_) => "session_starting",
            ServerEvent::SessionStarted(_) => "session_started",
            ServerEvent::ParticipantKicked(_) => "participant_kicked",
            ServerEvent::LogLine(_) => "log_line",
            ServerEvent::HeartbeatAck => "heartbeat_ack",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Events that describe session state, as opposed to logs, acks and errors
    pub fn is_stateful(&self) -> bool {
        !matches!(
            self,
            ServerEvent::LogLine(_) | ServerEvent::HeartbeatAck | ServerEvent::Error(_)
        )
    }
}

/// A decoded frame: the event plus the authority's revision stamp, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub rev: Option<u64>,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn new(event: ServerEvent) -> Self {
        Self { rev: None, event }
    }

    pub fn with_rev(event: ServerEvent, rev: u64) -> Self {
        Self {
            rev: Some(rev),
            event,
        }
    }

    /// Serializes in the authority's frame format
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.event)?;
        if let (Some(rev), Value::Object(map)) = (self.rev, &mut value) {
            map.insert("rev".to_string(), Value::from(rev));
        }
        serde_json::to_string(&value)
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default, alias = "seq")]
    rev: Option<u64>,
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Decodes one inbound text frame
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let frame: RawFrame = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    let RawFrame { kind, data, rev } = frame;

    let event = match kind.as_str() {
        "session_snapshot" | "lobby_state" | "game_state" => {
            ServerEvent::SessionSnapshot(payload(&kind, data)?)
        }
        "slot_updated" => ServerEvent::SlotUpdated(payload(&kind, data)?),
        "participant_joined" | "player_joined" => {
            ServerEvent::ParticipantJoined(payload(&kind, data)?)
        }
        "participant_left" | "player_left" => ServerEvent::ParticipantLeft(payload(&kind, data)?),
        "readiness_changed" | "ready_changed" => {
            ServerEvent::ReadinessChanged(payload(&kind, data)?)
        }
        "config_changed" => ServerEvent::ConfigChanged(payload(&kind, data)?),
        "session_starting" | "game_starting" => {
            ServerEvent::SessionStarting(payload(&kind, data)?)
        }
        "session_started" | "game_started" => ServerEvent::SessionStarted(payload(&kind, data)?),
        "participant_kicked" | "player_kicked" => {
            ServerEvent::ParticipantKicked(payload(&kind, data)?)
        }
        "log_line" | "log" => ServerEvent::LogLine(payload(&kind, data)?),
        "heartbeat_ack" | "pong" => ServerEvent::HeartbeatAck,
        "error" => ServerEvent::Error(payload(&kind, data)?),
        _ => return Err(DecodeError::UnknownType(kind)),
    };

    Ok(Envelope { rev, event })
}

/// Frames the client sends on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    SetReady { ready: bool },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{SessionStatus, SlotKind};

    #[test]
    fn test_decode_readiness_changed() {
        let envelope =
            decode(r#"{"type":"readiness_changed","data":{"idx":0,"ready":true},"rev":4}"#)
                .unwrap();

        assert_eq!(envelope.rev, Some(4));
        assert_eq!(
            envelope.event,
            ServerEvent::ReadinessChanged(ReadinessChange {
                index: 0,
                ready: true
            })
        );
    }

    #[test]
    fn test_decode_snapshot_alias() {
        let raw = r#"{"type":"lobby_state","data":{
            "lobby_id":"abc",
            "status":"countdown",
            "countdown_seconds":5,
            "slots":[{"index":0,"kind":"human","player_id":"p1","is_host":true}]
        }}"#;

        match decode(raw).unwrap().event {
            ServerEvent::SessionSnapshot(snapshot) => {
                assert_eq!(snapshot.session_id, "abc");
                assert_eq!(snapshot.status, SessionStatus::Starting);
                assert_eq!(snapshot.slots[0].kind, SlotKind::Human);
                assert!(snapshot.slots[0].is_host);
            }
            other => panic!("Wrong event after decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_session_starting_camel_case() {
        let envelope =
            decode(r#"{"type":"session_starting","data":{"countdownSeconds":5}}"#).unwrap();
        assert_eq!(
            envelope.event,
            ServerEvent::SessionStarting(Countdown {
                countdown_seconds: 5
            })
        );
    }

    #[test]
    fn test_decode_heartbeat_without_data() {
        let envelope = decode(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(envelope.event, ServerEvent::HeartbeatAck);
        assert_eq!(envelope.rev, None);
    }

    #[test]
    fn test_decode_error_with_numeric_code() {
        match decode(r#"{"type":"error","data":{"code":4001,"detail":"bad token"}}"#)
            .unwrap()
            .event
        {
            ServerEvent::Error(err) => {
                assert_eq!(err.code, "4001");
                assert_eq!(err.message, "bad token");
                assert!(err.is_unauthorized());
            }
            other => panic!("Wrong event after decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode(r#"{"type":"fireworks","data":{}}"#) {
            Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "fireworks"),
            other => panic!("Expected unknown type, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"data":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_invalid_payload() {
        match decode(r#"{"type":"readiness_changed","data":{"ready":"yes"}}"#) {
            Err(DecodeError::InvalidPayload { kind, .. }) => assert_eq!(kind, "readiness_changed"),
            other => panic!("Expected invalid payload, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_encode_matches_wire_format() {
        let envelope = Envelope::with_rev(
            ServerEvent::SessionStarted(SessionStart {
                session_id: "game-7".to_string(),
            }),
            12,
        );
        let raw = envelope.encode().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["type"], "session_started");
        assert_eq!(value["data"]["session_id"], "game-7");
        assert_eq!(value["rev"], 12);
        assert_eq!(decode(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_client_frames() {
        assert_eq!(ClientFrame::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(
            ClientFrame::SetReady { ready: true }.encode().unwrap(),
            r#"{"type":"set_ready","data":{"ready":true}}"#
        );
    }

    #[test]
    fn test_stateful_classification() {
        assert!(!ServerEvent::HeartbeatAck.is_stateful());
        assert!(ServerEvent::ConfigChanged(SessionConfig::default()).is_stateful());
        assert_eq!(ServerEvent::HeartbeatAck.kind(), "heartbeat_ack");
    }
}
