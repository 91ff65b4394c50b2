use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{MessageInfo, Part, Session, SessionStatus};

/// Serializes in the flat client wire form, e.g.
/// `{"type":"chunk","sessionId":"ses_1","delta":"po"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        session_id: String,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    MessageUpdated {
        session_id: String,
        message: MessageInfo,
    },
    /// Incremental output for a message part.
    Chunk {
        session_id: String,
        message_id: Option<String>,
        part: Option<Part>,
        delta: Option<String>,
    },
    /// The session finished its turn and is idle again.
    Complete {
        session_id: String,
    },
    Error {
        session_id: Option<String>,
        message: String,
    },
    /// Delivery marker: this subscriber's mailbox overflowed and `dropped`
    /// older events were discarded.
    Lagged {
        dropped: u64,
    },
    /// Delivery marker: the event connection dropped. Events may have been
    /// missed; re-fetch authoritative state.
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    SessionStatus,
    MessageUpdated,
    Chunk,
    Complete,
    Error,
    Lagged,
    Disconnected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session-created",
            Self::SessionUpdated => "session-updated",
            Self::SessionDeleted => "session-deleted",
            Self::SessionStatus => "session-status",
            Self::MessageUpdated => "message-updated",
            Self::Chunk => "chunk",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Lagged => "lagged",
            Self::Disconnected => "disconnected",
        }
    }

    fn from_wire(event_type: &str) -> Option<Self> {
        let kind = match event_type {
            "session-created" | "session.created" => Self::SessionCreated,
            "session-updated" | "session.updated" => Self::SessionUpdated,
            "session-deleted" | "session.deleted" => Self::SessionDeleted,
            "session-status" | "session.status" => Self::SessionStatus,
            "message-updated" | "message.updated" => Self::MessageUpdated,
            "chunk" | "message.part.updated" => Self::Chunk,
            "complete" | "session.idle" => Self::Complete,
            "error" | "session.error" => Self::Error,
            _ => return None,
        };
        Some(kind)
    }
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionCreated { .. } => EventKind::SessionCreated,
            Self::SessionUpdated { .. } => EventKind::SessionUpdated,
            Self::SessionDeleted { .. } => EventKind::SessionDeleted,
            Self::SessionStatus { .. } => EventKind::SessionStatus,
            Self::MessageUpdated { .. } => EventKind::MessageUpdated,
            Self::Chunk { .. } => EventKind::Chunk,
            Self::Complete { .. } => EventKind::Complete,
            Self::Error { .. } => EventKind::Error,
            Self::Lagged { .. } => EventKind::Lagged,
            Self::Disconnected { .. } => EventKind::Disconnected,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session } | Self::SessionUpdated { session } => {
                Some(session.id.as_str())
            }
            Self::SessionDeleted { session_id }
            | Self::SessionStatus { session_id, .. }
            | Self::MessageUpdated { session_id, .. }
            | Self::Chunk { session_id, .. }
            | Self::Complete { session_id } => Some(session_id.as_str()),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Lagged { .. } | Self::Disconnected { .. } => None,
        }
    }

    /// Markers produced by the client rather than decoded from the server.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Lagged { .. } | Self::Disconnected { .. })
    }

    /// Whether this event ends the current turn of `session_id`.
    pub fn ends_turn(&self, session_id: &str) -> bool {
        match self {
            Self::Complete { session_id: id } => id == session_id,
            Self::SessionStatus { session_id: id, status } => id == session_id && status.is_idle(),
            Self::Error {
                session_id: Some(id),
                ..
            } => id == session_id,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame has no `type` field")]
    MissingType,
    #[error("invalid `{event_type}` payload: {message}")]
    InvalidPayload { event_type: String, message: String },
    #[error("`{event_type}` frame has no session id")]
    MissingSessionId { event_type: String },
}

/// Decode one SSE data payload. `Ok(None)` means a well-formed frame of a type
/// the client does not track (heartbeats, server lifecycle, ...).
pub fn decode_event(data: &str) -> Result<Option<StreamEvent>, EventDecodeError> {
    let value: Value = serde_json::from_str(data)?;
    decode_value(&value)
}

pub fn decode_value(value: &Value) -> Result<Option<StreamEvent>, EventDecodeError> {
    // `/global/event` wraps each event as `{ directory, payload }`.
    let frame = match value.get("payload") {
        Some(payload) if payload.get("type").is_some() => payload,
        _ => value,
    };
    let event_type = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EventDecodeError::MissingType)?;
    let Some(kind) = EventKind::from_wire(event_type) else {
        return Ok(None);
    };
    let props = frame.get("properties").unwrap_or(frame);

    let event = match kind {
        EventKind::SessionCreated => StreamEvent::SessionCreated {
            session: session_payload(event_type, props)?,
        },
        EventKind::SessionUpdated => StreamEvent::SessionUpdated {
            session: session_payload(event_type, props)?,
        },
        EventKind::SessionDeleted => {
            let session_id = find_session_id(frame, props)
                .or_else(|| info_id(props))
                .ok_or_else(|| missing_session(event_type))?;
            StreamEvent::SessionDeleted { session_id }
        }
        EventKind::SessionStatus => {
            let session_id =
                find_session_id(frame, props).ok_or_else(|| missing_session(event_type))?;
            let status = props
                .get("status")
                .ok_or_else(|| invalid(event_type, "missing status"))
                .and_then(|status| parse_status(event_type, status))?;
            StreamEvent::SessionStatus { session_id, status }
        }
        EventKind::MessageUpdated => {
            let message: MessageInfo = parse(
                event_type,
                props
                    .get("info")
                    .or_else(|| props.get("message"))
                    .ok_or_else(|| invalid(event_type, "missing message info"))?,
            )?;
            let session_id = find_session_id(frame, props).unwrap_or_else(|| message.session_id.clone());
            StreamEvent::MessageUpdated {
                session_id,
                message,
            }
        }
        EventKind::Chunk => {
            let part = props
                .get("part")
                .and_then(|part| serde_json::from_value::<Part>(part.clone()).ok());
            let session_id = find_session_id(frame, props)
                .or_else(|| part.as_ref().map(|part| part.session_id.clone()))
                .filter(|id| !id.is_empty())
                .ok_or_else(|| missing_session(event_type))?;
            let message_id = string_field(props, &["messageID", "messageId"])
                .or_else(|| part.as_ref().map(|part| part.message_id.clone()))
                .filter(|id| !id.is_empty());
            let delta = string_field(props, &["delta", "text"]);
            StreamEvent::Chunk {
                session_id,
                message_id,
                part,
                delta,
            }
        }
        EventKind::Complete => StreamEvent::Complete {
            session_id: find_session_id(frame, props).ok_or_else(|| missing_session(event_type))?,
        },
        EventKind::Error => StreamEvent::Error {
            session_id: find_session_id(frame, props),
            message: error_message(props),
        },
        EventKind::Lagged | EventKind::Disconnected => return Ok(None),
    };
    Ok(Some(event))
}

fn session_payload(event_type: &str, props: &Value) -> Result<Session, EventDecodeError> {
    let payload = props
        .get("info")
        .or_else(|| props.get("session"))
        .unwrap_or(props);
    parse(event_type, payload)
}

fn parse_status(event_type: &str, status: &Value) -> Result<SessionStatus, EventDecodeError> {
    // Some servers send the bare status name instead of `{ "type": ... }`.
    if let Some(name) = status.as_str() {
        return parse(event_type, &serde_json::json!({ "type": name }));
    }
    parse(event_type, status)
}

fn parse<T: DeserializeOwned>(event_type: &str, value: &Value) -> Result<T, EventDecodeError> {
    serde_json::from_value(value.clone()).map_err(|err| invalid(event_type, &err.to_string()))
}

fn find_session_id(frame: &Value, props: &Value) -> Option<String> {
    string_field(frame, &["sessionId", "sessionID"])
        .or_else(|| string_field(props, &["sessionID", "sessionId"]))
        .or_else(|| {
            props
                .get("info")
                .and_then(|info| string_field(info, &["sessionID", "sessionId"]))
        })
        .or_else(|| {
            props
                .get("part")
                .and_then(|part| string_field(part, &["sessionID", "sessionId"]))
        })
}

fn info_id(props: &Value) -> Option<String> {
    props
        .get("info")
        .and_then(|info| info.get("id"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(ToOwned::to_owned)
}

fn error_message(props: &Value) -> String {
    let error = props.get("error");
    error
        .and_then(|error| error.get("data"))
        .and_then(|data| data.get("message"))
        .and_then(Value::as_str)
        .or_else(|| error.and_then(|error| error.get("message")).and_then(Value::as_str))
        .or_else(|| error.and_then(Value::as_str))
        .or_else(|| props.get("message").and_then(Value::as_str))
        .or_else(|| error.and_then(|error| error.get("name")).and_then(Value::as_str))
        .unwrap_or("unknown error")
        .to_string()
}

fn invalid(event_type: &str, message: &str) -> EventDecodeError {
    EventDecodeError::InvalidPayload {
        event_type: event_type.to_string(),
        message: message.to_string(),
    }
}

fn missing_session(event_type: &str) -> EventDecodeError {
    EventDecodeError::MissingSessionId {
        event_type: event_type.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartKind;
    use serde_json::json;

    fn decode(value: Value) -> Option<StreamEvent> {
        decode_event(&value.to_string()).expect("decode")
    }

    #[test]
    fn decodes_flat_frames() {
        let event = decode(json!({"type": "chunk", "sessionId": "ses_1", "messageId": "msg_1", "text": "po"}));
        assert_eq!(
            event,
            Some(StreamEvent::Chunk {
                session_id: "ses_1".to_string(),
                message_id: Some("msg_1".to_string()),
                part: None,
                delta: Some("po".to_string()),
            })
        );

        let complete = decode(json!({"type": "complete", "sessionId": "ses_1"})).expect("complete");
        assert!(complete.ends_turn("ses_1"));
        assert!(!complete.ends_turn("ses_2"));

        let deleted = decode(json!({"type": "session-deleted", "sessionId": "ses_9"}));
        assert_eq!(
            deleted,
            Some(StreamEvent::SessionDeleted {
                session_id: "ses_9".to_string()
            })
        );
    }

    #[test]
    fn decodes_opencode_frames() {
        let created = decode(json!({
            "type": "session.created",
            "properties": {"info": {"id": "ses_1", "title": "t", "directory": "/w", "time": {"created": 1, "updated": 1}}}
        }))
        .expect("created");
        assert_eq!(created.kind(), EventKind::SessionCreated);
        assert_eq!(created.session_id(), Some("ses_1"));

        let status = decode(json!({
            "type": "session.status",
            "properties": {"sessionID": "ses_1", "status": {"type": "busy"}}
        }));
        assert_eq!(
            status,
            Some(StreamEvent::SessionStatus {
                session_id: "ses_1".to_string(),
                status: SessionStatus::Busy
            })
        );

        let message = decode(json!({
            "type": "message.updated",
            "properties": {"info": {"id": "msg_2", "sessionID": "ses_1", "role": "assistant", "time": {"created": 5}}}
        }))
        .expect("message");
        assert_eq!(message.session_id(), Some("ses_1"));

        let part = decode(json!({
            "type": "message.part.updated",
            "properties": {
                "part": {"id": "prt_1", "sessionID": "ses_1", "messageID": "msg_2", "type": "text", "text": "pong"},
                "delta": "ng"
            }
        }))
        .expect("part");
        match part {
            StreamEvent::Chunk {
                session_id,
                message_id,
                part: Some(part),
                delta,
            } => {
                assert_eq!(session_id, "ses_1");
                assert_eq!(message_id.as_deref(), Some("msg_2"));
                assert_eq!(delta.as_deref(), Some("ng"));
                assert_eq!(part.kind, PartKind::Text { text: "pong".to_string() });
            }
            other => panic!("unexpected {other:?}"),
        }

        let error = decode(json!({
            "type": "session.error",
            "properties": {"sessionID": "ses_1", "error": {"name": "APIError", "data": {"message": "quota"}}}
        }));
        assert_eq!(
            error,
            Some(StreamEvent::Error {
                session_id: Some("ses_1".to_string()),
                message: "quota".to_string()
            })
        );
    }

    #[test]
    fn unwraps_global_envelope() {
        let event = decode(json!({
            "directory": "/w",
            "payload": {"type": "session.idle", "properties": {"sessionID": "ses_3"}}
        }));
        assert_eq!(
            event,
            Some(StreamEvent::Complete {
                session_id: "ses_3".to_string()
            })
        );
    }

    #[test]
    fn ignores_untracked_types() {
        assert_eq!(decode(json!({"type": "server.heartbeat", "properties": {}})), None);
        assert_eq!(decode(json!({"type": "server.connected", "properties": {}})), None);
    }

    #[test]
    fn serializes_flat_form() {
        let event = StreamEvent::Chunk {
            session_id: "ses_1".to_string(),
            message_id: None,
            part: None,
            delta: Some("po".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&event).expect("serialize"),
            json!({"type": "chunk", "sessionId": "ses_1", "messageId": null, "part": null, "delta": "po"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::Lagged { dropped: 3 }).expect("serialize"),
            json!({"type": "lagged", "dropped": 3})
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(decode_event("{not json"), Err(EventDecodeError::InvalidJson(_))));
        assert!(matches!(
            decode_event(r#"{"properties":{}}"#),
            Err(EventDecodeError::MissingType)
        ));
        assert!(matches!(
            decode_event(r#"{"type":"complete"}"#),
            Err(EventDecodeError::MissingSessionId { .. })
        ));
        assert!(matches!(
            decode_event(r#"{"type":"session.created","properties":{"info":{"title":"no id"}}}"#),
            Err(EventDecodeError::InvalidPayload { .. })
        ));
    }
}
