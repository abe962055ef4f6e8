//! Wire envelope and inbound event decoding.
//!
//! Every channel event is decoded exactly once into an [`InboundEvent`]. Payloads
//! that do not fit any variant are rejected here and never reach the service
//! logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{MessageKind, Role, User};
use crate::error::TransportError;
use crate::transport::{now_millis, ChannelEvent};

pub mod names {
    pub const CHAT: &str = "chat";
    pub const STUDENT_JOIN: &str = "student-join";
    pub const STUDENT_LEAVE: &str = "student-leave";
    pub const TEACHER_JOIN: &str = "teacher-join";
    pub const TEACHER_LEAVE: &str = "teacher-leave";
    pub const CURSOR: &str = "cursor";
    pub const CURSOR_TOGGLE: &str = "cursor-toggle";
    pub const PRIVATE_CHAT: &str = "private-chat";
    pub const PRIVATE_CHAT_REQUEST: &str = "private-chat-request";
    pub const PRIVATE_CHAT_END: &str = "private-chat-end";
}

pub const BROADCAST: &str = "all";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub class_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default = "broadcast")]
    pub to: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

fn broadcast() -> String {
    BROADCAST.to_string()
}

impl Envelope {
    pub fn new(class_id: &str, from: &User, to: &str, kind: &str, content: Value) -> Self {
        Self {
            class_id: class_id.to_string(),
            from: from.id.clone(),
            from_name: Some(from.name.clone()),
            to: to.to_string(),
            kind: kind.to_string(),
            content,
        }
    }

    pub fn to_value(&self) -> Result<Value, TransportError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContent {
    #[serde(alias = "Text")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
}

impl ChatContent {
    pub fn new(text: &str, kind: MessageKind) -> Self {
        Self {
            text: text.to_string(),
            timestamp: Some(now_millis()),
            message_type: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorContent {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleContent {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipContent {
    #[serde(default, alias = "studentId", alias = "teacherId")]
    user_id: Option<String>,
    #[serde(default, alias = "studentName", alias = "teacherName")]
    user_name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestContent {
    #[serde(default)]
    teacher_id: Option<String>,
    #[serde(default)]
    teacher_name: Option<String>,
    #[serde(default)]
    student_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Chat {
        from: String,
        from_name: Option<String>,
        to: String,
        text: String,
        kind: MessageKind,
    },
    PrivateChat {
        from: String,
        from_name: Option<String>,
        to: String,
        text: String,
    },
    Join {
        user_id: String,
        user_name: Option<String>,
        role: Role,
    },
    Leave {
        user_id: String,
        user_name: Option<String>,
        role: Role,
    },
    Cursor {
        from: String,
        from_name: Option<String>,
        x: f64,
        y: f64,
    },
    CursorToggle {
        from: String,
        from_name: Option<String>,
        enabled: bool,
    },
    PrivateChatRequest {
        teacher_id: String,
        teacher_name: Option<String>,
        student_id: String,
    },
    PrivateChatEnd {
        from: String,
        from_name: Option<String>,
    },
}

/// Some publishers send the payload as JSON text rather than an object.
fn unwrap_json_text(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn content_as<T: DeserializeOwned>(kind: &str, content: Value) -> Result<T, TransportError> {
    serde_json::from_value(unwrap_json_text(content))
        .map_err(|e| TransportError::InvalidPayload(format!("{} content: {}", kind, e)))
}

fn optional_content<T: DeserializeOwned + Default>(
    kind: &str,
    content: Value,
) -> Result<T, TransportError> {
    match unwrap_json_text(content) {
        Value::Null => Ok(T::default()),
        other => content_as(kind, other),
    }
}

impl InboundEvent {
    /// Decodes a channel event. The envelope `type` wins over the provider
    /// event name, since the backend publishes every kind under `chat`.
    pub fn decode(event: &ChannelEvent) -> Result<Self, TransportError> {
        let envelope: Envelope = serde_json::from_value(unwrap_json_text(event.data.clone()))
            .map_err(|e| TransportError::InvalidPayload(format!("{}: {}", event.name, e)))?;

        let kind = if envelope.kind.is_empty() {
            event.name.clone()
        } else {
            envelope.kind.clone()
        };

        let from = if envelope.from.is_empty() {
            event.client_id.clone().unwrap_or_default()
        } else {
            envelope.from.clone()
        };

        match kind.as_str() {
            names::CHAT => {
                let content: ChatContent = content_as(&kind, envelope.content)?;
                Ok(InboundEvent::Chat {
                    from,
                    from_name: envelope.from_name,
                    to: envelope.to,
                    text: content.text,
                    kind: content.message_type.unwrap_or_default(),
                })
            }
            names::PRIVATE_CHAT => {
                let content: ChatContent = content_as(&kind, envelope.content)?;
                Ok(InboundEvent::PrivateChat {
                    from,
                    from_name: envelope.from_name,
                    to: envelope.to,
                    text: content.text,
                })
            }
            names::STUDENT_JOIN | names::TEACHER_JOIN | names::STUDENT_LEAVE | names::TEACHER_LEAVE => {
                let content: MembershipContent = optional_content(&kind, envelope.content)?;
                let user_id = content.user_id.filter(|id| !id.is_empty()).unwrap_or(from);
                if user_id.is_empty() {
                    return Err(TransportError::InvalidPayload(format!(
                        "{} without user id",
                        kind
                    )));
                }
                let user_name = content.user_name.or(envelope.from_name);
                let role = if kind.starts_with("teacher") {
                    Role::Teacher
                } else {
                    Role::Student
                };

                if kind.ends_with("join") {
                    Ok(InboundEvent::Join { user_id, user_name, role })
                } else {
                    Ok(InboundEvent::Leave { user_id, user_name, role })
                }
            }
            names::CURSOR => {
                let content: CursorContent = content_as(&kind, envelope.content)?;
                Ok(InboundEvent::Cursor {
                    from,
                    from_name: envelope.from_name,
                    x: content.x,
                    y: content.y,
                })
            }
            names::CURSOR_TOGGLE => {
                let content: ToggleContent = content_as(&kind, envelope.content)?;
                Ok(InboundEvent::CursorToggle {
                    from,
                    from_name: envelope.from_name,
                    enabled: content.enabled,
                })
            }
            names::PRIVATE_CHAT_REQUEST => {
                let content: RequestContent = optional_content(&kind, envelope.content)?;
                let teacher_id = content.teacher_id.unwrap_or(from);
                let student_id = content.student_id.unwrap_or(envelope.to);
                Ok(InboundEvent::PrivateChatRequest {
                    teacher_id,
                    teacher_name: content.teacher_name.or(envelope.from_name),
                    student_id,
                })
            }
            names::PRIVATE_CHAT_END => Ok(InboundEvent::PrivateChatEnd {
                from,
                from_name: envelope.from_name,
            }),
            other => Err(TransportError::InvalidPayload(format!(
                "unknown event type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_event(name: &str, data: Value) -> ChannelEvent {
        ChannelEvent {
            channel: "class-demo".to_string(),
            name: name.to_string(),
            data,
            timestamp: 1_000,
            client_id: None,
        }
    }

    #[test]
    fn test_decode_chat_with_backend_field_name() {
        let event = channel_event(
            "chat",
            json!({
                "classId": "demo",
                "from": "student-ana-abc123",
                "to": "all",
                "type": "chat",
                "content": { "Text": "hi", "messageType": "hand-raise" }
            }),
        );

        let decoded = InboundEvent::decode(&event).unwrap();
        assert_eq!(
            decoded,
            InboundEvent::Chat {
                from: "student-ana-abc123".to_string(),
                from_name: None,
                to: "all".to_string(),
                text: "hi".to_string(),
                kind: MessageKind::HandRaise,
            }
        );
    }

    #[test]
    fn test_envelope_type_wins_over_event_name() {
        let event = channel_event(
            "chat",
            json!({
                "type": "student-join",
                "content": { "studentId": "student-ana-abc123", "studentName": "Ana" }
            }),
        );

        match InboundEvent::decode(&event).unwrap() {
            InboundEvent::Join { user_id, user_name, role } => {
                assert_eq!(user_id, "student-ana-abc123");
                assert_eq!(user_name.as_deref(), Some("Ana"));
                assert_eq!(role, Role::Student);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_without_content_uses_sender() {
        let event = channel_event("teacher-leave", json!({ "from": "teacher-abc" }));
        assert_eq!(
            InboundEvent::decode(&event).unwrap(),
            InboundEvent::Leave {
                user_id: "teacher-abc".to_string(),
                user_name: None,
                role: Role::Teacher,
            }
        );
    }

    #[test]
    fn test_decode_string_encoded_payload() {
        let payload = json!({
            "from": "teacher-abc",
            "type": "cursor",
            "content": "{\"x\": 10.5, \"y\": -1}"
        })
        .to_string();
        let event = channel_event("cursor", Value::String(payload));

        match InboundEvent::decode(&event).unwrap() {
            InboundEvent::Cursor { x, y, .. } => {
                assert_eq!(x, 10.5);
                assert_eq!(y, -1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_private_request_falls_back_to_envelope() {
        let event = channel_event(
            "private-chat-request",
            json!({
                "from": "teacher-abc",
                "fromName": "Ms. Smith",
                "to": "student-ana-abc123",
                "type": "private-chat-request"
            }),
        );

        assert_eq!(
            InboundEvent::decode(&event).unwrap(),
            InboundEvent::PrivateChatRequest {
                teacher_id: "teacher-abc".to_string(),
                teacher_name: Some("Ms. Smith".to_string()),
                student_id: "student-ana-abc123".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let missing_text = channel_event("chat", json!({ "type": "chat", "content": {} }));
        assert!(matches!(
            InboundEvent::decode(&missing_text),
            Err(TransportError::InvalidPayload(_))
        ));

        let unknown = channel_event("whiteboard-clear", json!({}));
        assert!(InboundEvent::decode(&unknown).is_err());

        let not_an_object = channel_event("chat", json!(42));
        assert!(InboundEvent::decode(&not_an_object).is_err());
    }

    #[test]
    fn test_envelope_round_trip_fields() {
        let user = User {
            id: "teacher-abc".to_string(),
            name: "Teacher".to_string(),
            role: Role::Teacher,
        };
        let envelope = Envelope::new("demo", &user, BROADCAST, names::CURSOR_TOGGLE, json!({ "enabled": true }));
        let value = envelope.to_value().unwrap();
        assert_eq!(value["classId"], "demo");
        assert_eq!(value["fromName"], "Teacher");
        assert_eq!(value["type"], "cursor-toggle");
    }
}
