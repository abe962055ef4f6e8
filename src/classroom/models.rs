use serde::{Deserialize, Serialize};

use super::identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

/// A participant of a class session. The id is fixed for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl User {
    /// Creates a teacher with a `teacher-<random9>` id
    pub fn teacher(name: impl Into<String>) -> Self {
        Self {
            id: identity::teacher_id(),
            name: name.into(),
            role: Role::Teacher,
        }
    }

    /// Creates a student with a `student-<slug>-<random6>` id
    pub fn student(name: &str) -> Self {
        let name = name.trim();
        Self {
            id: identity::student_id(name),
            name: name.to_string(),
            role: Role::Student,
        }
    }

    pub fn is_teacher(&self) -> bool {
        self.role == Role::Teacher
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    #[default]
    Chat,
    System,
    HandRaise,
    PrivateChat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::System => "system",
            MessageKind::HandRaise => "hand-raise",
            MessageKind::PrivateChat => "private-chat",
        }
    }
}

/// A chat line as shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessageReceived {
    /// Dedup key, see [`super::dedup::message_id`]
    pub id: String,
    pub class_id: String,
    pub from: String,
    pub from_name: String,
    pub to: String,
    pub message: String,
    pub timestamp: i64,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorData {
    pub user_id: String,
    pub user_name: String,
    pub x: f64,
    pub y: f64,
    pub timestamp: i64,
}

impl CursorData {
    /// Negative coordinates mean "no cursor", never a position.
    pub fn is_sentinel(&self) -> bool {
        is_sentinel(self.x, self.y)
    }
}

pub fn is_sentinel(x: f64, y: f64) -> bool {
    x < 0.0 || y < 0.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChatRequest {
    pub class_id: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub student_id: String,
    pub student_name: String,
}

/// Events the membership service hands to registered handlers
#[derive(Debug, Clone, PartialEq)]
pub enum ClassEvent {
    /// Chat, system, hand-raise or private-chat line
    Message(ChatMessageReceived),
    MemberJoined {
        member: Member,
        notice: ChatMessageReceived,
    },
    MemberLeft {
        member: Member,
        notice: ChatMessageReceived,
    },
    CursorMoved(CursorData),
    CursorCleared {
        user_id: String,
    },
    CursorToggled {
        teacher_id: String,
        teacher_name: String,
        enabled: bool,
    },
    PrivateChatRequested {
        teacher_id: String,
        teacher_name: String,
    },
    PrivateChatEnded {
        by: String,
        by_name: String,
    },
    /// The connection dropped; reconnecting in the background
    ConnectionLost {
        reason: String,
    },
    ConnectionRestored,
    /// Reconnect attempts exhausted
    ConnectionFailed {
        reason: String,
    },
}
