//! Per-role page state driven by [`ClassService`](crate::classroom::ClassService)
//! events and user actions.
//!
//! Views are plain data behind a lock. Actions take the lock only to read or
//! update the view and never across a service call, because the service may
//! deliver events (and so lock the view again) from inside that call.

mod notification;
mod student;
mod teacher;

pub use notification::{Notification, NOTIFICATION_DURATION};
pub use student::{PendingInvite, StudentPage, StudentView};
pub use teacher::{TeacherPage, TeacherView};

use std::time::Duration;

use crate::classroom::models::{ChatMessageReceived, MessageKind};
use crate::config::AppConfig;
use crate::error::{ClassError, Result};

pub const HAND_RAISE_TEXT: &str = "🖐️ Hand raised";

pub const RECONNECTING_TEXT: &str = "Connection lost. Reconnecting...";
pub const CONNECTION_FAILED_TEXT: &str = "Unable to reconnect. Please leave and rejoin the class.";

#[derive(Debug, Clone)]
pub struct PageSettings {
    pub class_id: String,
    pub message_max_length: usize,
    pub cursor_flush_interval: Duration,
}

impl PageSettings {
    pub fn from_config(app: &AppConfig) -> Self {
        Self {
            class_id: app.default_class_id.clone(),
            message_max_length: app.message_max_length,
            cursor_flush_interval: Duration::from_millis(app.cursor_flush_interval_ms.max(1)),
        }
    }
}

impl Default for PageSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One-on-one conversation shown beside the class chat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrivateChatPanel {
    pub partner_id: String,
    pub partner_name: String,
    pub messages: Vec<ChatMessageReceived>,
    pub draft: String,
}

impl PrivateChatPanel {
    pub fn new(partner_id: &str, partner_name: &str) -> Self {
        Self {
            partner_id: partner_id.to_string(),
            partner_name: partner_name.to_string(),
            ..Self::default()
        }
    }
}

/// Takes the draft for sending. `Ok(None)` for blank drafts, which are left
/// untouched; over-long drafts are rejected and kept.
fn take_draft(draft: &mut String, max_length: usize) -> Result<Option<String>> {
    if draft.trim().is_empty() {
        return Ok(None);
    }
    if draft.trim().chars().count() > max_length {
        return Err(ClassError::invalid_state(format!(
            "message exceeds {} characters",
            max_length
        )));
    }
    Ok(Some(std::mem::take(draft)))
}

/// Routes a chat line to the private panel or the class message list.
fn route_message(
    message: &ChatMessageReceived,
    messages: &mut Vec<ChatMessageReceived>,
    private_chat: &mut Option<PrivateChatPanel>,
) {
    if message.kind == MessageKind::PrivateChat {
        match private_chat {
            Some(panel) => panel.messages.push(message.clone()),
            None => tracing::debug!(from = %message.from, "Private message with no open chat"),
        }
    } else {
        messages.push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_draft_is_noop() {
        let mut draft = "   ".to_string();
        assert!(take_draft(&mut draft, 10).unwrap().is_none());
        assert_eq!(draft, "   ");
    }

    #[test]
    fn test_long_draft_rejected_and_kept() {
        let mut draft = "x".repeat(11);
        assert!(matches!(take_draft(&mut draft, 10), Err(ClassError::InvalidState(_))));
        assert_eq!(draft.len(), 11);
    }

    #[test]
    fn test_draft_taken() {
        let mut draft = " hi ".to_string();
        assert_eq!(take_draft(&mut draft, 10).unwrap().as_deref(), Some(" hi "));
        assert!(draft.is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = PageSettings::default();
        assert_eq!(settings.class_id, "demo-class-001");
        assert_eq!(settings.message_max_length, 1000);
        assert_eq!(settings.cursor_flush_interval, Duration::from_millis(100));
    }
}
