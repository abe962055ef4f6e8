use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{
    route_message, take_draft, Notification, PageSettings, PrivateChatPanel, CONNECTION_FAILED_TEXT,
    RECONNECTING_TEXT,
};
use crate::classroom::events::BROADCAST;
use crate::classroom::identity::STUDENT_PREFIX;
use crate::classroom::{ClassEvent, ClassService, CursorData, CursorThrottle, HandlerId, MessageKind, Phase, Role, User};
use crate::error::{ClassError, Result};

#[derive(Debug, Clone, Default)]
pub struct TeacherView {
    pub joined: bool,
    pub messages: Vec<crate::classroom::ChatMessageReceived>,
    pub draft: String,
    /// Connected students, id → display name
    pub roster: BTreeMap<String, String>,
    pub cursors: HashMap<String, CursorData>,
    pub notification: Notification,
    pub connection_error: Option<String>,
    pub cursor_streaming: bool,
    pub private_chat: Option<PrivateChatPanel>,
}

impl TeacherView {
    fn apply(&mut self, event: &ClassEvent, teacher_id: &str) {
        match event {
            ClassEvent::Message(message) => {
                if message.from != teacher_id && message.from.starts_with(STUDENT_PREFIX) {
                    self.roster
                        .insert(message.from.clone(), message.from_name.clone());
                }
                route_message(message, &mut self.messages, &mut self.private_chat);
            }
            ClassEvent::MemberJoined { member, notice } => {
                if member.role == Role::Student {
                    self.roster.insert(member.id.clone(), member.name.clone());
                }
                self.messages.push(notice.clone());
                self.notification
                    .show(format!("🎉 {} joined the class", member.name));
            }
            ClassEvent::MemberLeft { member, notice } => {
                self.roster.remove(&member.id);
                self.cursors.remove(&member.id);
                self.messages.push(notice.clone());
                self.notification
                    .show(format!("👋 {} left the class", member.name));
            }
            ClassEvent::CursorMoved(cursor) => {
                self.cursors.insert(cursor.user_id.clone(), cursor.clone());
            }
            ClassEvent::CursorCleared { user_id } => {
                self.cursors.remove(user_id);
            }
            ClassEvent::PrivateChatEnded { by_name, .. } => {
                self.private_chat = None;
                self.notification
                    .show(format!("{} ended the private chat", by_name));
            }
            ClassEvent::CursorToggled { .. } | ClassEvent::PrivateChatRequested { .. } => {}
            ClassEvent::ConnectionLost { .. } => {
                self.connection_error = Some(RECONNECTING_TEXT.to_string());
            }
            ClassEvent::ConnectionRestored => {
                self.connection_error = None;
                self.notification.show("Reconnected");
            }
            ClassEvent::ConnectionFailed { .. } => {
                self.connection_error = Some(CONNECTION_FAILED_TEXT.to_string());
            }
        }
    }
}

/// Teacher page: class chat, roster, announcements, cursor streaming and
/// private chats with individual students.
pub struct TeacherPage {
    service: ClassService,
    teacher: User,
    settings: PageSettings,
    view: Arc<Mutex<TeacherView>>,
    handler: Mutex<Option<HandlerId>>,
    throttle: Arc<Mutex<CursorThrottle>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl TeacherPage {
    pub fn new(service: ClassService, teacher_name: &str, settings: PageSettings) -> Self {
        Self {
            service,
            teacher: User::teacher(teacher_name),
            settings,
            view: Arc::new(Mutex::new(TeacherView::default())),
            handler: Mutex::new(None),
            throttle: Arc::new(Mutex::new(CursorThrottle::new())),
            flush_task: Mutex::new(None),
        }
    }

    pub fn teacher(&self) -> &User {
        &self.teacher
    }

    pub fn class_id(&self) -> &str {
        &self.settings.class_id
    }

    pub fn snapshot(&self) -> TeacherView {
        self.view.lock().clone()
    }

    fn fail(&self, message: &str, error: ClassError) -> ClassError {
        tracing::error!(error = %error, "{}", message);
        self.view.lock().connection_error = Some(message.to_string());
        error
    }

    pub async fn join_class(&self) -> Result<()> {
        self.view.lock().connection_error = None;

        let view = self.view.clone();
        let teacher_id = self.teacher.id.clone();
        let handler = self
            .service
            .on_event(move |event| view.lock().apply(event, &teacher_id));

        if let Err(e) = self
            .service
            .join_class(&self.settings.class_id, self.teacher.clone())
            .await
        {
            self.service.remove_handler(handler);
            self.view.lock().joined = false;
            return Err(self.fail("Failed to join class", e));
        }

        *self.handler.lock() = Some(handler);
        self.view.lock().joined = true;
        Ok(())
    }

    pub async fn leave_class(&self) -> Result<()> {
        self.stop_cursor_flush();
        if let Some(handler) = self.handler.lock().take() {
            self.service.remove_handler(handler);
        }

        let result = self.service.leave_class().await;

        let mut view = self.view.lock();
        view.joined = false;
        view.roster.clear();
        view.cursors.clear();
        view.cursor_streaming = false;
        view.private_chat = None;
        view.connection_error = None;
        result
    }

    pub fn set_draft(&self, text: &str) {
        self.view.lock().draft = text.to_string();
    }

    /// Sends the draft to the whole class. Blank drafts are ignored.
    pub async fn send_message(&self) -> Result<()> {
        let taken = take_draft(&mut self.view.lock().draft, self.settings.message_max_length);
        let text = match taken {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.fail("Message is too long", e)),
        };

        if let Err(e) = self
            .service
            .send_message(&text, BROADCAST, MessageKind::Chat)
            .await
        {
            self.view.lock().draft = text;
            return Err(self.fail("Failed to send message", e));
        }
        Ok(())
    }

    pub async fn send_announcement(&self, text: &str) -> Result<()> {
        let mut text = text.to_string();
        let text = match take_draft(&mut text, self.settings.message_max_length) {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.fail("Announcement is too long", e)),
        };

        self.service
            .send_announcement(&text)
            .await
            .map_err(|e| self.fail("Failed to send announcement", e))
    }

    /// Flips cursor streaming and starts or stops the flush task.
    pub async fn toggle_cursor_streaming(&self) -> Result<bool> {
        let enabled = !self.view.lock().cursor_streaming;

        self.service
            .set_cursor_streaming(enabled)
            .await
            .map_err(|e| self.fail("Failed to toggle cursor streaming", e))?;

        {
            let mut view = self.view.lock();
            view.cursor_streaming = enabled;
            view.notification.show(if enabled {
                "Cursor streaming enabled"
            } else {
                "Cursor streaming disabled"
            });
        }

        if enabled {
            self.start_cursor_flush();
        } else {
            self.stop_cursor_flush();
        }
        Ok(enabled)
    }

    /// Queues a pointer position. Returns false when streaming is off or the
    /// move is too small to send.
    pub fn move_cursor(&self, x: f64, y: f64) -> bool {
        if !self.view.lock().cursor_streaming {
            return false;
        }
        self.throttle.lock().offer(x, y)
    }

    fn start_cursor_flush(&self) {
        let service = self.service.clone();
        let throttle = self.throttle.clone();
        let period = self.settings.cursor_flush_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let next = throttle.lock().take_pending();
                if let Some((x, y)) = next {
                    if let Err(e) = service.send_cursor(x, y).await {
                        tracing::debug!(error = %e, "Cursor update dropped");
                    }
                }
            }
        });

        if let Some(previous) = self.flush_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_cursor_flush(&self) {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        self.throttle.lock().reset();
    }

    pub async fn start_private_chat(&self, student_id: &str) -> Result<()> {
        let student_name = self
            .view
            .lock()
            .roster
            .get(student_id)
            .cloned()
            .unwrap_or_else(|| self.service.display_name(student_id));

        // Open the panel first so replayed private history lands in it
        self.view.lock().private_chat = Some(PrivateChatPanel::new(student_id, &student_name));

        if let Err(e) = self.service.start_private_chat(student_id, &student_name).await {
            self.view.lock().private_chat = None;
            return Err(self.fail("Failed to start private chat", e));
        }

        self.view
            .lock()
            .notification
            .show(format!("Private chat with {} started", student_name));
        Ok(())
    }

    pub fn set_private_draft(&self, text: &str) {
        if let Some(panel) = self.view.lock().private_chat.as_mut() {
            panel.draft = text.to_string();
        }
    }

    pub async fn send_private_message(&self) -> Result<()> {
        let taken = match self.view.lock().private_chat.as_mut() {
            Some(panel) => take_draft(&mut panel.draft, self.settings.message_max_length),
            None => Err(ClassError::invalid_state("no private chat open")),
        };
        let text = match taken {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.fail("Cannot send private message", e)),
        };

        if let Err(e) = self.service.send_private_message(&text).await {
            if let Some(panel) = self.view.lock().private_chat.as_mut() {
                panel.draft = text;
            }
            return Err(self.fail("Failed to send private message", e));
        }
        Ok(())
    }

    pub async fn end_private_chat(&self) -> Result<()> {
        let result = self.service.end_private_chat().await;
        if !matches!(self.service.phase(), Phase::InPrivateChat { .. }) {
            self.view.lock().private_chat = None;
        }
        result.map_err(|e| self.fail("Failed to end private chat", e))
    }
}

impl Drop for TeacherPage {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classroom::{ChatMessageReceived, Member};

    fn notice(from: &str, text: &str) -> ChatMessageReceived {
        ChatMessageReceived {
            id: format!("{}-1-abc", from),
            class_id: "demo".to_string(),
            from: from.to_string(),
            from_name: "Ana".to_string(),
            to: "all".to_string(),
            message: text.to_string(),
            timestamp: 1,
            kind: MessageKind::System,
        }
    }

    fn ana() -> Member {
        Member {
            id: "student-ana-abc123".to_string(),
            name: "Ana".to_string(),
            role: Role::Student,
        }
    }

    #[test]
    fn test_roster_follows_membership() {
        let mut view = TeacherView::default();
        view.apply(
            &ClassEvent::MemberJoined {
                member: ana(),
                notice: notice("student-ana-abc123", "Ana joined the class"),
            },
            "teacher-1",
        );
        assert_eq!(view.roster.get("student-ana-abc123").map(String::as_str), Some("Ana"));
        assert_eq!(view.notification.current(), Some("🎉 Ana joined the class"));

        view.apply(
            &ClassEvent::MemberLeft {
                member: ana(),
                notice: notice("student-ana-abc123", "Ana left the class"),
            },
            "teacher-1",
        );
        assert!(view.roster.is_empty());
        assert_eq!(view.messages.len(), 2);
    }

    #[test]
    fn test_teacher_not_in_roster() {
        let mut view = TeacherView::default();
        view.apply(
            &ClassEvent::MemberJoined {
                member: Member {
                    id: "teacher-1".to_string(),
                    name: "Teacher".to_string(),
                    role: Role::Teacher,
                },
                notice: notice("teacher-1", "Teacher joined the class"),
            },
            "teacher-1",
        );
        assert!(view.roster.is_empty());
    }

    #[test]
    fn test_cursor_sentinel_removes_cursor() {
        let mut view = TeacherView::default();
        view.apply(
            &ClassEvent::CursorMoved(CursorData {
                user_id: "student-ana-abc123".to_string(),
                user_name: "Ana".to_string(),
                x: 10.0,
                y: 20.0,
                timestamp: 1,
            }),
            "teacher-1",
        );
        assert_eq!(view.cursors.len(), 1);

        view.apply(
            &ClassEvent::CursorCleared {
                user_id: "student-ana-abc123".to_string(),
            },
            "teacher-1",
        );
        assert!(view.cursors.is_empty());
    }

    #[test]
    fn test_private_messages_go_to_panel() {
        let mut view = TeacherView {
            private_chat: Some(PrivateChatPanel::new("student-ana-abc123", "Ana")),
            ..TeacherView::default()
        };
        let mut message = notice("student-ana-abc123", "psst");
        message.kind = MessageKind::PrivateChat;

        view.apply(&ClassEvent::Message(message), "teacher-1");
        assert!(view.messages.is_empty());
        assert_eq!(view.private_chat.as_ref().map(|p| p.messages.len()), Some(1));
    }
}
