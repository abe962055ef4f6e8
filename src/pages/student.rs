use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    route_message, take_draft, Notification, PageSettings, PrivateChatPanel, CONNECTION_FAILED_TEXT,
    HAND_RAISE_TEXT, RECONNECTING_TEXT,
};
use crate::classroom::events::BROADCAST;
use crate::classroom::{
    ChatMessageReceived, ClassEvent, ClassService, CursorData, HandlerId, MessageKind, Phase, Role, User,
};
use crate::error::{ClassError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    pub teacher_id: String,
    pub teacher_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct StudentView {
    pub joined: bool,
    pub name: Option<String>,
    pub messages: Vec<ChatMessageReceived>,
    pub draft: String,
    /// Hidden on the sentinel position or when streaming stops
    pub teacher_cursor: Option<CursorData>,
    pub cursor_streaming: bool,
    pub notification: Notification,
    pub connection_error: Option<String>,
    pub pending_invite: Option<PendingInvite>,
    pub private_chat: Option<PrivateChatPanel>,
}

impl StudentView {
    fn apply(&mut self, event: &ClassEvent) {
        match event {
            ClassEvent::Message(message) => {
                route_message(message, &mut self.messages, &mut self.private_chat);
            }
            ClassEvent::MemberJoined { member, notice } => {
                self.messages.push(notice.clone());
                self.notification
                    .show(format!("👋 {} joined the class", member.name));
            }
            ClassEvent::MemberLeft { member, notice } => {
                if member.role == Role::Teacher {
                    self.teacher_cursor = None;
                }
                self.messages.push(notice.clone());
                self.notification
                    .show(format!("👋 {} left the class", member.name));
            }
            ClassEvent::CursorMoved(cursor) => {
                self.teacher_cursor = Some(cursor.clone());
            }
            ClassEvent::CursorCleared { .. } => {
                self.teacher_cursor = None;
            }
            ClassEvent::CursorToggled { teacher_name, enabled, .. } => {
                self.cursor_streaming = *enabled;
                if !enabled {
                    self.teacher_cursor = None;
                }
                self.notification.show(if *enabled {
                    format!("{} is sharing their cursor", teacher_name)
                } else {
                    format!("{} stopped sharing their cursor", teacher_name)
                });
            }
            ClassEvent::PrivateChatRequested { teacher_id, teacher_name } => {
                self.pending_invite = Some(PendingInvite {
                    teacher_id: teacher_id.clone(),
                    teacher_name: teacher_name.clone(),
                });
                self.notification
                    .show(format!("{} wants to chat privately", teacher_name));
            }
            ClassEvent::PrivateChatEnded { by_name, .. } => {
                self.private_chat = None;
                self.notification
                    .show(format!("{} ended the private chat", by_name));
            }
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

/// Student page: name entry, class chat, hand raising, the teacher's cursor
/// and private chats the teacher opens.
pub struct StudentPage {
    service: ClassService,
    settings: PageSettings,
    student: Mutex<Option<User>>,
    view: Arc<Mutex<StudentView>>,
    handler: Mutex<Option<HandlerId>>,
}

impl StudentPage {
    pub fn new(service: ClassService, settings: PageSettings) -> Self {
        Self {
            service,
            settings,
            student: Mutex::new(None),
            view: Arc::new(Mutex::new(StudentView::default())),
            handler: Mutex::new(None),
        }
    }

    pub fn student(&self) -> Option<User> {
        self.student.lock().clone()
    }

    pub fn class_id(&self) -> &str {
        &self.settings.class_id
    }

    pub fn snapshot(&self) -> StudentView {
        self.view.lock().clone()
    }

    fn fail(&self, message: &str, error: ClassError) -> ClassError {
        tracing::error!(error = %error, "{}", message);
        self.view.lock().connection_error = Some(message.to_string());
        error
    }

    /// Joins under `name`. A blank name is reported and nothing is joined.
    pub async fn join_class(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            self.view.lock().connection_error = Some("Please enter your name".to_string());
            return Err(ClassError::invalid_state("name is empty"));
        }
        self.view.lock().connection_error = None;

        let student = User::student(name);
        let view = self.view.clone();
        let handler = self.service.on_event(move |event| view.lock().apply(event));

        if let Err(e) = self
            .service
            .join_class(&self.settings.class_id, student.clone())
            .await
        {
            self.service.remove_handler(handler);
            self.view.lock().joined = false;
            return Err(self.fail("Failed to join class", e));
        }

        *self.handler.lock() = Some(handler);
        *self.student.lock() = Some(student);

        let mut view = self.view.lock();
        view.joined = true;
        view.name = Some(name.to_string());
        view.notification
            .show(format!("✅ You joined the class as {}", name));
        tracing::info!(class_id = %self.settings.class_id, name = %name, "Student joined class");
        Ok(())
    }

    pub async fn leave_class(&self) -> Result<()> {
        if let Some(handler) = self.handler.lock().take() {
            self.service.remove_handler(handler);
        }

        let result = self.service.leave_class().await;
        self.student.lock().take();

        let mut view = self.view.lock();
        view.joined = false;
        view.teacher_cursor = None;
        view.cursor_streaming = false;
        view.pending_invite = None;
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

    pub async fn raise_hand(&self) -> Result<()> {
        self.service
            .send_message(HAND_RAISE_TEXT, BROADCAST, MessageKind::HandRaise)
            .await
            .map_err(|e| self.fail("Failed to raise hand", e))
    }

    pub async fn accept_private_chat(&self) -> Result<()> {
        let invite = self
            .view
            .lock()
            .pending_invite
            .take()
            .ok_or_else(|| ClassError::invalid_state("no pending private chat invite"))?;

        // Open the panel first so messages already sent by the teacher land in it
        self.view.lock().private_chat = Some(PrivateChatPanel::new(&invite.teacher_id, &invite.teacher_name));

        if let Err(e) = self
            .service
            .accept_private_chat(&invite.teacher_id, &invite.teacher_name)
            .await
        {
            let mut view = self.view.lock();
            view.private_chat = None;
            view.pending_invite = Some(invite);
            drop(view);
            return Err(self.fail("Failed to join private chat", e));
        }
        Ok(())
    }

    /// Dismisses the invite locally; the teacher is not told.
    pub fn decline_private_chat(&self) -> bool {
        self.view.lock().pending_invite.take().is_some()
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
