use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::backoff::ReconnectPolicy;
use super::channels::{inbox_channel, main_channel, private_channel};
use super::dedup::{message_id, MessageLog, RecentWindow};
use super::events::{names, ChatContent, CursorContent, Envelope, InboundEvent, ToggleContent, BROADCAST};
use super::identity::{decode_display_name, DisplayNames};
use super::models::{
    is_sentinel, ChatMessageReceived, ClassEvent, CursorData, Member, MessageKind, PrivateChatRequest,
    Role, User,
};
use crate::config::{RealtimeConfig, DEFAULT_CHANNEL_PREFIX};
use crate::error::{ClassError, Result, TransportError};
use crate::notifier::Notifier;
use crate::transport::{now_millis, ChannelEvent, ConnectionState, EventCallback, Transport};

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&ClassEvent) + Send + Sync>;

/// Where the local user currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Joining,
    Joined,
    InPrivateChat {
        channel: String,
        partner_id: String,
        partner_name: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub channel_prefix: String,
    pub reconnect: ReconnectPolicy,
}

impl ServiceOptions {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            channel_prefix: config.channel_prefix.clone(),
            reconnect: ReconnectPolicy::new(config.reconnect_delay(), config.reconnect_attempts),
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    class_id: String,
    user: User,
    main_channel: String,
    /// Students only
    inbox_channel: Option<String>,
    phase: Phase,
    private_chat_started_at: Option<i64>,
}

impl Session {
    /// Channels that should be subscribed in the current phase
    fn active_channels(&self) -> Vec<String> {
        let mut channels = match &self.phase {
            Phase::InPrivateChat { channel, .. } => vec![channel.clone()],
            _ => vec![self.main_channel.clone()],
        };
        channels.extend(self.inbox_channel.clone());
        channels
    }
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    names: DisplayNames,
    messages: MessageLog,
    notices: RecentWindow,
}

impl State {
    fn reset(&mut self) {
        self.session = None;
        self.names.clear();
        self.messages.clear();
        self.notices.clear();
    }

    fn sender_name(&mut self, from: &str, from_name: Option<String>, local: &User) -> String {
        match from_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => {
                if self.names.get(from).is_none() {
                    self.names.register(from, &name);
                }
                name
            }
            None => self.names.resolve(from, local),
        }
    }

    /// Turns a decoded channel event into what handlers see, applying identity
    /// resolution and both dedup layers. `None` means drop.
    fn normalize(&mut self, inbound: InboundEvent, event: &ChannelEvent) -> Option<ClassEvent> {
        let session = self.session.as_ref()?;
        let local = session.user.clone();
        let class_id = session.class_id.clone();
        let private_channel = match &session.phase {
            Phase::InPrivateChat { channel, .. } => Some(channel.clone()),
            _ => None,
        };

        match inbound {
            InboundEvent::Chat { from, from_name, to, text, kind } => {
                self.chat_line(&class_id, &local, from, from_name, to, text, kind, event.timestamp)
            }
            InboundEvent::PrivateChat { from, from_name, to, text } => self.chat_line(
                &class_id,
                &local,
                from,
                from_name,
                to,
                text,
                MessageKind::PrivateChat,
                event.timestamp,
            ),
            InboundEvent::Join { user_id, user_name, role } => {
                let name = self.sender_name(&user_id, user_name, &local);
                self.names.register(&user_id, &name);
                if user_id == local.id {
                    return None;
                }
                if !self.notices.check_and_mark(&format!("join-{}", user_id)) {
                    tracing::debug!(user_id = %user_id, "Duplicate join notice suppressed");
                    return None;
                }

                let notice = membership_notice(&class_id, &user_id, &name, "joined the class", event.timestamp);
                Some(ClassEvent::MemberJoined {
                    member: Member { id: user_id, name, role },
                    notice,
                })
            }
            InboundEvent::Leave { user_id, user_name, role } => {
                if user_id == local.id {
                    return None;
                }
                let name = self.sender_name(&user_id, user_name, &local);
                self.names.remove(&user_id);
                if !self.notices.check_and_mark(&format!("leave-{}", user_id)) {
                    tracing::debug!(user_id = %user_id, "Duplicate leave notice suppressed");
                    return None;
                }

                let notice = membership_notice(&class_id, &user_id, &name, "left the class", event.timestamp);
                Some(ClassEvent::MemberLeft {
                    member: Member { id: user_id, name, role },
                    notice,
                })
            }
            InboundEvent::Cursor { from, from_name, x, y } => {
                if from == local.id {
                    return None;
                }
                if is_sentinel(x, y) {
                    return Some(ClassEvent::CursorCleared { user_id: from });
                }
                let user_name = self.sender_name(&from, from_name, &local);
                Some(ClassEvent::CursorMoved(CursorData {
                    user_id: from,
                    user_name,
                    x,
                    y,
                    timestamp: event.timestamp,
                }))
            }
            InboundEvent::CursorToggle { from, from_name, enabled } => {
                if from == local.id {
                    return None;
                }
                let teacher_name = self.sender_name(&from, from_name, &local);
                Some(ClassEvent::CursorToggled {
                    teacher_id: from,
                    teacher_name,
                    enabled,
                })
            }
            InboundEvent::PrivateChatRequest { teacher_id, teacher_name, student_id } => {
                if local.role != Role::Student || student_id != local.id {
                    return None;
                }
                let id = message_id(&teacher_id, event.timestamp, names::PRIVATE_CHAT_REQUEST);
                if !self.messages.record(&id) {
                    return None;
                }
                let teacher_name = self.sender_name(&teacher_id, teacher_name, &local);
                Some(ClassEvent::PrivateChatRequested { teacher_id, teacher_name })
            }
            InboundEvent::PrivateChatEnd { from, from_name } => {
                if from == local.id {
                    return None;
                }
                if private_channel.as_deref() != Some(event.channel.as_str()) {
                    return None;
                }
                let by_name = self.sender_name(&from, from_name, &local);
                Some(ClassEvent::PrivateChatEnded { by: from, by_name })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn chat_line(
        &mut self,
        class_id: &str,
        local: &User,
        from: String,
        from_name: Option<String>,
        to: String,
        text: String,
        kind: MessageKind,
        timestamp: i64,
    ) -> Option<ClassEvent> {
        let id = message_id(&from, timestamp, &text);
        if !self.messages.record(&id) {
            tracing::debug!(message_id = %id, "Duplicate message dropped");
            return None;
        }

        let from_name = self.sender_name(&from, from_name, local);
        Some(ClassEvent::Message(ChatMessageReceived {
            id,
            class_id: class_id.to_string(),
            from,
            from_name,
            to,
            message: text,
            timestamp,
            kind,
        }))
    }
}

fn membership_notice(
    class_id: &str,
    user_id: &str,
    name: &str,
    action: &str,
    timestamp: i64,
) -> ChatMessageReceived {
    let message = format!("{} {}", name, action);
    ChatMessageReceived {
        id: message_id(user_id, timestamp, &message),
        class_id: class_id.to_string(),
        from: user_id.to_string(),
        from_name: name.to_string(),
        to: BROADCAST.to_string(),
        message,
        timestamp,
        kind: MessageKind::System,
    }
}

fn envelope<T: Serialize>(
    session: &Session,
    to: &str,
    kind: &str,
    content: &T,
) -> std::result::Result<Value, TransportError> {
    let content = serde_json::to_value(content)?;
    Envelope::new(&session.class_id, &session.user, to, kind, content).to_value()
}

struct Inner {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    options: ServiceOptions,
    state: Mutex<State>,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
    next_handler: AtomicU64,
    /// Held for the duration of a main/private channel switch
    switch_lock: tokio::sync::Mutex<()>,
    /// Reconnects after unexpected drops while a session is live
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Class membership: joins and leaves a class, switches between the main
/// channel and private chats, and turns channel traffic into [`ClassEvent`]s
/// for registered handlers.
///
/// Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct ClassService {
    inner: Arc<Inner>,
}

impl ClassService {
    pub fn new(
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                notifier,
                options,
                state: Mutex::new(State::default()),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                switch_lock: tokio::sync::Mutex::new(()),
                monitor: Mutex::new(None),
            }),
        }
    }

    // ---- handlers ----

    /// Registers a handler for every dispatched event. Register before
    /// `join_class` to see replayed history.
    pub fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ClassEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::SeqCst);
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    fn dispatch(&self, event: &ClassEvent) {
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(?event, "Event handler panicked");
            }
        }
    }

    // ---- accessors ----

    pub fn phase(&self) -> Phase {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or(Phase::Idle)
    }

    pub fn current_class(&self) -> Option<String> {
        self.inner.state.lock().session.as_ref().map(|s| s.class_id.clone())
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.lock().session.as_ref().map(|s| s.user.clone())
    }

    pub fn private_chat_started_at(&self) -> Option<i64> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.private_chat_started_at)
    }

    /// Display name for `user_id`, resolved and cached the same way as for
    /// inbound events.
    pub fn display_name(&self, user_id: &str) -> String {
        let mut state = self.inner.state.lock();
        match state.session.as_ref().map(|s| s.user.clone()) {
            Some(local) => state.names.resolve(user_id, &local),
            None => decode_display_name(user_id).unwrap_or_else(|| user_id.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    fn session(&self) -> Result<Session> {
        self.inner
            .state
            .lock()
            .session
            .clone()
            .ok_or_else(|| ClassError::invalid_state("not in a class"))
    }

    fn update_session(&self, f: impl FnOnce(&mut Session)) {
        if let Some(session) = self.inner.state.lock().session.as_mut() {
            f(session);
        }
    }

    // ---- inbound ----

    fn channel_callback(&self) -> EventCallback {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                ClassService { inner }.handle_channel_event(event);
            }
        })
    }

    fn handle_channel_event(&self, event: ChannelEvent) {
        let inbound = match InboundEvent::decode(&event) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(channel = %event.channel, event = %event.name, error = %e, "Dropping malformed event");
                return;
            }
        };

        let normalized = self.inner.state.lock().normalize(inbound, &event);
        let Some(class_event) = normalized else {
            return;
        };

        self.dispatch(&class_event);

        if let ClassEvent::PrivateChatEnded { by, .. } = &class_event {
            tracing::info!(channel = %event.channel, by = %by, "Private chat ended by partner");
            self.spawn_return_to_main();
        }
    }

    fn spawn_return_to_main(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available to leave the private chat");
            return;
        };
        let service = self.clone();
        handle.spawn(async move {
            let Ok(_guard) = service.inner.switch_lock.try_lock() else {
                return;
            };
            if let Err(e) = service.leave_private(false).await {
                tracing::error!(error = %e, "Failed to return to the class channel");
            }
        });
    }

    // ---- lifecycle ----

    async fn connect_with_backoff(&self, client_id: &str) -> Result<()> {
        let policy = self.inner.options.reconnect;
        let mut last_error = String::new();

        for attempt in 0..policy.max_attempts {
            match self.inner.transport.connect(client_id).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "Connected after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt + 1 < policy.max_attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        tracing::error!(max_attempts = policy.max_attempts, "Max reconnection attempts reached");
        Err(ClassError::Connection(format!(
            "gave up after {} attempts: {}",
            policy.max_attempts, last_error
        )))
    }

    async fn establish(&self, session: &Session) -> Result<()> {
        self.connect_with_backoff(&session.user.id).await?;
        self.inner
            .transport
            .subscribe_channel(&session.main_channel, self.channel_callback(), None)
            .await?;
        if let Some(inbox) = &session.inbox_channel {
            self.inner
                .transport
                .subscribe_channel(inbox, self.channel_callback(), None)
                .await?;
        }
        Ok(())
    }

    /// Joins `class_id` as `user`. History of the last two minutes is replayed
    /// to handlers before live traffic.
    pub async fn join_class(&self, class_id: &str, user: User) -> Result<()> {
        let class_id = class_id.trim();
        if class_id.is_empty() {
            return Err(ClassError::invalid_state("class id is empty"));
        }

        let session = Session {
            class_id: class_id.to_string(),
            main_channel: main_channel(&self.inner.options.channel_prefix, class_id),
            inbox_channel: (user.role == Role::Student).then(|| inbox_channel(&user.id)),
            user: user.clone(),
            phase: Phase::Joining,
            private_chat_started_at: None,
        };

        {
            let mut state = self.inner.state.lock();
            if state.session.is_some() {
                return Err(ClassError::invalid_state("already in a class"));
            }
            state.reset();
            state.names.register(&user.id, &user.name);
            state.session = Some(session.clone());
        }

        if let Err(e) = self.establish(&session).await {
            tracing::error!(class_id = %class_id, user_id = %user.id, error = %e, "Failed to join class");
            self.inner.transport.disconnect().await;
            self.inner.state.lock().reset();
            return Err(ClassError::Join(e.to_string()));
        }

        let completed = {
            let mut state = self.inner.state.lock();
            match state.session.as_mut() {
                Some(s) if s.phase == Phase::Joining => {
                    s.phase = Phase::Joined;
                    true
                }
                _ => false,
            }
        };
        if !completed {
            // The leave already ran; drop what establish opened after it
            self.inner.transport.disconnect().await;
            return Err(ClassError::Join("left before the join completed".to_string()));
        }
        self.spawn_connection_monitor();

        if let Err(e) = self.inner.notifier.notify_join(class_id, &user).await {
            tracing::warn!(class_id = %class_id, user_id = %user.id, error = %e, "Join notification failed");
        }

        tracing::info!(
            class_id = %class_id,
            user_id = %user.id,
            role = user.role.as_str(),
            "Joined class"
        );
        Ok(())
    }

    /// Leaves the class from any phase. A no-op when not in a class.
    pub async fn leave_class(&self) -> Result<()> {
        let Some(session) = self.inner.state.lock().session.clone() else {
            return Ok(());
        };
        self.stop_connection_monitor();

        if let Err(e) = self.inner.notifier.notify_leave(&session.class_id, &session.user).await {
            tracing::warn!(class_id = %session.class_id, error = %e, "Leave notification failed");
        }
        if let Phase::InPrivateChat { channel, .. } = &session.phase {
            self.publish_private_end(&session, channel).await;
        }

        let mut channels = session.active_channels();
        if !channels.contains(&session.main_channel) {
            channels.push(session.main_channel.clone());
        }
        for channel in channels {
            if let Err(e) = self.inner.transport.unsubscribe_channel(&channel).await {
                tracing::warn!(channel = %channel, error = %e, "Unsubscribe failed");
            }
        }
        self.inner.transport.disconnect().await;
        self.inner.state.lock().reset();

        tracing::info!(class_id = %session.class_id, user_id = %session.user.id, "Left class");
        Ok(())
    }

    /// Drops the connection and resubscribes the channels of the current phase.
    pub async fn reconnect(&self) -> Result<()> {
        let session = self.session()?;
        tracing::info!(user_id = %session.user.id, "Reconnecting");

        self.inner.transport.disconnect().await;
        self.connect_with_backoff(&session.user.id).await?;

        for channel in session.active_channels() {
            self.inner
                .transport
                .subscribe_channel(&channel, self.channel_callback(), None)
                .await?;
        }

        tracing::info!(user_id = %session.user.id, "Connection restored");
        self.dispatch(&ClassEvent::ConnectionRestored);
        Ok(())
    }

    /// Teardown without awaiting: leave beacon plus background disconnect.
    pub fn dispose(&self) {
        self.stop_connection_monitor();
        let session = self.inner.state.lock().session.take();
        self.inner.state.lock().reset();
        self.inner.handlers.lock().clear();

        let Some(session) = session else {
            return;
        };

        self.inner.notifier.beacon_leave(&session.class_id, &session.user);

        let private_end = match &session.phase {
            Phase::InPrivateChat { channel, .. } => {
                match envelope(&session, BROADCAST, names::PRIVATE_CHAT_END, &Value::Null) {
                    Ok(payload) => Some((channel.clone(), payload)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to build private chat end");
                        None
                    }
                }
            }
            _ => None,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = self.inner.transport.clone();
                handle.spawn(async move {
                    if let Some((channel, payload)) = private_end {
                        if let Err(e) = transport.publish(&channel, names::PRIVATE_CHAT_END, payload).await {
                            tracing::warn!(channel = %channel, error = %e, "Failed to notify partner of private chat end");
                        }
                    }
                    transport.disconnect().await
                });
            }
            Err(_) => tracing::warn!("No runtime available, transport left open"),
        }
        tracing::info!(class_id = %session.class_id, "Class service disposed");
    }

    // ---- connection recovery ----

    /// Watches the transport for drops nobody asked for and brings the
    /// session back with the usual backoff.
    fn spawn_connection_monitor(&self) {
        let mut state = self.inner.transport.connection_state();
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = state.borrow_and_update().clone();
                let ConnectionState::Lost(reason) = current else {
                    continue;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                ClassService { inner }.recover_connection(reason).await;
            }
        });

        if let Some(previous) = self.inner.monitor.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_connection_monitor(&self) {
        if let Some(task) = self.inner.monitor.lock().take() {
            task.abort();
        }
    }

    async fn recover_connection(&self, reason: String) {
        if self.session().is_err() {
            return;
        }
        tracing::warn!(reason = %reason, "Connection lost, reconnecting");
        self.dispatch(&ClassEvent::ConnectionLost { reason });

        let _switch = self.inner.switch_lock.lock().await;
        if let Err(e) = self.reconnect().await {
            tracing::error!(error = %e, "Giving up on the connection");
            self.dispatch(&ClassEvent::ConnectionFailed {
                reason: e.to_string(),
            });
        }
    }

    // ---- private chat ----

    fn try_switch(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.inner
            .switch_lock
            .try_lock()
            .map_err(|_| ClassError::invalid_state("a channel switch is already in progress"))
    }

    async fn enter_private(&self, session: &Session, channel: String, partner_id: &str, partner_name: &str) -> Result<()> {
        let started_at = now_millis();
        self.update_session(|s| s.private_chat_started_at = Some(started_at));

        let transport = &self.inner.transport;
        if let Err(e) = transport.unsubscribe_channel(&session.main_channel).await {
            self.update_session(|s| s.private_chat_started_at = None);
            return Err(ClassError::ChannelSwitch(e.to_string()));
        }

        if let Err(e) = transport.subscribe_channel(&channel, self.channel_callback(), None).await {
            tracing::error!(channel = %channel, error = %e, "Failed to open private channel");
            self.update_session(|s| s.private_chat_started_at = None);
            if let Err(restore) = transport
                .subscribe_channel(&session.main_channel, self.channel_callback(), Some(started_at))
                .await
            {
                tracing::error!(channel = %session.main_channel, error = %restore, "Failed to restore class channel");
            }
            return Err(ClassError::ChannelSwitch(e.to_string()));
        }

        self.update_session(|s| {
            s.phase = Phase::InPrivateChat {
                channel: channel.clone(),
                partner_id: partner_id.to_string(),
                partner_name: partner_name.to_string(),
            };
        });

        tracing::info!(channel = %channel, partner_id = %partner_id, started_at, "Entered private chat");
        Ok(())
    }

    /// Teacher side: moves into a private chat with `student_id` and invites them.
    pub async fn start_private_chat(&self, student_id: &str, student_name: &str) -> Result<()> {
        let _switch = self.try_switch()?;
        let session = self.session()?;
        if !session.user.is_teacher() {
            return Err(ClassError::invalid_state("only the teacher can start a private chat"));
        }
        if session.phase != Phase::Joined {
            return Err(ClassError::invalid_state("not in the class channel"));
        }

        let channel = private_channel(&session.user.id, student_id);
        self.enter_private(&session, channel, student_id, student_name).await?;

        let request = PrivateChatRequest {
            class_id: session.class_id.clone(),
            teacher_id: session.user.id.clone(),
            teacher_name: session.user.name.clone(),
            student_id: student_id.to_string(),
            student_name: student_name.to_string(),
        };

        let invite = envelope(&session, student_id, names::PRIVATE_CHAT_REQUEST, &request)?;
        if let Err(e) = self
            .inner
            .transport
            .publish(&inbox_channel(student_id), names::PRIVATE_CHAT_REQUEST, invite)
            .await
        {
            tracing::warn!(student_id = %student_id, error = %e, "Failed to deliver private chat invite");
        }
        if let Err(e) = self.inner.notifier.request_private_chat(&request).await {
            tracing::warn!(student_id = %student_id, error = %e, "Private chat request notification failed");
        }
        Ok(())
    }

    /// Student side: joins the private chat the teacher opened.
    pub async fn accept_private_chat(&self, teacher_id: &str, teacher_name: &str) -> Result<()> {
        let _switch = self.try_switch()?;
        let session = self.session()?;
        if session.user.is_teacher() {
            return Err(ClassError::invalid_state("only a student can accept a private chat"));
        }
        if session.phase != Phase::Joined {
            return Err(ClassError::invalid_state("not in the class channel"));
        }

        let channel = private_channel(teacher_id, &session.user.id);
        self.enter_private(&session, channel, teacher_id, teacher_name).await
    }

    /// Returns to the class channel, replaying everything published there since
    /// the private chat started.
    pub async fn end_private_chat(&self) -> Result<()> {
        let _switch = self.try_switch()?;
        self.leave_private(true).await
    }

    /// Best effort: tells the partner on `channel` that the chat is over.
    async fn publish_private_end(&self, session: &Session, channel: &str) {
        let result = match envelope(session, BROADCAST, names::PRIVATE_CHAT_END, &Value::Null) {
            Ok(end) => self.inner.transport.publish(channel, names::PRIVATE_CHAT_END, end).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(channel = %channel, error = %e, "Failed to notify partner of private chat end");
        }
    }

    async fn leave_private(&self, notify_partner: bool) -> Result<()> {
        let session = self.session()?;
        let Phase::InPrivateChat { channel, .. } = &session.phase else {
            return Err(ClassError::invalid_state("not in a private chat"));
        };
        let started_at = session.private_chat_started_at.unwrap_or_else(now_millis);
        let transport = &self.inner.transport;

        if notify_partner {
            self.publish_private_end(&session, channel).await;
        }

        if let Err(e) = transport.unsubscribe_channel(channel).await {
            tracing::warn!(channel = %channel, error = %e, "Unsubscribe failed");
        }

        let resubscribed = transport
            .subscribe_channel(&session.main_channel, self.channel_callback(), Some(started_at))
            .await;

        self.update_session(|s| {
            s.phase = Phase::Joined;
            s.private_chat_started_at = None;
        });

        resubscribed.map_err(|e| ClassError::ChannelSwitch(e.to_string()))?;
        tracing::info!(channel = %session.main_channel, since = started_at, "Returned to class channel");
        Ok(())
    }

    // ---- outbound ----

    /// Publishes a chat line on the class channel. Delivery to the sender
    /// happens through its own subscription.
    pub async fn send_message(&self, text: &str, to: &str, kind: MessageKind) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClassError::invalid_state("message is empty"));
        }
        let session = self.session()?;
        if session.phase != Phase::Joined {
            return Err(ClassError::invalid_state("not in the class channel"));
        }

        let payload = envelope(&session, to, names::CHAT, &ChatContent::new(text, kind))?;
        self.inner
            .transport
            .publish(&session.main_channel, names::CHAT, payload)
            .await
            .map_err(|e| ClassError::send(e.to_string()))
    }

    pub async fn send_private_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClassError::invalid_state("message is empty"));
        }
        let session = self.session()?;
        let Phase::InPrivateChat { channel, partner_id, .. } = &session.phase else {
            return Err(ClassError::invalid_state("not in a private chat"));
        };

        let content = ChatContent::new(text, MessageKind::PrivateChat);
        let payload = envelope(&session, partner_id, names::PRIVATE_CHAT, &content)?;
        self.inner
            .transport
            .publish(channel, names::PRIVATE_CHAT, payload)
            .await
            .map_err(|e| ClassError::send(e.to_string()))
    }

    /// Teacher announcement, relayed by the backend as a system message.
    pub async fn send_announcement(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClassError::invalid_state("announcement is empty"));
        }
        let session = self.session()?;
        if !session.user.is_teacher() {
            return Err(ClassError::invalid_state("only the teacher can announce"));
        }
        if session.phase != Phase::Joined {
            return Err(ClassError::invalid_state("not in the class channel"));
        }

        let content = serde_json::to_value(ChatContent::new(text, MessageKind::System))
            .map_err(TransportError::from)?;
        let announcement = Envelope::new(&session.class_id, &session.user, BROADCAST, names::CHAT, content);
        self.inner
            .notifier
            .post_chat(&announcement)
            .await
            .map_err(|e| ClassError::send(e.to_string()))
    }

    /// Turns the teacher's cursor stream on or off for everyone in the class.
    pub async fn set_cursor_streaming(&self, enabled: bool) -> Result<()> {
        let session = self.session()?;
        if !session.user.is_teacher() {
            return Err(ClassError::invalid_state("only the teacher can stream the cursor"));
        }
        if session.phase == Phase::Joining {
            return Err(ClassError::invalid_state("still joining"));
        }

        let transport = &self.inner.transport;
        let toggle = envelope(&session, BROADCAST, names::CURSOR_TOGGLE, &ToggleContent { enabled })?;
        transport
            .publish(&session.main_channel, names::CURSOR_TOGGLE, toggle)
            .await
            .map_err(|e| ClassError::send(e.to_string()))?;

        if !enabled {
            let sentinel = CursorContent {
                x: -1.0,
                y: -1.0,
                timestamp: Some(now_millis()),
            };
            let payload = envelope(&session, BROADCAST, names::CURSOR, &sentinel)?;
            if let Err(e) = transport.publish(&session.main_channel, names::CURSOR, payload).await {
                tracing::warn!(error = %e, "Failed to clear cursor");
            }
        }

        if let Err(e) = self
            .inner
            .notifier
            .notify_cursor_toggle(&session.class_id, &session.user.id, &session.user.name, enabled)
            .await
        {
            tracing::warn!(class_id = %session.class_id, error = %e, "Cursor toggle notification failed");
        }

        tracing::info!(class_id = %session.class_id, enabled, "Cursor streaming toggled");
        Ok(())
    }

    pub async fn send_cursor(&self, x: f64, y: f64) -> Result<()> {
        let session = self.session()?;
        if session.phase != Phase::Joined {
            return Err(ClassError::invalid_state("not in the class channel"));
        }

        let content = CursorContent {
            x,
            y,
            timestamp: Some(now_millis()),
        };
        let payload = envelope(&session, BROADCAST, names::CURSOR, &content)?;
        self.inner
            .transport
            .publish(&session.main_channel, names::CURSOR, payload)
            .await
            .map_err(|e| ClassError::send(e.to_string()))
    }
}
