// End-to-end class flows over the in-process broker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use classroom_chat::classroom::channels::{main_channel, private_channel};
use classroom_chat::classroom::events::Envelope;
use classroom_chat::classroom::{ClassEvent, MessageKind, Phase, PrivateChatRequest, Role, User};
use classroom_chat::error::NotifyError;
use classroom_chat::notifier::Notifier;
use classroom_chat::pages::{PageSettings, StudentPage, TeacherPage, CONNECTION_FAILED_TEXT, HAND_RAISE_TEXT};
use classroom_chat::transport::now_millis;
use classroom_chat::{ClassError, ClassService, MemoryBroker, ServiceOptions};

const CLASS_ID: &str = "demo-class-001";

/// Plays the REST backend: records calls and publishes membership events the
/// way the real server does.
struct FakeBackend {
    broker: MemoryBroker,
    calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn new(broker: &MemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            broker: broker.clone(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn publish_membership(&self, class_id: &str, user: &User, action: &str) {
        let kind = format!("{}-{}", user.role.as_str(), action);
        let content = match user.role {
            Role::Student => json!({ "studentId": user.id, "studentName": user.name, "timestamp": now_millis() }),
            Role::Teacher => json!({ "teacherId": user.id, "teacherName": user.name, "timestamp": now_millis() }),
        };
        self.broker.publish_at(
            &main_channel("class-", class_id),
            "chat",
            json!({ "classId": class_id, "from": user.id, "to": "all", "type": kind, "content": content }),
            now_millis(),
        );
    }
}

#[async_trait]
impl Notifier for FakeBackend {
    async fn notify_join(&self, class_id: &str, user: &User) -> Result<(), NotifyError> {
        self.calls.lock().push(format!("join:{}", user.id));
        self.publish_membership(class_id, user, "join");
        Ok(())
    }

    async fn notify_leave(&self, class_id: &str, user: &User) -> Result<(), NotifyError> {
        self.calls.lock().push(format!("leave:{}", user.id));
        self.publish_membership(class_id, user, "leave");
        Ok(())
    }

    async fn notify_cursor_toggle(
        &self,
        _class_id: &str,
        _teacher_id: &str,
        _teacher_name: &str,
        enabled: bool,
    ) -> Result<(), NotifyError> {
        self.calls.lock().push(format!("cursor:{}", enabled));
        Ok(())
    }

    async fn request_private_chat(&self, request: &PrivateChatRequest) -> Result<(), NotifyError> {
        self.calls.lock().push(format!("private:{}", request.student_id));
        Ok(())
    }

    async fn post_chat(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        self.calls.lock().push("chat".to_string());
        let payload = envelope
            .to_value()
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        self.broker
            .publish_at(&main_channel("class-", &envelope.class_id), "chat", payload, now_millis());
        Ok(())
    }

    fn beacon_leave(&self, _class_id: &str, user: &User) {
        self.calls.lock().push(format!("beacon:{}", user.id));
    }
}

struct Harness {
    broker: MemoryBroker,
    backend: Arc<FakeBackend>,
}

impl Harness {
    fn new() -> Self {
        let broker = MemoryBroker::new();
        let backend = FakeBackend::new(&broker);
        Self { broker, backend }
    }

    fn service(&self) -> ClassService {
        ClassService::new(
            Arc::new(self.broker.transport()),
            self.backend.clone(),
            ServiceOptions::default(),
        )
    }

    fn settings(&self) -> PageSettings {
        PageSettings {
            class_id: CLASS_ID.to_string(),
            ..PageSettings::default()
        }
    }

    async fn teacher(&self) -> (ClassService, TeacherPage) {
        let service = self.service();
        let page = TeacherPage::new(service.clone(), "Ms. Smith", self.settings());
        page.join_class().await.unwrap();
        (service, page)
    }

    async fn student(&self, name: &str) -> (ClassService, StudentPage) {
        let service = self.service();
        let page = StudentPage::new(service.clone(), self.settings());
        page.join_class(name).await.unwrap();
        (service, page)
    }
}

fn count_joins(service: &ClassService) -> Arc<Mutex<Vec<String>>> {
    let joins = Arc::new(Mutex::new(Vec::new()));
    let sink = joins.clone();
    service.on_event(move |event| {
        if let ClassEvent::MemberJoined { member, .. } = event {
            sink.lock().push(member.id.clone());
        }
    });
    joins
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_student_join_reaches_teacher_roster_once() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let joins = count_joins(&teacher_service);

    let (_, student) = harness.student("Ana").await;
    let ana = student.student().unwrap();
    assert!(ana.id.starts_with("student-ana-"));
    assert_eq!(ana.id.len(), "student-ana-".len() + 6);

    let view = teacher.snapshot();
    assert_eq!(view.roster.get(&ana.id).map(String::as_str), Some("Ana"));
    assert_eq!(view.notification.current(), Some("🎉 Ana joined the class"));

    // Reconnect replays the join from history within the suppression window
    teacher_service.reconnect().await.unwrap();
    assert_eq!(*joins.lock(), vec![ana.id.clone()]);
    assert_eq!(teacher.snapshot().roster.len(), 1);
}

#[tokio::test]
async fn test_live_and_replayed_message_shown_once() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let (_, student) = harness.student("Ana").await;

    student.set_draft("What is a monad?");
    student.send_message().await.unwrap();
    assert!(student.snapshot().draft.is_empty());

    teacher_service.reconnect().await.unwrap();

    let count = |messages: &[classroom_chat::classroom::ChatMessageReceived]| {
        messages.iter().filter(|m| m.message == "What is a monad?").count()
    };
    assert_eq!(count(&teacher.snapshot().messages[..]), 1);
    assert_eq!(count(&student.snapshot().messages[..]), 1);

    let line = teacher
        .snapshot()
        .messages
        .into_iter()
        .find(|m| m.message == "What is a monad?")
        .unwrap();
    assert_eq!(line.from_name, "Ana");
    assert_eq!(line.kind, MessageKind::Chat);
}

#[tokio::test]
async fn test_blank_message_is_noop() {
    let harness = Harness::new();
    let (_, student) = harness.student("Ana").await;
    let calls_before = harness.backend.calls();
    let history_before = harness.broker.history(&main_channel("class-", CLASS_ID)).len();

    student.set_draft("   \t ");
    student.send_message().await.unwrap();

    assert_eq!(harness.backend.calls(), calls_before);
    assert_eq!(harness.broker.history(&main_channel("class-", CLASS_ID)).len(), history_before);
    assert!(student.snapshot().connection_error.is_none());
}

#[tokio::test]
async fn test_draft_restored_when_publish_fails() {
    let harness = Harness::new();
    let (_, student) = harness.student("Ana").await;

    harness.broker.fail_publishes(true);
    student.set_draft("hello");
    let err = student.send_message().await.unwrap_err();
    assert!(matches!(err, ClassError::Send(_)));

    let view = student.snapshot();
    assert_eq!(view.draft, "hello");
    assert_eq!(view.connection_error.as_deref(), Some("Failed to send message"));
}

#[tokio::test]
async fn test_hand_raise_and_announcement() {
    let harness = Harness::new();
    let (_, teacher) = harness.teacher().await;
    let (_, student) = harness.student("Ana").await;

    student.raise_hand().await.unwrap();
    teacher.send_announcement("Quiz in five minutes").await.unwrap();

    let view = teacher.snapshot();
    let hand = view.messages.iter().find(|m| m.kind == MessageKind::HandRaise).unwrap();
    assert_eq!(hand.message, HAND_RAISE_TEXT);

    let announcement = student
        .snapshot()
        .messages
        .into_iter()
        .find(|m| m.kind == MessageKind::System && m.message == "Quiz in five minutes");
    assert!(announcement.is_some());
}

#[tokio::test]
async fn test_private_chat_round_trip() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let (student_service, student) = harness.student("Ana").await;
    let ana = student.student().unwrap();

    teacher.start_private_chat(&ana.id).await.unwrap();
    let invite = student.snapshot().pending_invite.unwrap();
    assert_eq!(invite.teacher_id, teacher.teacher().id);
    assert_eq!(invite.teacher_name, "Ms. Smith");
    assert!(harness.backend.calls().contains(&format!("private:{}", ana.id)));

    student.accept_private_chat().await.unwrap();

    let pair = private_channel(&teacher.teacher().id, &ana.id);
    assert_eq!(harness.broker.subscriber_count(&pair), 2);
    assert!(matches!(teacher_service.phase(), Phase::InPrivateChat { ref channel, .. } if *channel == pair));
    assert!(matches!(student_service.phase(), Phase::InPrivateChat { ref channel, .. } if *channel == pair));

    student.set_private_draft("Can you explain it again?");
    student.send_private_message().await.unwrap();

    let panel = teacher.snapshot().private_chat.unwrap();
    assert_eq!(panel.partner_name, "Ana");
    assert_eq!(panel.messages.len(), 1);
    assert_eq!(panel.messages[0].kind, MessageKind::PrivateChat);
    assert!(teacher
        .snapshot()
        .messages
        .iter()
        .all(|m| m.message != "Can you explain it again?"));

    // Teacher ends; the student is moved back to the class channel
    teacher.end_private_chat().await.unwrap();
    settle().await;

    assert_eq!(teacher_service.phase(), Phase::Joined);
    assert_eq!(student_service.phase(), Phase::Joined);
    assert!(student.snapshot().private_chat.is_none());
    assert_eq!(harness.broker.subscriber_count(&pair), 0);
}

#[tokio::test]
async fn test_end_private_chat_rewinds_from_start() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let main = main_channel("class-", CLASS_ID);

    teacher.start_private_chat("student-ana-abc123").await.unwrap();
    let t0 = teacher_service.private_chat_started_at().unwrap();
    assert_eq!(harness.broker.subscriber_count(&main), 0);

    let chat = |text: &str| {
        json!({ "classId": CLASS_ID, "from": "student-bo-zzz999", "fromName": "Bo", "type": "chat", "content": { "text": text } })
    };
    harness.broker.publish_at(&main, "chat", chat("before"), t0 - 1);
    harness.broker.publish_at(&main, "chat", chat("after"), t0 + 1);

    teacher.end_private_chat().await.unwrap();
    assert!(teacher_service.private_chat_started_at().is_none());

    let messages = teacher.snapshot().messages;
    assert_eq!(messages.iter().filter(|m| m.message == "after").count(), 1);
    assert_eq!(messages.iter().filter(|m| m.message == "before").count(), 0);

    let (_, since) = harness
        .broker
        .history_requests()
        .into_iter()
        .filter(|(channel, _)| *channel == main)
        .last()
        .unwrap();
    assert_eq!(since, t0);
}

#[tokio::test]
async fn test_student_leaving_private_chat_frees_teacher() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let (_, student) = harness.student("Ana").await;
    let ana = student.student().unwrap();
    let main = main_channel("class-", CLASS_ID);

    teacher.start_private_chat(&ana.id).await.unwrap();
    student.accept_private_chat().await.unwrap();
    assert!(matches!(teacher_service.phase(), Phase::InPrivateChat { .. }));

    student.leave_class().await.unwrap();
    settle().await;

    assert_eq!(teacher_service.phase(), Phase::Joined);
    assert_eq!(harness.broker.subscriber_count(&main), 1);
    assert_eq!(harness.broker.subscriber_count(&private_channel(&teacher.teacher().id, &ana.id)), 0);

    let view = teacher.snapshot();
    assert!(view.private_chat.is_none());
    // The leave happened while the teacher was away and comes back with the rewind
    assert!(view.roster.is_empty());
}

#[tokio::test]
async fn test_cursor_streaming_and_sentinel() {
    let harness = Harness::new();
    let (_, teacher) = harness.teacher().await;
    let (_, student) = harness.student("Ana").await;

    assert!(!teacher.move_cursor(10.0, 10.0));
    assert!(teacher.toggle_cursor_streaming().await.unwrap());
    assert!(student.snapshot().cursor_streaming);

    assert!(teacher.move_cursor(50.0, 60.0));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cursor = student.snapshot().teacher_cursor.unwrap();
    assert_eq!((cursor.x, cursor.y), (50.0, 60.0));
    assert_eq!(cursor.user_name, "Ms. Smith");

    assert!(!teacher.toggle_cursor_streaming().await.unwrap());
    let view = student.snapshot();
    assert!(view.teacher_cursor.is_none());
    assert!(!view.cursor_streaming);
    assert!(harness.backend.calls().contains(&"cursor:false".to_string()));
}

#[tokio::test]
async fn test_leave_updates_roster_and_resets() {
    let harness = Harness::new();
    let (_, teacher) = harness.teacher().await;
    let (student_service, student) = harness.student("Ana").await;
    let ana = student.student().unwrap();

    student.leave_class().await.unwrap();
    assert_eq!(student_service.phase(), Phase::Idle);
    assert!(!student.snapshot().joined);
    assert!(harness.backend.calls().contains(&format!("leave:{}", ana.id)));

    let view = teacher.snapshot();
    assert!(view.roster.is_empty());
    assert!(view.messages.iter().any(|m| m.message == "Ana left the class"));
}

#[tokio::test]
async fn test_blank_student_name_rejected() {
    let harness = Harness::new();
    let service = harness.service();
    let page = StudentPage::new(service.clone(), harness.settings());

    assert!(page.join_class("   ").await.is_err());
    assert_eq!(page.snapshot().connection_error.as_deref(), Some("Please enter your name"));
    assert_eq!(service.phase(), Phase::Idle);
    assert_eq!(harness.broker.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_join_gives_up_after_max_attempts() {
    let harness = Harness::new();
    harness.broker.fail_next_connects(10);
    let service = harness.service();

    let started = tokio::time::Instant::now();
    let err = service
        .join_class(CLASS_ID, User::student("Ana"))
        .await
        .unwrap_err();

    assert!(matches!(err, ClassError::Join(_)));
    assert_eq!(harness.broker.connect_attempts(), 5);
    assert_eq!(service.phase(), Phase::Idle);
    // 1 + 2 + 4 + 8 seconds between the five attempts
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert!(harness.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_transient_failures() {
    let harness = Harness::new();
    let (service, _teacher) = harness.teacher().await;

    harness.broker.fail_next_connects(2);
    service.reconnect().await.unwrap();
    assert!(service.is_connected());
    assert_eq!(harness.broker.subscriber_count(&main_channel("class-", CLASS_ID)), 1);
}

#[tokio::test]
async fn test_dispose_sends_leave_beacon() {
    let harness = Harness::new();
    let (service, teacher) = harness.teacher().await;
    let id = teacher.teacher().id.clone();

    service.dispose();
    assert_eq!(service.phase(), Phase::Idle);
    assert!(harness.backend.calls().contains(&format!("beacon:{}", id)));
}

#[tokio::test]
async fn test_dropped_connection_is_restored() {
    let harness = Harness::new();
    let (teacher_service, teacher) = harness.teacher().await;
    let (student_service, student) = harness.student("Ana").await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    teacher_service.on_event(move |event| sink.lock().push(event.clone()));

    harness.broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(teacher_service.is_connected());
    assert!(student_service.is_connected());
    assert_eq!(harness.broker.subscriber_count(&main_channel("class-", CLASS_ID)), 2);
    assert!(events.lock().iter().any(|e| matches!(e, ClassEvent::ConnectionLost { .. })));
    assert!(events.lock().iter().any(|e| matches!(e, ClassEvent::ConnectionRestored)));
    assert!(teacher.snapshot().connection_error.is_none());
    assert!(student.snapshot().connection_error.is_none());

    student.set_draft("Still there?");
    student.send_message().await.unwrap();
    let messages = teacher.snapshot().messages;
    assert_eq!(messages.iter().filter(|m| m.message == "Still there?").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_gives_up_after_max_attempts() {
    let harness = Harness::new();
    let (service, teacher) = harness.teacher().await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    service.on_event(move |event| sink.lock().push(event.clone()));

    // Exactly the five attempts of the default policy
    harness.broker.fail_next_connects(5);
    harness.broker.drop_connections();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(events.lock().iter().any(|e| matches!(e, ClassEvent::ConnectionFailed { .. })));
    assert_eq!(
        teacher.snapshot().connection_error.as_deref(),
        Some(CONNECTION_FAILED_TEXT)
    );
    assert!(!service.is_connected());
    // The session survives so the user can retry by hand
    assert_eq!(service.phase(), Phase::Joined);

    service.reconnect().await.unwrap();
    assert!(teacher.snapshot().connection_error.is_none());
}
