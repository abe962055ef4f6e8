//! REST backend notifications: membership bookkeeping, cursor toggles,
//! private-chat requests and server-relayed chat.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::classroom::events::Envelope;
use crate::classroom::models::{PrivateChatRequest, Role, User};
use crate::config::ApiConfig;
use crate::error::NotifyError;

pub mod endpoints {
    pub const JOIN: &str = "/class/join";
    pub const LEAVE: &str = "/class/leave";
    pub const CHAT: &str = "/class/chat";
    pub const TOGGLE_CURSOR: &str = "/class/toggle-cursor";
    pub const PRIVATE_CHAT: &str = "/class/private-chat";
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_join(&self, class_id: &str, user: &User) -> Result<(), NotifyError>;

    async fn notify_leave(&self, class_id: &str, user: &User) -> Result<(), NotifyError>;

    async fn notify_cursor_toggle(
        &self,
        class_id: &str,
        teacher_id: &str,
        teacher_name: &str,
        enabled: bool,
    ) -> Result<(), NotifyError>;

    async fn request_private_chat(&self, request: &PrivateChatRequest) -> Result<(), NotifyError>;

    /// Asks the backend to publish `envelope` on the class channel
    async fn post_chat(&self, envelope: &Envelope) -> Result<(), NotifyError>;

    /// Fire-and-forget leave notification for teardown paths that cannot await.
    fn beacon_leave(&self, class_id: &str, user: &User);
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CursorToggleBody<'a> {
    class_id: &'a str,
    teacher_id: &'a str,
    teacher_name: &'a str,
    enabled: bool,
}

/// `{classId, studentId, studentName}` or `{classId, teacherId, teacherName}`
fn membership_body(class_id: &str, user: &User) -> Value {
    match user.role {
        Role::Student => json!({
            "classId": class_id,
            "studentId": user.id,
            "studentName": user.name,
        }),
        Role::Teacher => json!({
            "classId": class_id,
            "teacherId": user.id,
            "teacherName": user.name,
        }),
    }
}

#[derive(Clone)]
pub struct HttpNotifier {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: &ApiConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| NotifyError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized + Sync>(&self, path: &str, body: &T) -> Result<(), NotifyError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());

        Err(NotifyError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify_join(&self, class_id: &str, user: &User) -> Result<(), NotifyError> {
        self.post(endpoints::JOIN, &membership_body(class_id, user)).await?;
        tracing::debug!(class_id = %class_id, user_id = %user.id, "Join notified");
        Ok(())
    }

    async fn notify_leave(&self, class_id: &str, user: &User) -> Result<(), NotifyError> {
        self.post(endpoints::LEAVE, &membership_body(class_id, user)).await?;
        tracing::debug!(class_id = %class_id, user_id = %user.id, "Leave notified");
        Ok(())
    }

    async fn notify_cursor_toggle(
        &self,
        class_id: &str,
        teacher_id: &str,
        teacher_name: &str,
        enabled: bool,
    ) -> Result<(), NotifyError> {
        let body = CursorToggleBody {
            class_id,
            teacher_id,
            teacher_name,
            enabled,
        };
        self.post(endpoints::TOGGLE_CURSOR, &body).await
    }

    async fn request_private_chat(&self, request: &PrivateChatRequest) -> Result<(), NotifyError> {
        self.post(endpoints::PRIVATE_CHAT, request).await
    }

    async fn post_chat(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        self.post(endpoints::CHAT, envelope).await
    }

    fn beacon_leave(&self, class_id: &str, user: &User) {
        let notifier = self.clone();
        let class_id = class_id.to_string();
        let user = user.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = notifier.notify_leave(&class_id, &user).await {
                        tracing::warn!(class_id = %class_id, error = %e, "Leave beacon failed");
                    }
                });
            }
            Err(_) => tracing::warn!(class_id = %class_id, "No runtime for leave beacon, skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_membership_body() {
        let user = User {
            id: "student-ana-abc123".to_string(),
            name: "Ana".to_string(),
            role: Role::Student,
        };
        let body = membership_body("demo", &user);
        assert_eq!(body["classId"], "demo");
        assert_eq!(body["studentId"], "student-ana-abc123");
        assert_eq!(body["studentName"], "Ana");
        assert!(body.get("teacherId").is_none());
    }

    #[test]
    fn test_teacher_membership_body() {
        let user = User {
            id: "teacher-abc".to_string(),
            name: "Teacher".to_string(),
            role: Role::Teacher,
        };
        let body = membership_body("demo", &user);
        assert_eq!(body["teacherId"], "teacher-abc");
        assert!(body.get("studentId").is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let notifier = HttpNotifier::new(&ApiConfig {
            base_url: "http://localhost:5165/api/".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(notifier.base_url(), "http://localhost:5165/api");
    }

    #[test]
    fn test_cursor_toggle_body_is_camel_case() {
        let body = serde_json::to_value(CursorToggleBody {
            class_id: "demo",
            teacher_id: "teacher-abc",
            teacher_name: "Teacher",
            enabled: false,
        })
        .unwrap();
        assert_eq!(body["teacherName"], "Teacher");
        assert_eq!(body["enabled"], false);
    }
}
