use std::time::Duration;

use tokio::time::Instant;

/// How long a notification stays visible
pub const NOTIFICATION_DURATION: Duration = Duration::from_secs(3);

/// A transient banner. Expiry is checked on read, so no timer task is needed.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    current: Option<(String, Instant)>,
}

impl Notification {
    /// Replaces any visible notification
    pub fn show(&mut self, text: impl Into<String>) {
        self.current = Some((text.into(), Instant::now() + NOTIFICATION_DURATION));
    }

    pub fn current(&self) -> Option<&str> {
        match &self.current {
            Some((text, deadline)) if Instant::now() < *deadline => Some(text),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
