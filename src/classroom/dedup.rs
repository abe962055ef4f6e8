use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// How long a join/leave notice for the same user is suppressed
pub const MEMBERSHIP_NOTICE_WINDOW: Duration = Duration::from_secs(5);

/// Deterministic id for a chat event. A live delivery and a history replay of
/// the same event produce the same id.
pub fn message_id(from: &str, timestamp: i64, text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{}-{}-{}", from, timestamp, hex::encode(&digest[..8]))
}

/// Ids of every message dispatched in the current session, in arrival order
#[derive(Debug, Default)]
pub struct MessageLog {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already recorded.
    pub fn record(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Suppresses repeats of a key for a fixed window
#[derive(Debug)]
pub struct RecentWindow {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl RecentWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True if `key` was not seen within the window; marks it as seen.
    pub fn check_and_mark(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);

        if self.seen.contains_key(key) {
            return false;
        }
        self.seen.insert(key.to_string(), now);
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

impl Default for RecentWindow {
    fn default() -> Self {
        Self::new(MEMBERSHIP_NOTICE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_deterministic() {
        let a = message_id("student-ana-abc123", 1_700_000_000_000, "hello");
        let b = message_id("student-ana-abc123", 1_700_000_000_000, "hello");
        assert_eq!(a, b);
        assert!(a.starts_with("student-ana-abc123-1700000000000-"));
    }

    #[test]
    fn test_message_id_varies_with_inputs() {
        let base = message_id("a", 1, "hello");
        assert_ne!(base, message_id("b", 1, "hello"));
        assert_ne!(base, message_id("a", 2, "hello"));
        assert_ne!(base, message_id("a", 1, "hello!"));
    }

    #[test]
    fn test_message_log() {
        let mut log = MessageLog::new();
        assert!(log.record("m1"));
        assert!(!log.record("m1"));
        assert!(log.record("m2"));
        assert_eq!(log.len(), 2);
        assert!(log.contains("m1"));

        log.clear();
        assert!(log.is_empty());
        assert!(log.record("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_window_expires() {
        let mut window = RecentWindow::default();
        assert!(window.check_and_mark("join-student-ana-abc123"));
        assert!(!window.check_and_mark("join-student-ana-abc123"));
        assert!(window.check_and_mark("join-student-bob-abc123"));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!window.check_and_mark("join-student-ana-abc123"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(window.check_and_mark("join-student-ana-abc123"));
    }
}
