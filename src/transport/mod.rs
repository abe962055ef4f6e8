//! Pub/sub transport adapters.
//!
//! A [`Transport`] holds one connection to the pub/sub provider and exposes
//! channel-level operations. It never retries; reconnect policy belongs to the
//! caller. Unexpected drops are reported through [`Transport::connection_state`]
//! so the caller can run its own reconnect loop.
//!
//! - `realtime`: the managed provider's websocket protocol, with REST history
//! - `memory`: an in-process broker for tests and local runs

mod memory;
mod realtime;

pub use memory::{MemoryBroker, MemoryTransport};
pub use realtime::RealtimeTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::TransportError;

/// Rewind window used when a subscriber gives no explicit anchor
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(120);

/// Upper bound on events replayed per subscribe
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One event as published on a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: String,
    /// Provider-level event name
    pub name: String,
    pub data: Value,
    /// Provider timestamp in milliseconds, identical for live and replayed copies
    pub timestamp: i64,
    pub client_id: Option<String>,
}

pub type EventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Dropped without a `disconnect` call
    Lost(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection; returns immediately if already connected.
    async fn connect(&self, client_id: &str) -> Result<(), TransportError>;

    /// Attaches `on_event` to every event on `channel`. History since
    /// `history_since` (default: now minus two minutes) is delivered first,
    /// oldest first, then live events.
    async fn subscribe_channel(
        &self,
        channel: &str,
        on_event: EventCallback,
        history_since: Option<i64>,
    ) -> Result<(), TransportError>;

    /// Detaches the channel listener. Unknown channels are ignored.
    async fn unsubscribe_channel(&self, channel: &str) -> Result<(), TransportError>;

    async fn publish(&self, channel: &str, event: &str, payload: Value)
        -> Result<(), TransportError>;

    /// Closes the connection. Publish and subscribe fail until the next connect.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Watches connection state changes. `disconnect` moves to
    /// `Disconnected`; only a drop nobody asked for yields `Lost`.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Wall clock in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn default_history_since() -> i64 {
    now_millis() - DEFAULT_HISTORY_WINDOW.as_millis() as i64
}
