use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    default_history_since, now_millis, ChannelEvent, ConnectionState, EventCallback, Transport,
    DEFAULT_HISTORY_LIMIT,
};
use crate::error::TransportError;

#[derive(Default)]
struct ChannelLog {
    history: Vec<ChannelEvent>,
    subscribers: Vec<(u64, EventCallback)>,
}

#[derive(Default)]
struct BrokerState {
    channels: HashMap<String, ChannelLog>,
    next_subscriber: u64,
    connect_failures: u32,
    connect_attempts: u32,
    fail_publishes: bool,
    history_requests: Vec<(String, i64)>,
    clients: Vec<Weak<ClientLink>>,
}

/// In-process pub/sub broker. Every [`MemoryTransport`] created from the same
/// broker sees the same channels and history. Delivery is synchronous on the
/// publishing task.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    history_limit: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// A new client connection handle on this broker
    pub fn transport(&self) -> MemoryTransport {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let link = Arc::new(ClientLink {
            client: Mutex::new(ClientState::default()),
            state,
        });
        self.state.lock().clients.push(Arc::downgrade(&link));
        MemoryTransport {
            broker: self.clone(),
            link,
        }
    }

    /// Drops every live client connection, as a network failure would.
    /// Subscriptions are gone and each client reports `Lost`.
    pub fn drop_connections(&self) {
        let links: Vec<Arc<ClientLink>> = {
            let mut state = self.state.lock();
            state.clients.retain(|link| link.strong_count() > 0);
            state.clients.iter().filter_map(Weak::upgrade).collect()
        };

        for link in links {
            let Some(subscriptions) = link.close() else {
                continue;
            };
            for (channel, id) in subscriptions {
                self.detach(&channel, id);
            }
            link.state
                .send_replace(ConnectionState::Lost("broker dropped the connection".to_string()));
        }
    }

    /// Publishes with an explicit provider timestamp
    pub fn publish_at(&self, channel: &str, event: &str, payload: Value, timestamp: i64) {
        self.deliver(ChannelEvent {
            channel: channel.to_string(),
            name: event.to_string(),
            data: payload,
            timestamp,
            client_id: None,
        });
    }

    pub fn history(&self, channel: &str) -> Vec<ChannelEvent> {
        let state = self.state.lock();
        state
            .channels
            .get(channel)
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.state.lock();
        state
            .channels
            .get(channel)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }

    /// Makes the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// `(channel, history_since)` of every subscribe so far
    pub fn history_requests(&self) -> Vec<(String, i64)> {
        self.state.lock().history_requests.clone()
    }

    fn deliver(&self, event: ChannelEvent) {
        let callbacks: Vec<EventCallback> = {
            let mut state = self.state.lock();
            let log = state.channels.entry(event.channel.clone()).or_default();
            log.history.push(event.clone());
            log.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };

        for callback in callbacks {
            callback(event.clone());
        }
    }

    fn attach(
        &self,
        channel: &str,
        on_event: EventCallback,
        since: i64,
    ) -> (u64, Vec<ChannelEvent>) {
        let mut state = self.state.lock();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.history_requests.push((channel.to_string(), since));

        let log = state.channels.entry(channel.to_string()).or_default();
        log.subscribers.push((id, on_event));

        let mut replay: Vec<ChannelEvent> = log
            .history
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        replay.sort_by_key(|e| e.timestamp);
        let skip = replay.len().saturating_sub(self.history_limit);
        (id, replay.split_off(skip))
    }

    fn detach(&self, channel: &str, subscriber: u64) {
        let mut state = self.state.lock();
        if let Some(log) = state.channels.get_mut(channel) {
            log.subscribers.retain(|(id, _)| *id != subscriber);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct ClientState {
    client_id: Option<String>,
    subscriptions: HashMap<String, u64>,
}

/// Client side of a connection, also reachable from the broker
struct ClientLink {
    client: Mutex<ClientState>,
    state: watch::Sender<ConnectionState>,
}

impl ClientLink {
    /// Marks the client disconnected and hands back its subscriptions.
    /// `None` when it was not connected.
    fn close(&self) -> Option<Vec<(String, u64)>> {
        let mut client = self.client.lock();
        client.client_id.take()?;
        Some(client.subscriptions.drain().collect())
    }
}

/// One client's connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    link: Arc<ClientLink>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn client_id(&self) -> Result<String, TransportError> {
        self.link
            .client
            .lock()
            .client_id
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, client_id: &str) -> Result<(), TransportError> {
        if self.link.client.lock().client_id.is_some() {
            return Ok(());
        }

        {
            let mut broker = self.broker.state.lock();
            broker.connect_attempts += 1;
            if broker.connect_failures > 0 {
                broker.connect_failures -= 1;
                return Err(TransportError::Connection(
                    "broker refused connection".to_string(),
                ));
            }
        }

        self.link.client.lock().client_id = Some(client_id.to_string());
        self.link.state.send_replace(ConnectionState::Connected);
        tracing::debug!(client_id = %client_id, "Memory transport connected");
        Ok(())
    }

    async fn subscribe_channel(
        &self,
        channel: &str,
        on_event: EventCallback,
        history_since: Option<i64>,
    ) -> Result<(), TransportError> {
        self.client_id()?;
        self.unsubscribe_channel(channel).await?;

        let since = history_since.unwrap_or_else(default_history_since);
        let (subscriber, replay) = self.broker.attach(channel, on_event.clone(), since);
        self.link
            .client
            .lock()
            .subscriptions
            .insert(channel.to_string(), subscriber);

        tracing::debug!(channel = %channel, replayed = replay.len(), "Memory channel attached");
        for event in replay {
            on_event(event);
        }
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) -> Result<(), TransportError> {
        let subscriber = self.link.client.lock().subscriptions.remove(channel);
        if let Some(id) = subscriber {
            self.broker.detach(channel, id);
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let client_id = self.client_id()?;
        if self.broker.state.lock().fail_publishes {
            return Err(TransportError::publish(channel, "broker rejected message"));
        }

        self.broker.deliver(ChannelEvent {
            channel: channel.to_string(),
            name: event.to_string(),
            data: payload,
            timestamp: now_millis(),
            client_id: Some(client_id),
        });
        Ok(())
    }

    async fn disconnect(&self) {
        for (channel, id) in self.link.close().unwrap_or_default() {
            self.broker.detach(&channel, id);
        }
        self.link.state.send_replace(ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.link.client.lock().client_id.is_some()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }
}
