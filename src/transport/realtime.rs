use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{default_history_since, now_millis, ChannelEvent, ConnectionState, EventCallback, Transport};
use crate::config::{RealtimeConfig, PLACEHOLDER_API_KEY};
use crate::error::TransportError;

/// Protocol message actions
mod action {
    pub const HEARTBEAT: u8 = 0;
    pub const ACK: u8 = 1;
    pub const NACK: u8 = 2;
    pub const CONNECTED: u8 = 4;
    pub const DISCONNECTED: u8 = 6;
    pub const CLOSE: u8 = 7;
    pub const CLOSED: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const ATTACH: u8 = 10;
    pub const ATTACHED: u8 = 11;
    pub const DETACH: u8 = 12;
    pub const DETACHED: u8 = 13;
    pub const MESSAGE: u8 = 15;
}

const PROTOCOL_VERSION: &str = "1.2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolMessage {
    action: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg_serial: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<WireMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    fn new(action: u8) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    fn for_channel(action: u8, channel: &str) -> Self {
        Self {
            action,
            channel: Some(channel.to_string()),
            ..Self::default()
        }
    }

    fn error_text(&self) -> String {
        self.error
            .as_ref()
            .map(ErrorInfo::to_string)
            .unwrap_or_else(|| format!("action {}", self.action))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

impl WireMessage {
    fn json(name: &str, payload: &Value) -> Result<Self, TransportError> {
        Ok(Self {
            name: Some(name.to_string()),
            data: Some(Value::String(serde_json::to_string(payload)?)),
            encoding: Some("json".to_string()),
            ..Self::default()
        })
    }

    fn into_event(self, channel: &str, fallback_timestamp: Option<i64>) -> ChannelEvent {
        let is_json = self
            .encoding
            .as_deref()
            .map(|e| e.split('/').any(|part| part == "json"))
            .unwrap_or(false);

        let data = match self.data {
            Some(Value::String(text)) if is_json => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            Some(other) => other,
            None => Value::Null,
        };

        ChannelEvent {
            channel: channel.to_string(),
            name: self.name.unwrap_or_default(),
            data,
            timestamp: self
                .timestamp
                .or(fallback_timestamp)
                .unwrap_or_else(now_millis),
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorInfo {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (code {}, status {})",
            self.message.as_deref().unwrap_or("unknown error"),
            self.code.unwrap_or(0),
            self.status_code.unwrap_or(0)
        )
    }
}

struct ChannelSlot {
    callback: EventCallback,
    /// Some while history is being replayed; live events queue here
    replay_buffer: Option<Vec<ChannelEvent>>,
}

type Waiter = oneshot::Sender<Result<(), String>>;

/// State shared between the transport and its reader task
struct Shared {
    connected: AtomicBool,
    state: watch::Sender<ConnectionState>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    attach_waiters: Mutex<HashMap<String, Waiter>>,
    ack_waiters: Mutex<HashMap<u64, Waiter>>,
}

impl Default for Shared {
    fn default() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connected: AtomicBool::new(false),
            state,
            channels: Mutex::new(HashMap::new()),
            attach_waiters: Mutex::new(HashMap::new()),
            ack_waiters: Mutex::new(HashMap::new()),
        }
    }
}

impl Shared {
    fn handle(&self, msg: ProtocolMessage) {
        match msg.action {
            action::HEARTBEAT => tracing::trace!("Heartbeat received"),
            action::ACK | action::NACK => {
                let Some(serial) = msg.msg_serial else {
                    return;
                };
                let result = if msg.action == action::ACK {
                    Ok(())
                } else {
                    Err(msg.error_text())
                };
                let mut waiters = self.ack_waiters.lock();
                for s in serial..serial + msg.count.unwrap_or(1) {
                    if let Some(waiter) = waiters.remove(&s) {
                        let _ = waiter.send(result.clone());
                    }
                }
            }
            action::ATTACHED => {
                if let Some(channel) = &msg.channel {
                    if let Some(waiter) = self.attach_waiters.lock().remove(channel) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            action::DETACHED | action::ERROR if msg.channel.is_some() => {
                let channel = msg.channel.clone().unwrap_or_default();
                let reason = msg.error_text();
                match self.attach_waiters.lock().remove(&channel) {
                    Some(waiter) => {
                        let _ = waiter.send(Err(reason));
                    }
                    None => tracing::warn!(channel = %channel, reason = %reason, "Channel detached"),
                }
            }
            action::ERROR | action::DISCONNECTED | action::CLOSED => {
                self.connection_lost(&msg.error_text());
            }
            action::MESSAGE => {
                let Some(channel) = msg.channel else {
                    return;
                };
                for wire in msg.messages.unwrap_or_default() {
                    self.dispatch(wire.into_event(&channel, msg.timestamp));
                }
            }
            other => tracing::trace!(action = other, "Ignoring protocol message"),
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        let channel = event.channel.clone();
        let callback = {
            let mut channels = self.channels.lock();
            let Some(slot) = channels.get_mut(&channel) else {
                return;
            };
            match slot.replay_buffer.as_mut() {
                Some(buffer) => {
                    buffer.push(event);
                    return;
                }
                None => slot.callback.clone(),
            }
        };
        callback(event);
    }

    fn fail_pending(&self, reason: &str) {
        for (_, waiter) in self.ack_waiters.lock().drain() {
            let _ = waiter.send(Err(reason.to_string()));
        }
        for (_, waiter) in self.attach_waiters.lock().drain() {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    fn connection_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(reason = %reason, "Realtime connection lost");
            self.state.send_replace(ConnectionState::Lost(reason.to_string()));
        }
        self.fail_pending(reason);
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    next_serial: AtomicU64,
}

impl Connection {
    fn send(&self, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(msg)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Transport for the managed pub/sub provider: websocket realtime protocol for
/// live traffic, REST for history.
pub struct RealtimeTransport {
    config: RealtimeConfig,
    http: reqwest::Client,
    shared: Arc<Shared>,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl RealtimeTransport {
    pub fn new(config: RealtimeConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            shared: Arc::new(Shared::default()),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    fn realtime_url(&self, client_id: &str) -> String {
        format!(
            "wss://{}/?key={}&clientId={}&format=json&heartbeats=true&v={}",
            self.config.realtime_host,
            urlencoding::encode(self.config.api_key.trim()),
            urlencoding::encode(client_id),
            PROTOCOL_VERSION
        )
    }

    async fn send(&self, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(conn) if self.is_connected() => conn.send(msg),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn attach(&self, channel: &str) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.shared.attach_waiters.lock().insert(channel.to_string(), tx);

        if let Err(e) = self.send(&ProtocolMessage::for_channel(action::ATTACH, channel)).await {
            self.shared.attach_waiters.lock().remove(channel);
            return Err(e);
        }

        let attach_error = |reason: String| TransportError::Attach {
            channel: channel.to_string(),
            reason,
        };

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(attach_error(reason)),
            Ok(Err(_)) => Err(attach_error("connection closed".to_string())),
            Err(_) => {
                self.shared.attach_waiters.lock().remove(channel);
                Err(attach_error("timed out waiting for ATTACHED".to_string()))
            }
        }
    }

    /// Newest `history_limit` events since `since`, oldest first
    async fn fetch_history(
        &self,
        channel: &str,
        since: i64,
    ) -> Result<Vec<ChannelEvent>, TransportError> {
        let (key_name, key_secret) = self
            .config
            .key_parts()
            .ok_or_else(|| TransportError::history(channel, "API key must be keyName:keySecret"))?;

        let url = format!(
            "https://{}/channels/{}/messages",
            self.config.rest_host,
            urlencoding::encode(channel)
        );

        let response = self
            .http
            .get(&url)
            .basic_auth(key_name, Some(key_secret))
            .query(&[
                ("start", since.to_string()),
                ("direction", "backwards".to_string()),
                ("limit", self.config.history_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::history(channel, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::history(channel, format!("HTTP {}", status)));
        }

        let mut messages: Vec<WireMessage> = response
            .json()
            .await
            .map_err(|e| TransportError::history(channel, e.to_string()))?;
        messages.reverse();

        Ok(messages
            .into_iter()
            .map(|m| m.into_event(channel, None))
            .collect())
    }

    /// Hands buffered live events to the callback until the buffer stays empty,
    /// then switches the slot to direct delivery.
    fn drain_replay_buffer(&self, channel: &str, on_event: &EventCallback) {
        loop {
            let pending = {
                let mut channels = self.shared.channels.lock();
                let Some(slot) = channels.get_mut(channel) else {
                    return;
                };
                match slot.replay_buffer.take() {
                    Some(buffer) if !buffer.is_empty() => {
                        slot.replay_buffer = Some(Vec::new());
                        buffer
                    }
                    _ => return,
                }
            };
            for event in pending {
                on_event(event);
            }
        }
    }
}

async fn wait_connected<S>(stream: &mut S) -> Result<(), TransportError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| TransportError::Connection(e.to_string()))?;
        let Message::Text(text) = frame else {
            continue;
        };
        let msg: ProtocolMessage = serde_json::from_str(&text)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        match msg.action {
            action::CONNECTED => return Ok(()),
            action::ERROR | action::DISCONNECTED | action::CLOSED => {
                return Err(TransportError::Connection(msg.error_text()));
            }
            _ => continue,
        }
    }
    Err(TransportError::Connection(
        "connection closed before CONNECTED".to_string(),
    ))
}

#[async_trait]
impl Transport for RealtimeTransport {
    async fn connect(&self, client_id: &str) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            stale.abort();
        }

        let key = self.config.api_key.trim();
        if key.is_empty() {
            return Err(TransportError::Connection(
                "realtime API key is not configured".to_string(),
            ));
        }
        if key == PLACEHOLDER_API_KEY {
            tracing::warn!("Using placeholder realtime API key");
        }

        tracing::info!(
            host = %self.config.realtime_host,
            api_key = %self.config.masked_key(),
            client_id = %client_id,
            "Connecting to realtime provider"
        );

        let (ws_stream, _) = timeout(REQUEST_TIMEOUT, connect_async(self.realtime_url(client_id)))
            .await
            .map_err(|_| TransportError::Connection("connect timed out".to_string()))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (mut sink, mut stream) = ws_stream.split();

        timeout(REQUEST_TIMEOUT, wait_connected(&mut stream))
            .await
            .map_err(|_| TransportError::Connection("timed out waiting for CONNECTED".to_string()))??;

        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Connected);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let heartbeat = self.config.heartbeat_interval().max(MIN_HEARTBEAT);

        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                tracing::error!(error = %e, "Failed to send realtime frame");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            tracing::warn!(error = %e, "Heartbeat ping failed");
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ProtocolMessage>(&text) {
                        Ok(msg) => shared.handle(msg),
                        Err(e) => tracing::warn!(error = %e, raw_message = %text, "Failed to parse realtime frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Realtime websocket error");
                        break;
                    }
                }
            }
            shared.connection_lost("websocket closed");
        });

        *guard = Some(Connection {
            outbound,
            reader,
            writer,
            next_serial: AtomicU64::new(0),
        });

        tracing::info!(client_id = %client_id, "Realtime connection established");
        Ok(())
    }

    async fn subscribe_channel(
        &self,
        channel: &str,
        on_event: EventCallback,
        history_since: Option<i64>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.shared.channels.lock().insert(
            channel.to_string(),
            ChannelSlot {
                callback: on_event.clone(),
                replay_buffer: Some(Vec::new()),
            },
        );

        if let Err(e) = self.attach(channel).await {
            self.shared.channels.lock().remove(channel);
            return Err(e);
        }

        let since = history_since.unwrap_or_else(default_history_since);
        match self.fetch_history(channel, since).await {
            Ok(events) => {
                tracing::debug!(channel = %channel, since, replayed = events.len(), "History replayed");
                for event in events {
                    on_event(event);
                }
            }
            Err(e) => tracing::warn!(error = %e, "History unavailable, continuing with live events"),
        }

        self.drain_replay_buffer(channel, &on_event);
        tracing::info!(channel = %channel, "Subscribed to channel");
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) -> Result<(), TransportError> {
        if self.shared.channels.lock().remove(channel).is_none() {
            return Ok(());
        }

        if let Err(e) = self.send(&ProtocolMessage::for_channel(action::DETACH, channel)).await {
            tracing::debug!(channel = %channel, error = %e, "Detach not sent");
        }
        tracing::info!(channel = %channel, "Unsubscribed from channel");
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        let mut frame = ProtocolMessage::for_channel(action::MESSAGE, channel);
        frame.messages = Some(vec![WireMessage::json(event, &payload)?]);

        let serial = {
            let guard = self.connection.lock().await;
            let conn = match guard.as_ref() {
                Some(conn) if self.is_connected() => conn,
                _ => return Err(TransportError::NotConnected),
            };

            // Serials must go out in order, so assign and send under the lock
            let serial = conn.next_serial.fetch_add(1, Ordering::SeqCst);
            frame.msg_serial = Some(serial);
            self.shared.ack_waiters.lock().insert(serial, tx);
            if let Err(e) = conn.send(&frame) {
                self.shared.ack_waiters.lock().remove(&serial);
                return Err(e);
            }
            serial
        };

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::publish(channel, reason)),
            Ok(Err(_)) => Err(TransportError::publish(channel, "connection closed")),
            Err(_) => {
                self.shared.ack_waiters.lock().remove(&serial);
                Err(TransportError::publish(channel, "timed out waiting for ACK"))
            }
        }
    }

    async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Disconnected);

        if let Some(conn) = connection {
            let _ = conn.send(&ProtocolMessage::new(action::CLOSE));
            conn.reader.abort();
            // Writer drains the CLOSE frame and exits once the sender is dropped
            drop(conn.outbound);
        }

        self.shared.channels.lock().clear();
        self.shared.fail_pending("disconnected");
        tracing::info!("Realtime connection closed");
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}
