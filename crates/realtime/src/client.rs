use crate::channel::{Channel, ChannelBuilder};
use crate::error::RealtimeError;
use crate::message::{ChannelEvent, RealtimeMessage};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// RealtimeClient設定オプション
#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval: u64,
    /// Upper bound on the WebSocket handshake, in milliseconds.
    pub connect_timeout: u64,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 30000, // 30 seconds
            connect_timeout: 10000,    // 10 seconds
        }
    }
}

/// Realtimeクライアント本体
///
/// Cloning is cheap; clones share the socket, the joined channels and the
/// connection state. There is no automatic reconnect: once the socket drops,
/// the next [`ChannelBuilder::subscribe`] opens a new one.
#[derive(Clone)]
pub struct RealtimeClient {
    url: String,
    key: String,
    next_ref: Arc<AtomicU32>,
    pub(crate) channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    socket: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    options: RealtimeClientOptions,
    state: Arc<RwLock<ConnectionState>>,
    is_manually_closed: Arc<AtomicBool>,
    state_change: broadcast::Sender<ConnectionState>,
    access_token: Arc<RwLock<Option<String>>>,
    connect_lock: Arc<Mutex<()>>,
}

impl RealtimeClient {
    /// デフォルトオプションで新しいクライアントを作成
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, RealtimeClientOptions::default())
    }

    /// カスタムオプションで新しいクライアントを作成
    pub fn new_with_options(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        let (state_change_tx, _) = broadcast::channel(16);
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            next_ref: Arc::new(AtomicU32::new(1)),
            channels: Arc::new(RwLock::new(HashMap::new())),
            socket: Arc::new(RwLock::new(None)),
            options,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            is_manually_closed: Arc::new(AtomicBool::new(false)),
            state_change: state_change_tx,
            access_token: Arc::new(RwLock::new(None)),
            connect_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &RealtimeClientOptions {
        &self.options
    }

    /// Set the user access token. Joined channels are told about the new
    /// token right away; later joins carry it in their join payload.
    pub async fn set_auth(&self, token: Option<String>) {
        info!("Setting auth token (is_some: {})", token.is_some());
        *self.access_token.write().await = token.clone();

        let Some(token) = token else {
            return;
        };
        let topics: Vec<String> = self.channels.read().await.keys().cloned().collect();
        for topic in topics {
            let message = RealtimeMessage::new(
                &topic,
                ChannelEvent::AccessToken,
                json!({ "access_token": token }),
                self.next_ref(),
            );
            if let Err(e) = self.send_message(&message).await {
                debug!("Could not push access token to {}: {}", topic, e);
            }
        }
    }

    pub(crate) async fn access_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// 接続状態変更の通知を受け取るためのレシーバーを取得
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_change.subscribe()
    }

    /// 現在の接続状態を取得
    pub async fn get_connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// 特定のトピックに対するチャンネルビルダーを作成
    pub fn channel(&self, topic: &str) -> ChannelBuilder<'_> {
        debug!("Creating channel builder for topic: {}", topic);
        ChannelBuilder::new(self, topic)
    }

    /// Publish `payload` under `event` on a joined channel.
    pub async fn broadcast(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        let topic = full_topic(topic);
        if !self.channels.read().await.contains_key(&topic) {
            return Err(RealtimeError::SubscriptionError(format!(
                "Channel {} is not joined",
                topic
            )));
        }
        let message = RealtimeMessage::new(
            &topic,
            ChannelEvent::Broadcast,
            json!({ "type": "broadcast", "event": event, "payload": payload }),
            self.next_ref(),
        );
        self.send_message(&message).await
    }

    /// 次のメッセージ参照番号を生成
    pub(crate) fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Open the socket unless one is already open.
    ///
    /// Returns once the handshake finished; reading, writing and heartbeats
    /// continue on background tasks.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let _guard = self.connect_lock.lock().await;
        if self.socket.read().await.is_some() {
            trace!("connect(): socket already open");
            return Ok(());
        }
        self.is_manually_closed.store(false, Ordering::SeqCst);

        let ws_url = self.websocket_url().await?;
        info!("Attempting to connect to WebSocket at {}", self.url);
        self.set_connection_state(ConnectionState::Connecting).await;

        let handshake = timeout(
            Duration::from_millis(self.options.connect_timeout),
            connect_async(ws_url.as_str()),
        )
        .await;
        let ws_stream = match handshake {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("WebSocket connection failed: {}", e);
                self.set_connection_state(ConnectionState::Disconnected).await;
                return Err(RealtimeError::ConnectionError(format!(
                    "WebSocket connection failed: {}",
                    e
                )));
            }
            Err(_) => {
                error!("WebSocket handshake timed out");
                self.set_connection_state(ConnectionState::Disconnected).await;
                return Err(RealtimeError::ConnectionError(
                    "Timeout waiting for connection".to_string(),
                ));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(100);
        *self.socket.write().await = Some(socket_tx.clone());
        self.set_connection_state(ConnectionState::Connected).await;

        // --- WebSocket Writer Task ---
        tokio::spawn(async move {
            debug!("Writer task started");
            while let Some(message) = socket_rx.recv().await {
                trace!("Writer task sending message: {:?}", message);
                let closing = message.is_close();
                if let Err(e) = write.send(message).await {
                    error!("Writer task: WebSocket send error: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Writer task finished");
        });

        // --- WebSocket Reader Task (and heartbeat) ---
        let reader = self.clone();
        let heartbeat_tx = socket_tx;
        tokio::spawn(async move {
            debug!("Reader task started");
            let mut heartbeat = interval(Duration::from_millis(reader.options.heartbeat_interval));
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    biased;

                    msg_result = read.next() => {
                        match msg_result {
                            Some(Ok(Message::Text(text))) => reader.route(&text).await,
                            Some(Ok(msg)) if msg.is_close() => {
                                debug!("Reader task received Close frame");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("Reader task: WebSocket read error: {}", e);
                                break;
                            }
                            None => {
                                debug!("Reader task: WebSocket stream closed by remote");
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        if reader.is_manually_closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let message = RealtimeMessage::new(
                            "phoenix",
                            ChannelEvent::Heartbeat,
                            json!({}),
                            reader.next_ref(),
                        );
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("Failed to encode heartbeat: {}", e);
                                continue;
                            }
                        };
                        if heartbeat_tx.send(Message::Text(text)).await.is_err() {
                            warn!("Reader task: heartbeat not queued, assuming connection lost");
                            break;
                        }
                    }
                }
            }

            debug!("Reader task finished");
            // A later connect() may already own the slot.
            let mut socket = reader.socket.write().await;
            if socket.as_ref().is_some_and(|tx| tx.same_channel(&heartbeat_tx)) {
                *socket = None;
                drop(socket);
                reader.channels.write().await.clear();
                reader.set_connection_state(ConnectionState::Disconnected).await;
            }
        });

        Ok(())
    }

    /// 切断処理
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        info!("disconnect() called");
        self.is_manually_closed.store(true, Ordering::SeqCst);

        if let Some(socket_tx) = self.socket.write().await.take() {
            // The writer forwards the close frame and exits; the server's
            // close reply ends the reader.
            if socket_tx.send(Message::Close(None)).await.is_err() {
                debug!("disconnect(): writer already gone");
            }
        } else {
            debug!("disconnect(): no active socket");
        }
        self.channels.write().await.clear();
        self.set_connection_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    /// Send a protocol message through the WebSocket connection.
    pub(crate) async fn send_message(
        &self,
        message: &RealtimeMessage,
    ) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(message)?;
        trace!("Client sending message: {}", text);
        let socket_tx = self.socket.read().await.clone();
        match socket_tx {
            Some(socket_tx) => socket_tx
                .send(Message::Text(text))
                .await
                .map_err(RealtimeError::from),
            None => Err(RealtimeError::ConnectionError(
                "Client socket unavailable".to_string(),
            )),
        }
    }

    /// Drop one callback; leave the channel once no callbacks remain.
    pub(crate) async fn remove_subscription(
        &self,
        topic: &str,
        id: &str,
    ) -> Result<(), RealtimeError> {
        let channel = self.channels.read().await.get(topic).cloned();
        let Some(channel) = channel else {
            return Ok(());
        };
        if channel.remove(id).await > 0 {
            return Ok(());
        }

        self.channels.write().await.remove(topic);
        debug!("Leaving channel {}", topic);
        let message =
            RealtimeMessage::new(topic, ChannelEvent::PhoenixLeave, json!({}), self.next_ref());
        match self.send_message(&message).await {
            Err(RealtimeError::ConnectionError(_)) => Ok(()),
            other => other,
        }
    }

    async fn route(&self, text: &str) {
        let message = match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to parse incoming message: {}. Raw: {}", e, text);
                return;
            }
        };
        trace!("Received {:?} on {}", message.event, message.topic);

        let channel = self.channels.read().await.get(&message.topic).cloned();
        match channel {
            Some(channel) => channel.dispatch(&message).await,
            None if message.topic == "phoenix" => {}
            None => debug!("Message for unjoined topic {}", message.topic),
        }
    }

    async fn websocket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&format!("{}/realtime/v1/websocket", self.url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            s => {
                return Err(RealtimeError::ConnectionError(format!(
                    "Unsupported URL scheme: {}",
                    s
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            RealtimeError::ConnectionError(format!("Cannot use scheme {} for {}", scheme, self.url))
        })?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    /// 内部接続状態を設定し、変更を通知
    async fn set_connection_state(&self, state: ConnectionState) {
        let mut current_state = self.state.write().await;
        if *current_state != state {
            debug!("Client state changing from {:?} to {:?}", *current_state, state);
            *current_state = state;
            // No receivers is fine.
            let _ = self.state_change.send(state);
        }
    }
}

/// Topics on the wire carry the `realtime:` prefix.
pub(crate) fn full_topic(topic: &str) -> String {
    if topic.starts_with("realtime:") {
        topic.to_string()
    } else {
        format!("realtime:{}", topic)
    }
}
