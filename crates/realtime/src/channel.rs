use crate::client::{full_topic, RealtimeClient};
use crate::error::RealtimeError;
use crate::message::{BroadcastPayload, ChannelEvent, RealtimeMessage};
use log::{debug, error, trace, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// ブロードキャストイベント監視設定
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastChanges {
    event: String,
}

impl BroadcastChanges {
    pub fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event
    }
}

/// アクティブなチャンネル購読を表す
///
/// Dropping the subscription removes its callback; the channel is left
/// once its last subscription is gone.
pub struct Subscription {
    id: String,
    topic: String,
    client: RealtimeClient,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unsubscribe now instead of on drop.
    pub async fn unsubscribe(mut self) -> Result<(), RealtimeError> {
        self.active = false;
        self.client.remove_subscription(&self.topic, &self.id).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Subscription {} dropped outside a runtime", self.id);
            return;
        };
        let id = self.id.clone();
        let topic = self.topic.clone();
        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.remove_subscription(&topic, &id).await {
                error!("Error unsubscribing from channel {}: {}", topic, e);
            }
        });
    }
}

type CallbackFn = Box<dyn Fn(BroadcastPayload) + Send + Sync>;

/// 内部チャンネル表現
pub(crate) struct Channel {
    topic: String,
    // id -> (event name, callback)
    callbacks: RwLock<HashMap<String, (String, CallbackFn)>>,
}

impl Channel {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Remove a callback, returning how many remain.
    pub(crate) async fn remove(&self, id: &str) -> usize {
        let mut callbacks = self.callbacks.write().await;
        callbacks.remove(id);
        callbacks.len()
    }

    pub(crate) async fn dispatch(&self, message: &RealtimeMessage) {
        match message.event {
            ChannelEvent::Broadcast => {
                let Some(payload) = message.broadcast_payload() else {
                    warn!("Malformed broadcast on {}: {}", self.topic, message.payload);
                    return;
                };
                let callbacks = self.callbacks.read().await;
                for (event, callback) in callbacks.values() {
                    if *event == payload.event {
                        (callback)(payload.clone());
                    }
                }
            }
            ChannelEvent::PhoenixReply => {
                let status = message.payload.get("status").and_then(|v| v.as_str());
                if status != Some("ok") {
                    warn!("Channel {} reply: {}", self.topic, message.payload);
                }
            }
            ChannelEvent::PhoenixError => {
                error!("Channel {} received phx_error: {}", self.topic, message.payload);
            }
            ChannelEvent::PhoenixClose => {
                debug!("Channel {} received phx_close", self.topic);
            }
            other => {
                trace!("Ignoring {:?} on {}", other, self.topic);
            }
        }
    }
}

/// チャンネル作成と購読設定のためのビルダー
pub struct ChannelBuilder<'a> {
    client: &'a RealtimeClient,
    topic: String,
    broadcast_callbacks: Vec<(BroadcastChanges, CallbackFn)>,
}

impl<'a> ChannelBuilder<'a> {
    pub(crate) fn new(client: &'a RealtimeClient, topic: &str) -> Self {
        Self {
            client,
            topic: full_topic(topic),
            broadcast_callbacks: Vec::new(),
        }
    }

    /// ブロードキャストイベントのコールバックを登録
    pub fn on_broadcast<F>(mut self, changes: BroadcastChanges, callback: F) -> Self
    where
        F: Fn(BroadcastPayload) + Send + Sync + 'static,
    {
        self.broadcast_callbacks.push((changes, Box::new(callback)));
        self
    }

    /// チャンネルへの接続と購読を開始
    ///
    /// Connects the client if needed and joins the topic the first time a
    /// callback is registered for it.
    pub async fn subscribe(self) -> Result<Vec<Subscription>, RealtimeError> {
        if self.broadcast_callbacks.is_empty() {
            return Err(RealtimeError::SubscriptionError(format!(
                "No callbacks registered for {}",
                self.topic
            )));
        }

        self.client.connect().await?;

        let (channel, newly_joined) = {
            let mut channels = self.client.channels.write().await;
            match channels.get(&self.topic) {
                Some(channel) => (channel.clone(), false),
                None => {
                    let channel = Arc::new(Channel::new(&self.topic));
                    channels.insert(self.topic.clone(), channel.clone());
                    (channel, true)
                }
            }
        };

        let mut subscriptions = Vec::with_capacity(self.broadcast_callbacks.len());
        {
            let mut callbacks = channel.callbacks.write().await;
            for (changes, callback) in self.broadcast_callbacks {
                let id = uuid::Uuid::new_v4().to_string();
                callbacks.insert(id.clone(), (changes.event, callback));
                subscriptions.push(Subscription {
                    id,
                    topic: self.topic.clone(),
                    client: self.client.clone(),
                    active: true,
                });
            }
        }

        if newly_joined {
            let mut payload = json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": "" },
                    "postgres_changes": []
                }
            });
            if let Some(token) = self.client.access_token().await {
                payload["access_token"] = json!(token);
            }
            let message = RealtimeMessage::new(
                &self.topic,
                ChannelEvent::PhoenixJoin,
                payload,
                self.client.next_ref(),
            );
            debug!("Joining channel {}", self.topic);
            if let Err(e) = self.client.send_message(&message).await {
                self.client.channels.write().await.remove(&self.topic);
                for mut subscription in subscriptions {
                    subscription.active = false;
                }
                return Err(e);
            }
        }

        Ok(subscriptions)
    }
}
