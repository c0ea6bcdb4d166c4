use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents a full message received or sent over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: ChannelEvent,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub message_ref: Value,
}

/// チャンネルイベント (Phoenix protocol events plus broadcast)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEvent {
    #[serde(rename = "phx_join")]
    PhoenixJoin,
    #[serde(rename = "phx_leave")]
    PhoenixLeave,
    #[serde(rename = "phx_reply")]
    PhoenixReply,
    #[serde(rename = "phx_error")]
    PhoenixError,
    #[serde(rename = "phx_close")]
    PhoenixClose,
    AccessToken,

    Heartbeat,
    Broadcast,

    /// Anything else the server sends (presence, system, postgres_changes).
    #[serde(other)]
    Other,
}

/// ブロードキャストペイロード
///
/// The inner `payload` is whatever the publisher sent; the realtime service
/// does not interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl RealtimeMessage {
    pub(crate) fn new(
        topic: &str,
        event: ChannelEvent,
        payload: Value,
        message_ref: String,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            event,
            payload,
            message_ref: Value::String(message_ref),
        }
    }

    /// Extract the broadcast envelope if this is a broadcast message.
    pub fn broadcast_payload(&self) -> Option<BroadcastPayload> {
        if self.event != ChannelEvent::Broadcast {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_event_parses_as_other() {
        let msg: RealtimeMessage = serde_json::from_value(json!({
            "topic": "realtime:x",
            "event": "presence_diff",
            "payload": {},
            "ref": null
        }))
        .unwrap();
        assert_eq!(msg.event, ChannelEvent::Other);
        assert!(msg.broadcast_payload().is_none());
    }

    #[test]
    fn test_broadcast_payload() {
        let msg: RealtimeMessage = serde_json::from_value(json!({
            "topic": "realtime:abundance_signals",
            "event": "broadcast",
            "payload": {
                "type": "broadcast",
                "event": "signal_update",
                "payload": { "eventType": "INSERT" }
            },
            "ref": null
        }))
        .unwrap();

        let payload = msg.broadcast_payload().unwrap();
        assert_eq!(payload.event, "signal_update");
        assert_eq!(payload.payload["eventType"], "INSERT");
    }

    #[test]
    fn test_outgoing_join_shape() {
        let msg =
            RealtimeMessage::new("realtime:t", ChannelEvent::PhoenixJoin, json!({}), "3".into());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "3");
    }
}
