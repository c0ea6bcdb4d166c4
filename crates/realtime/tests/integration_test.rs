use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use solimesh_realtime::{BroadcastChanges, ConnectionState, RealtimeClient, RealtimeClientOptions};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock realtime server: replies `ok` to joins, forwards every client frame
/// to `seen`, and pushes whatever arrives on `push` to the client.
async fn start_mock_server() -> (
    String,
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedSender<Value>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        loop {
            tokio::select! {
                incoming = ws.next() => {
                    let Some(Ok(msg)) = incoming else { break };
                    if msg.is_close() {
                        let _ = ws.close(None).await;
                        break;
                    }
                    let Ok(text) = msg.to_text() else { continue };
                    let value: Value = serde_json::from_str(text).unwrap();
                    if value["event"] == "phx_join" {
                        let reply = json!({
                            "topic": value["topic"],
                            "event": "phx_reply",
                            "payload": { "status": "ok", "response": {} },
                            "ref": value["ref"]
                        });
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                    let _ = seen_tx.send(value);
                }
                outgoing = push_rx.recv() => {
                    let Some(value) = outgoing else { break };
                    ws.send(Message::Text(value.to_string())).await.unwrap();
                }
            }
        }
    });

    (format!("http://{}", addr), seen_rx, push_tx)
}

async fn next_event(seen: &mut mpsc::UnboundedReceiver<Value>, event: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let value = seen.recv().await.expect("server closed");
            if value["event"] == event {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_subscribe_receives_matching_broadcasts() {
    let (url, mut seen, push) = start_mock_server().await;
    let client = RealtimeClient::new(&url, "anon");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriptions = client
        .channel("abundance_signals")
        .on_broadcast(BroadcastChanges::new("signal_update"), move |payload| {
            let _ = tx.send(payload);
        })
        .subscribe()
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(client.get_connection_state().await, ConnectionState::Connected);

    let join = next_event(&mut seen, "phx_join").await;
    assert_eq!(join["topic"], "realtime:abundance_signals");
    assert_eq!(join["payload"]["config"]["broadcast"]["self"], false);

    // Other event names on the same topic are not delivered.
    for (event, id) in [("something_else", "x"), ("signal_update", "s1")] {
        push.send(json!({
            "topic": "realtime:abundance_signals",
            "event": "broadcast",
            "payload": {
                "type": "broadcast",
                "event": event,
                "payload": { "eventType": "INSERT", "new": { "id": id } }
            },
            "ref": null
        }))
        .unwrap();
    }

    let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.event, "signal_update");
    assert_eq!(received.payload["new"]["id"], "s1");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_last_subscription_leaves_channel() {
    let (url, mut seen, _push) = start_mock_server().await;
    let client = RealtimeClient::new(&url, "anon");

    let subscriptions = client
        .channel("abundance_signals")
        .on_broadcast(BroadcastChanges::new("signal_update"), |_| {})
        .subscribe()
        .await
        .unwrap();
    next_event(&mut seen, "phx_join").await;

    drop(subscriptions);

    let leave = next_event(&mut seen, "phx_leave").await;
    assert_eq!(leave["topic"], "realtime:abundance_signals");
}

#[tokio::test]
async fn test_publish_and_heartbeat() {
    let (url, mut seen, _push) = start_mock_server().await;
    let options = RealtimeClientOptions {
        heartbeat_interval: 50,
        ..Default::default()
    };
    let client = RealtimeClient::new_with_options(&url, "anon", options);

    let _subscriptions = client
        .channel("abundance_signals")
        .on_broadcast(BroadcastChanges::new("signal_update"), |_| {})
        .subscribe()
        .await
        .unwrap();
    next_event(&mut seen, "phx_join").await;

    client
        .broadcast("abundance_signals", "signal_update", json!({ "eventType": "INSERT" }))
        .await
        .unwrap();
    let published = next_event(&mut seen, "broadcast").await;
    assert_eq!(published["payload"]["event"], "signal_update");
    assert_eq!(published["payload"]["payload"]["eventType"], "INSERT");

    let heartbeat = next_event(&mut seen, "heartbeat").await;
    assert_eq!(heartbeat["topic"], "phoenix");
}

#[tokio::test]
async fn test_disconnect_changes_state() {
    let (url, _seen, _push) = start_mock_server().await;
    let client = RealtimeClient::new(&url, "anon");
    client.connect().await.unwrap();

    let mut states = client.on_state_change();
    client.disconnect().await.unwrap();

    assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
    assert_eq!(client.get_connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RealtimeClient::new(&format!("http://{}", addr), "anon");
    assert!(client.connect().await.is_err());
    assert_eq!(client.get_connection_state().await, ConnectionState::Disconnected);
}
