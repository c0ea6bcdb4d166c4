//! Backends over the hosted services.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{AuthProvider, Filter, PushEvent, PushService, PushSubscription, Query, TableService};
use crate::error::Result;
use solimesh_auth::{Auth, AuthStateChange, Session, SignUpResponse};
use solimesh_postgrest::{PostgrestClient, SortOrder};
use solimesh_realtime::{BroadcastChanges, RealtimeClient};

#[async_trait]
impl AuthProvider for Auth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse> {
        Ok(Auth::sign_up(self, email, password).await?)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        Ok(Auth::sign_in_with_password(self, email, password).await?)
    }

    async fn sign_out(&self) -> Result<()> {
        Ok(Auth::sign_out(self).await?)
    }

    async fn get_session(&self) -> Result<Option<Session>> {
        Ok(self.probe_session().await?)
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        Auth::on_auth_state_change(self)
    }
}

/// Tables behind the hosted PostgREST endpoint. Requests carry the signed-in
/// user's token when there is one, so row level security applies.
#[derive(Clone)]
pub struct RemoteTables {
    url: String,
    key: String,
    http_client: Client,
    auth: Option<Arc<Auth>>,
}

impl RemoteTables {
    pub fn new(url: &str, key: &str, http_client: Client, auth: Option<Arc<Auth>>) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            http_client,
            auth,
        }
    }

    fn from(&self, table: &str) -> Result<PostgrestClient> {
        let client = PostgrestClient::new(&self.url, &self.key, table, self.http_client.clone())?;
        match self.auth.as_ref().and_then(|auth| auth.get_session()) {
            Some(session) => Ok(client.with_auth(&session.access_token)?),
            None => Ok(client),
        }
    }

    fn filtered(&self, table: &str, filters: &[Filter]) -> Result<PostgrestClient> {
        Ok(filters
            .iter()
            .fold(self.from(table)?, |client, f| client.eq(&f.column, &f.value)))
    }
}

#[async_trait]
impl TableService for RemoteTables {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let mut client = self.filtered(table, &query.filters)?.select("*");
        if let Some(order) = &query.order {
            let direction = if order.ascending {
                SortOrder::Ascending
            } else {
                SortOrder::Descending
            };
            client = client.order(&order.column, direction);
        }
        Ok(client.execute::<Value>().await?)
    }

    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>> {
        Ok(self.from(table)?.insert(rows).await?)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        Ok(self.filtered(table, filters)?.update(patch).await?)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>> {
        Ok(self.filtered(table, filters)?.delete().await?)
    }
}

/// Broadcast channels on the hosted realtime service.
#[derive(Clone)]
pub struct RemotePush {
    client: RealtimeClient,
}

impl RemotePush {
    pub fn new(client: RealtimeClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }
}

#[async_trait]
impl PushService for RemotePush {
    async fn subscribe(&self, channel: &str, event: &str) -> Result<PushSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = self
            .client
            .channel(channel)
            .on_broadcast(BroadcastChanges::new(event), move |payload| {
                // The receiver is gone once the subscription is dropped.
                let _ = tx.send(PushEvent {
                    event: payload.event,
                    payload: payload.payload,
                });
            })
            .subscribe()
            .await?;
        debug!(channel, event, "push subscription open");
        Ok(PushSubscription::new(rx, Some(Box::new(subscriptions))))
    }

    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()> {
        Ok(self.client.broadcast(channel, event, payload).await?)
    }
}
