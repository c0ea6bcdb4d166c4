//! Collaborator seams.
//!
//! The stores only talk to these traits. [`remote`] implements them over
//! the workspace clients; [`memory`] implements them in-process for demo
//! mode and tests.

pub mod memory;
pub mod remote;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use solimesh_auth::{AuthStateChange, Session, SignUpResponse};

pub use memory::{DemoAuth, MemoryPush, MemoryTables};
pub use remote::{RemotePush, RemoteTables};

/// Hosted auth provider.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;
    async fn sign_out(&self) -> Result<()>;
    /// The current session, if any.
    async fn get_session(&self) -> Result<Option<Session>>;
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange>;
}

/// `column = value` row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Select query: equality filters plus one ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }
}

/// Hosted tabular data service. Mutations return the affected rows.
#[async_trait]
pub trait TableService: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>>;
    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>>;
    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>>;
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>>;
}

/// One event delivered on a push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub payload: Value,
}

/// A live push subscription. Dropping it unsubscribes.
pub struct PushSubscription {
    events: mpsc::UnboundedReceiver<PushEvent>,
    _guard: Option<Box<dyn std::any::Any + Send>>,
}

impl PushSubscription {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<PushEvent>,
        guard: Option<Box<dyn std::any::Any + Send>>,
    ) -> Self {
        Self {
            events,
            _guard: guard,
        }
    }

    /// Next event, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSubscription").finish_non_exhaustive()
    }
}

/// Hosted push channel service.
#[async_trait]
pub trait PushService: Send + Sync {
    async fn subscribe(&self, channel: &str, event: &str) -> Result<PushSubscription>;
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()>;
}
