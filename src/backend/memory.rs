//! In-process backends used in demo mode and by the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AuthProvider, Filter, PushEvent, PushService, PushSubscription, Query, TableService};
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::models::SessionUser;
use solimesh_auth::{AuthChangeEvent, AuthStateChange, Session, SignUpResponse, User};

/// Durable key holding the demo user record.
pub const DEMO_USER_KEY: &str = "solimesh_user";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tables kept in memory as JSON rows.
#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    /// Make every following operation fail with `message` (or stop failing).
    pub fn fail_with(&self, message: Option<&str>) {
        *lock(&self.failure) = message.map(str::to_string);
    }

    /// Current rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    fn begin(&self, op: &str, table: &str) -> Result<()> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(op, table, "memory table operation");
        match lock(&self.failure).as_ref() {
            Some(message) => Err(Error::backend(message)),
            None => Ok(()),
        }
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

fn field_matches(value: Option<&Value>, expected: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => expected == "null",
        Some(other) => other.to_string() == expected,
    }
}

fn row_matches(row: &Value, filters: &[Filter]) -> bool {
    filters
        .iter()
        .all(|f| field_matches(row.get(&f.column), &f.value))
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        // Nulls sort last ascending, as in Postgres.
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn stamp_new_row(mut row: Map<String, Value>) -> Value {
    let now = now_string();
    row.entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    row.entry("created_at")
        .or_insert_with(|| Value::String(now.clone()));
    row.entry("updated_at").or_insert_with(|| Value::String(now));
    Value::Object(row)
}

#[async_trait]
impl TableService for MemoryTables {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        self.begin("select", table)?;
        let mut rows: Vec<Value> = lock(&self.tables)
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare_fields(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Value) -> Result<Vec<Value>> {
        self.begin("insert", table)?;
        let rows = match rows {
            Value::Array(rows) => rows,
            row => vec![row],
        };

        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Value::Object(map) => inserted.push(stamp_new_row(map)),
                other => {
                    return Err(Error::backend(format!(
                        "cannot insert non-object row {}",
                        other
                    )))
                }
            }
        }
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        self.begin("update", table)?;
        let Value::Object(patch) = patch else {
            return Err(Error::backend("patch must be an object"));
        };

        let mut tables = lock(&self.tables);
        let mut updated = Vec::new();
        for row in tables.get_mut(table).into_iter().flatten() {
            if !row_matches(row, filters) {
                continue;
            }
            if let Value::Object(fields) = row {
                for (key, value) in &patch {
                    fields.insert(key.clone(), value.clone());
                }
                if fields.contains_key("updated_at") && !patch.contains_key("updated_at") {
                    fields.insert("updated_at".into(), Value::String(now_string()));
                }
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>> {
        self.begin("delete", table)?;
        let mut tables = lock(&self.tables);
        let Some(rows) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Value>, Vec<Value>) =
            rows.drain(..).partition(|row| row_matches(row, filters));
        *rows = kept;
        Ok(removed)
    }
}

/// In-process broadcast hub.
#[derive(Debug, Default)]
pub struct MemoryPush {
    subscribers: Mutex<HashMap<(String, String), Vec<mpsc::UnboundedSender<PushEvent>>>>,
}

impl MemoryPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions for `event` on `channel`.
    pub fn subscriber_count(&self, channel: &str, event: &str) -> usize {
        let mut subscribers = lock(&self.subscribers);
        match subscribers.get_mut(&(channel.to_string(), event.to_string())) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl PushService for MemoryPush {
    async fn subscribe(&self, channel: &str, event: &str) -> Result<PushSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry((channel.to_string(), event.to_string()))
            .or_default()
            .push(tx);
        Ok(PushSubscription::new(rx, None))
    }

    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()> {
        let message = PushEvent {
            event: event.to_string(),
            payload,
        };
        let key = (channel.to_string(), event.to_string());
        if let Some(senders) = lock(&self.subscribers).get_mut(&key) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }
}

/// Auth provider that accepts any credentials and keeps the signed-in user
/// under [`DEMO_USER_KEY`]. The same email always maps to the same user id,
/// so demo data survives signing out and back in.
pub struct DemoAuth {
    kv: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<AuthStateChange>,
}

impl DemoAuth {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { kv, events }
    }

    fn demo_user(email: &str) -> SessionUser {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, email.trim().to_lowercase().as_bytes());
        SessionUser {
            id: format!("demo-{}", id.simple()),
            email: Some(email.to_string()),
            created_at: now_string(),
        }
    }

    fn mock_session(user: &SessionUser) -> Session {
        let short = || Uuid::new_v4().simple().to_string()[..9].to_string();
        Session {
            access_token: format!("mock-token-{}", short()),
            refresh_token: format!("mock-refresh-{}", short()),
            expires_in: 3600,
            expires_at: None,
            token_type: "bearer".to_string(),
            user: User {
                id: user.id.clone(),
                email: user.email.clone(),
                phone: None,
                role: Some("authenticated".to_string()),
                app_metadata: Value::Object(Map::new()),
                user_metadata: Value::Object(Map::new()),
                created_at: user.created_at.clone(),
                updated_at: user.created_at.clone(),
            },
        }
    }

    async fn sign_in_as(&self, email: &str) -> Result<Session> {
        let user = Self::demo_user(email);
        self.kv
            .set(DEMO_USER_KEY, serde_json::to_string(&user)?)
            .await?;
        let session = Self::mock_session(&user);
        // No listeners is fine.
        let _ = self.events.send(AuthStateChange {
            event: AuthChangeEvent::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }
}

#[async_trait]
impl AuthProvider for DemoAuth {
    async fn sign_up(&self, email: &str, _password: &str) -> Result<SignUpResponse> {
        let session = self.sign_in_as(email).await?;
        Ok(SignUpResponse {
            user: session.user.clone(),
            session: Some(session),
        })
    }

    async fn sign_in_with_password(&self, email: &str, _password: &str) -> Result<Session> {
        self.sign_in_as(email).await
    }

    async fn sign_out(&self) -> Result<()> {
        self.kv.remove(DEMO_USER_KEY).await?;
        let _ = self.events.send(AuthStateChange {
            event: AuthChangeEvent::SignedOut,
            session: None,
        });
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>> {
        let Some(stored) = self.kv.get(DEMO_USER_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<SessionUser>(&stored) {
            Ok(user) => Ok(Some(Self::mock_session(&user))),
            Err(e) => {
                warn!(error = %e, "discarding malformed stored demo user");
                self.kv.remove(DEMO_USER_KEY).await?;
                Ok(None)
            }
        }
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        self.events.subscribe()
    }
}
