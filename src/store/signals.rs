//! Realtime board of active abundance signals.
//!
//! The board is fetched once per mount and then kept current by INSERT and
//! UPDATE broadcasts on the `abundance_signals` channel. Local mutations go
//! through [`SignalState::reduce`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Filter, PushService, PushSubscription, Query, TableService};
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::models::{AbundanceSignal, GeoPoint, SignalDraft, SignalPatch, SignalStatus};

pub const SIGNALS_TABLE: &str = "abundance_signals";
pub const SIGNAL_CHANNEL: &str = "abundance_signals";
pub const SIGNAL_EVENT: &str = "signal_update";

const SIGNAL_LIFETIME_HOURS: i64 = 48;
const STRESS_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Broadcast payload announcing a row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalChange {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub new: Value,
}

impl SignalChange {
    pub fn insert(signal: &AbundanceSignal) -> Result<Self> {
        Ok(Self {
            event_type: "INSERT".to_string(),
            new: serde_json::to_value(signal)?,
        })
    }

    pub fn update(signal: &AbundanceSignal) -> Result<Self> {
        Ok(Self {
            event_type: "UPDATE".to_string(),
            new: serde_json::to_value(signal)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalState {
    pub signals: Vec<AbundanceSignal>,
    pub loading: bool,
    pub error: Option<String>,
    /// Ids appended by pushes since the last fetch started.
    pushed_since_fetch: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalAction {
    FetchStarted,
    FetchSucceeded(Vec<AbundanceSignal>),
    FetchFailed(String),
    /// A new signal, pushed or created here.
    Inserted(AbundanceSignal),
    /// A full row that replaces the local copy.
    Replaced(AbundanceSignal),
    Patched { id: String, patch: SignalPatch },
    ExpiredAt(DateTime<Utc>),
}

impl SignalState {
    pub fn contains(&self, id: &str) -> bool {
        self.signals.iter().any(|s| s.id == id)
    }

    pub fn reduce(mut self, action: SignalAction) -> Self {
        match action {
            SignalAction::FetchStarted => {
                self.loading = true;
                self.pushed_since_fetch.clear();
            }
            SignalAction::FetchSucceeded(fetched) => {
                let mut seen = HashSet::new();
                let mut signals: Vec<AbundanceSignal> = fetched
                    .into_iter()
                    .filter(|s| seen.insert(s.id.clone()))
                    .collect();
                // Pushes that landed while the fetch was in flight stay.
                let pushed = std::mem::take(&mut self.pushed_since_fetch);
                signals.extend(
                    self.signals
                        .into_iter()
                        .filter(|s| pushed.contains(&s.id) && seen.insert(s.id.clone())),
                );
                self.signals = signals;
                self.loading = false;
                self.error = None;
            }
            SignalAction::FetchFailed(message) => {
                self.loading = false;
                self.error = Some(message);
            }
            SignalAction::Inserted(signal) => {
                if signal.signal_status == SignalStatus::Active && !self.contains(&signal.id) {
                    self.pushed_since_fetch.push(signal.id.clone());
                    self.signals.push(signal);
                }
            }
            SignalAction::Replaced(signal) => {
                if let Some(existing) = self.signals.iter_mut().find(|s| s.id == signal.id) {
                    *existing = signal;
                }
            }
            SignalAction::Patched { id, patch } => {
                if let Some(existing) = self.signals.iter_mut().find(|s| s.id == id) {
                    existing.apply(&patch);
                }
            }
            SignalAction::ExpiredAt(now) => {
                for signal in &mut self.signals {
                    if signal.expires_at < now {
                        signal.signal_status = SignalStatus::Expired;
                    }
                }
            }
        }
        // The board only shows active signals.
        self.signals.retain(|s| s.signal_status == SignalStatus::Active);
        self
    }
}

/// Signal board backed by a table and a push channel.
#[derive(Clone)]
pub struct SignalStore {
    tables: Arc<dyn TableService>,
    push: Arc<dyn PushService>,
    state: Arc<watch::Sender<SignalState>>,
}

impl SignalStore {
    pub fn new(tables: Arc<dyn TableService>, push: Arc<dyn PushService>) -> Self {
        let (state, _) = watch::channel(SignalState::default());
        Self {
            tables,
            push,
            state: Arc::new(state),
        }
    }

    pub fn watch(&self) -> watch::Receiver<SignalState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SignalState {
        self.state.borrow().clone()
    }

    fn apply(&self, action: SignalAction) {
        apply_unless_closed(&self.state, None, action);
    }

    /// Subscribe to signal broadcasts, then load the active board. Pushes
    /// that arrive during the load are kept.
    pub async fn mount(&self) -> SignalMount {
        let lifecycle = Lifecycle::new();

        let listener = match self.push.subscribe(SIGNAL_CHANNEL, SIGNAL_EVENT).await {
            Ok(subscription) => Some(tokio::spawn(listen(
                subscription,
                self.state.clone(),
                lifecycle.clone(),
            ))),
            Err(e) => {
                warn!(error = %e, "signal subscription failed, board will not update live");
                None
            }
        };

        // Failures are recorded in the state.
        let _ = self.fetch_active(Some(&lifecycle)).await;

        SignalMount { lifecycle, listener }
    }

    /// Reload the active board.
    pub async fn refresh(&self) -> Result<Vec<AbundanceSignal>> {
        self.fetch_active(None).await
    }

    async fn fetch_active(&self, lifecycle: Option<&Lifecycle>) -> Result<Vec<AbundanceSignal>> {
        apply_unless_closed(&self.state, lifecycle, SignalAction::FetchStarted);
        let query = Query::new()
            .eq("signal_status", SignalStatus::Active.as_str())
            .order("created_at", false);

        let result = match self.tables.select(SIGNALS_TABLE, &query).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| serde_json::from_value(row).map_err(Error::from))
                .collect::<Result<Vec<AbundanceSignal>>>(),
            Err(e) => Err(e),
        };

        match result {
            Ok(signals) => {
                debug!(count = signals.len(), "fetched active signals");
                let action = SignalAction::FetchSucceeded(signals.clone());
                apply_unless_closed(&self.state, lifecycle, action);
                Ok(signals)
            }
            Err(e) => {
                warn!(error = %e, "fetching signals failed");
                let action = SignalAction::FetchFailed(e.to_string());
                apply_unless_closed(&self.state, lifecycle, action);
                Err(e)
            }
        }
    }

    /// Merge `patch` into the local copy only. Other clients do not see the
    /// change until their next fetch.
    pub fn update(&self, id: &str, patch: SignalPatch) {
        self.apply(SignalAction::Patched {
            id: id.to_string(),
            patch,
        });
    }

    /// Post a new active signal that expires 48 hours after `now`.
    pub async fn broadcast(
        &self,
        owner: &str,
        item: &str,
        stress_level: u8,
        now: DateTime<Utc>,
    ) -> Result<AbundanceSignal> {
        let item = item.trim();
        if item.is_empty() {
            return Err(Error::validation("Item to share is required"));
        }
        if !STRESS_RANGE.contains(&stress_level) {
            return Err(Error::validation("Stress level must be between 1 and 10"));
        }

        let draft = SignalDraft {
            user_id: owner.to_string(),
            item_id: item.to_string(),
            location: GeoPoint::default(),
            stress_level,
            signal_status: SignalStatus::Active,
            expires_at: now + Duration::hours(SIGNAL_LIFETIME_HOURS),
        };
        let rows = self
            .tables
            .insert(SIGNALS_TABLE, Value::Array(vec![serde_json::to_value(&draft)?]))
            .await
            .map_err(|e| {
                error!(error = %e, "creating signal failed");
                e
            })?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::decode("signal insert returned no row"))?;
        let signal: AbundanceSignal = serde_json::from_value(row)?;
        info!(id = %signal.id, item = %signal.item_id, "signal broadcast");

        self.apply(SignalAction::Inserted(signal.clone()));
        self.announce(SignalChange::insert(&signal)?).await;
        Ok(signal)
    }

    /// Claim an active signal for `claimant`. Fails if someone else got
    /// there first or the signal is gone.
    pub async fn claim(&self, id: &str, claimant: &str) -> Result<AbundanceSignal> {
        let patch = SignalPatch {
            signal_status: Some(SignalStatus::Claimed),
            claimed_by_user_id: Some(claimant.to_string()),
            ..Default::default()
        };
        let filters = [
            Filter::eq("id", id),
            Filter::eq("signal_status", SignalStatus::Active.as_str()),
        ];
        let rows = self
            .tables
            .update(SIGNALS_TABLE, &filters, serde_json::to_value(&patch)?)
            .await?;

        let Some(row) = rows.into_iter().next() else {
            // Whatever we showed is stale; drop it locally.
            self.apply(SignalAction::Patched {
                id: id.to_string(),
                patch: SignalPatch {
                    signal_status: Some(SignalStatus::Claimed),
                    ..Default::default()
                },
            });
            return Err(Error::validation("Signal is no longer available"));
        };
        let signal: AbundanceSignal = serde_json::from_value(row)?;
        info!(id = %signal.id, claimant, "signal claimed");

        self.apply(SignalAction::Replaced(signal.clone()));
        self.announce(SignalChange::update(&signal)?).await;
        Ok(signal)
    }

    /// Drop signals whose expiry is before `now`. Returns how many went.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        self.state.send_if_modified(|state| {
            let before = state.signals.len();
            *state = std::mem::take(state).reduce(SignalAction::ExpiredAt(now));
            expired = before - state.signals.len();
            expired > 0
        });
        if expired > 0 {
            debug!(expired, "expired stale signals");
        }
        expired
    }

    async fn announce(&self, change: SignalChange) {
        let payload = match serde_json::to_value(&change) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "could not encode signal change");
                return;
            }
        };
        // The row is stored already; peers catch up on their next fetch.
        if let Err(e) = self.push.publish(SIGNAL_CHANNEL, SIGNAL_EVENT, payload).await {
            warn!(error = %e, event = %change.event_type, "signal announcement failed");
        }
    }
}

fn apply_unless_closed(
    state: &watch::Sender<SignalState>,
    lifecycle: Option<&Lifecycle>,
    action: SignalAction,
) {
    state.send_if_modified(|current| {
        if lifecycle.is_some_and(Lifecycle::is_closed) {
            return false;
        }
        let next = current.clone().reduce(action);
        let changed = next != *current;
        *current = next;
        changed
    });
}

fn decode_change(payload: Value) -> Option<SignalAction> {
    let change: SignalChange = match serde_json::from_value(payload) {
        Ok(change) => change,
        Err(e) => {
            warn!(error = %e, "ignoring malformed signal broadcast");
            return None;
        }
    };
    let signal: AbundanceSignal = match serde_json::from_value(change.new) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, event = %change.event_type, "ignoring broadcast with malformed row");
            return None;
        }
    };
    match change.event_type.as_str() {
        "INSERT" => Some(SignalAction::Inserted(signal)),
        "UPDATE" => Some(SignalAction::Replaced(signal)),
        other => {
            debug!(event = other, "ignoring signal broadcast");
            None
        }
    }
}

async fn listen(
    mut subscription: PushSubscription,
    state: Arc<watch::Sender<SignalState>>,
    lifecycle: Lifecycle,
) {
    loop {
        let event = tokio::select! {
            _ = lifecycle.closed() => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else {
            debug!("signal subscription closed");
            break;
        };
        if let Some(action) = decode_change(event.payload) {
            apply_unless_closed(&state, Some(&lifecycle), action);
        }
    }
}

/// A mounted signal board. Unmount (or drop) to stop listening.
pub struct SignalMount {
    lifecycle: Lifecycle,
    listener: Option<JoinHandle<()>>,
}

impl SignalMount {
    pub fn unmount(self) {
        drop(self);
    }

    pub fn is_mounted(&self) -> bool {
        !self.lifecycle.is_closed()
    }

    /// Whether pushes are being followed.
    pub fn is_live(&self) -> bool {
        self.listener.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SignalMount {
    fn drop(&mut self) {
        self.lifecycle.close();
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}
