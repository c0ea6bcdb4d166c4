//! Support contacts and how recently each was reached.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use super::cache::QueryState;
use super::entity::{Entity, EntityStore};
use crate::backend::TableService;
use crate::error::{Error, Result};
use crate::models::{ContactDraft, ContactPatch, SupportContact};

pub const CONTACTS_TABLE: &str = "support_contacts";

impl Entity for SupportContact {
    type Draft = ContactDraft;
    type Patch = ContactPatch;

    const TABLE: &'static str = CONTACTS_TABLE;
    const ORDER_BY: &'static str = "last_contact_date";
    const ASCENDING: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn draft_owner(draft: &ContactDraft) -> &str {
        &draft.user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipHealth {
    Good,
    Fair,
    Poor,
}

impl RelationshipHealth {
    pub fn from_days(days: i64) -> Self {
        match days {
            d if d <= 3 => RelationshipHealth::Good,
            d if d <= 7 => RelationshipHealth::Fair,
            _ => RelationshipHealth::Poor,
        }
    }
}

/// Whole days since `last_contact`, rounded down.
pub fn days_since_contact(last_contact: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (now - last_contact).num_milliseconds();
    (millis as f64 / Duration::days(1).num_milliseconds() as f64).floor() as i64
}

impl SupportContact {
    pub fn days_since_contact(&self, now: DateTime<Utc>) -> i64 {
        days_since_contact(self.last_contact_date, now)
    }

    pub fn health(&self, now: DateTime<Utc>) -> RelationshipHealth {
        RelationshipHealth::from_days(self.days_since_contact(now))
    }
}

#[derive(Clone)]
pub struct ContactStore {
    inner: EntityStore<SupportContact>,
}

impl ContactStore {
    pub fn new(tables: Arc<dyn TableService>) -> Self {
        Self {
            inner: EntityStore::new(tables),
        }
    }

    /// Contacts owned by `owner`, most recently reached first.
    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<SupportContact>> {
        self.inner.list(owner).await
    }

    pub fn watch(&self, owner: &str) -> watch::Receiver<QueryState<SupportContact>> {
        self.inner.watch(owner)
    }

    pub async fn add(&self, draft: &ContactDraft) -> Result<SupportContact> {
        if draft.contact_name.trim().is_empty() {
            return Err(Error::validation("Contact name is required"));
        }
        self.inner.create(draft).await
    }

    pub async fn update(&self, id: &str, patch: &ContactPatch) -> Result<Vec<SupportContact>> {
        self.inner.update(id, patch).await
    }

    /// Record that the contact was reached at `now`.
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Vec<SupportContact>> {
        let patch = ContactPatch {
            last_contact_date: Some(now),
            ..Default::default()
        };
        self.inner.update(id, &patch).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }
}
