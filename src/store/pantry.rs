//! Pantry inventory.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use super::cache::QueryState;
use super::entity::{Entity, EntityStore};
use crate::backend::TableService;
use crate::error::{Error, Result};
use crate::models::{PantryDraft, PantryItem, PantryPatch};

pub const PANTRY_TABLE: &str = "pantry_items";

const EXTRACTED_SHELF_DAYS: i64 = 7;
const EXTRACTED_UNIT: &str = "unit";
const EXTRACTED_LOCATION: &str = "Pantry";
const EXTRACTED_TIP: &str = "Store in cool, dry place";

impl Entity for PantryItem {
    type Draft = PantryDraft;
    type Patch = PantryPatch;

    const TABLE: &'static str = PANTRY_TABLE;
    const ORDER_BY: &'static str = "expiry_date";
    const ASCENDING: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn draft_owner(draft: &PantryDraft) -> &str {
        &draft.user_id
    }
}

/// How close an item is to its expiry date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryBadge {
    Expired,
    Urgent,
    Soon,
    Fresh,
}

impl ExpiryBadge {
    pub fn from_days(days: i64) -> Self {
        match days {
            d if d < 0 => ExpiryBadge::Expired,
            d if d < 3 => ExpiryBadge::Urgent,
            d if d < 7 => ExpiryBadge::Soon,
            _ => ExpiryBadge::Fresh,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExpiryBadge::Expired => "expired",
            ExpiryBadge::Urgent => "urgent",
            ExpiryBadge::Soon => "soon",
            ExpiryBadge::Fresh => "fresh",
        }
    }
}

/// Whole days until `expiry`, rounded up. Negative once it has passed.
pub fn days_until_expiry(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (expiry - now).num_milliseconds();
    (millis as f64 / Duration::days(1).num_milliseconds() as f64).ceil() as i64
}

impl PantryItem {
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        days_until_expiry(self.expiry_date, now)
    }

    pub fn expiry_badge(&self, now: DateTime<Utc>) -> ExpiryBadge {
        ExpiryBadge::from_days(self.days_until_expiry(now))
    }
}

#[derive(Clone)]
pub struct PantryStore {
    inner: EntityStore<PantryItem>,
}

impl PantryStore {
    pub fn new(tables: Arc<dyn TableService>) -> Self {
        Self {
            inner: EntityStore::new(tables),
        }
    }

    /// Items owned by `owner`, soonest expiry first.
    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<PantryItem>> {
        self.inner.list(owner).await
    }

    pub fn watch(&self, owner: &str) -> watch::Receiver<QueryState<PantryItem>> {
        self.inner.watch(owner)
    }

    pub async fn add(&self, draft: &PantryDraft) -> Result<PantryItem> {
        if draft.item_name.trim().is_empty() {
            return Err(Error::validation("Item name is required"));
        }
        self.inner.create(draft).await
    }

    /// Confirm an item read off a scanned image, with scanner defaults.
    pub async fn add_extracted(
        &self,
        owner: &str,
        name: &str,
        image_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PantryItem> {
        self.add(&extracted_draft(owner, name, image_ref, now)).await
    }

    pub async fn update(&self, id: &str, patch: &PantryPatch) -> Result<Vec<PantryItem>> {
        self.inner.update(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }
}

pub(crate) fn extracted_draft(
    owner: &str,
    name: &str,
    image_ref: Option<&str>,
    now: DateTime<Utc>,
) -> PantryDraft {
    PantryDraft {
        user_id: owner.to_string(),
        item_name: name.to_string(),
        quantity: 1.0,
        unit: EXTRACTED_UNIT.to_string(),
        expiry_date: now + Duration::days(EXTRACTED_SHELF_DAYS),
        storage_location: Some(EXTRACTED_LOCATION.to_string()),
        storage_tips: Some(EXTRACTED_TIP.to_string()),
        image_url: image_ref.map(str::to_string),
    }
}
