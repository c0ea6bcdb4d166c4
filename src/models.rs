//! Wire types for the hosted tables and local state.
//!
//! Field names follow the table columns. Every row type has a draft (the
//! insert shape) and a patch (only the fields that are set get sent).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The slice of an auth session the rest of the layer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl From<&solimesh_auth::User> for SessionUser {
    fn from(user: &solimesh_auth::User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            created_at: user.created_at.clone(),
        }
    }
}

impl From<&solimesh_auth::Session> for SessionUser {
    fn from(session: &solimesh_auth::Session) -> Self {
        Self::from(&session.user)
    }
}

// --- pantry_items ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PantryItem {
    pub id: String,
    pub user_id: String,
    pub item_name: String,
    pub quantity: f64,
    pub unit: String,
    pub expiry_date: DateTime<Utc>,
    #[serde(default)]
    pub storage_location: Option<String>,
    #[serde(default)]
    pub storage_tips: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PantryDraft {
    pub user_id: String,
    pub item_name: String,
    pub quantity: f64,
    pub unit: String,
    pub expiry_date: DateTime<Utc>,
    pub storage_location: Option<String>,
    pub storage_tips: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PantryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_tips: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

// --- support_contacts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Friend,
    Family,
    Neighbor,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportContact {
    pub id: String,
    pub user_id: String,
    pub contact_name: String,
    pub contact_type: ContactType,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub last_contact_date: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactDraft {
    pub user_id: String,
    pub contact_name: String,
    pub contact_type: ContactType,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub last_contact_date: DateTime<Utc>,
    pub notes: Option<String>,
}

impl ContactDraft {
    /// A contact last reached `now`, with no phone, email or notes.
    pub fn new(owner: &str, name: &str, contact_type: ContactType, now: DateTime<Utc>) -> Self {
        Self {
            user_id: owner.to_string(),
            contact_name: name.to_string(),
            contact_type,
            phone: None,
            email: None,
            last_contact_date: now,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_type: Option<ContactType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_contact_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// --- abundance_signals ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Claimed,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Active => "active",
            SignalStatus::Claimed => "claimed",
            SignalStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbundanceSignal {
    pub id: String,
    pub user_id: String,
    pub item_id: String,
    #[serde(default)]
    pub location: GeoPoint,
    pub stress_level: u8,
    pub signal_status: SignalStatus,
    #[serde(default)]
    pub claimed_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AbundanceSignal {
    /// Fold the set fields of `patch` into this signal.
    pub fn apply(&mut self, patch: &SignalPatch) {
        if let Some(status) = patch.signal_status {
            self.signal_status = status;
        }
        if let Some(claimant) = &patch.claimed_by_user_id {
            self.claimed_by_user_id = Some(claimant.clone());
        }
        if let Some(level) = patch.stress_level {
            self.stress_level = level;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalDraft {
    pub user_id: String,
    pub item_id: String,
    pub location: GeoPoint,
    pub stress_level: u8,
    pub signal_status: SignalStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_status: Option<SignalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// --- preferences ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Display preferences kept on this device only. Persisted with camelCase
/// keys, the layout earlier web builds wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiPreferences {
    pub low_stimulation_mode: bool,
    pub font_size: FontSize,
    pub high_contrast: bool,
    pub reduced_motion: bool,
}

/// Row shape of the `user_preferences` table. Not read or written by this
/// crate; preferences stay local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub id: String,
    pub user_id: String,
    pub low_stimulation_mode: bool,
    pub font_size: FontSize,
    pub high_contrast: bool,
    pub reduced_motion: bool,
    pub updated_at: DateTime<Utc>,
}
