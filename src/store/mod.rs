//! Stores the view layer reads from and mutates through.

mod cache;
mod entity;
pub mod contacts;
pub mod pantry;
pub mod preferences;
pub mod signals;

pub use cache::QueryState;
pub use contacts::{ContactStore, RelationshipHealth};
pub use entity::{Entity, EntityStore, OWNER_COLUMN};
pub use pantry::{ExpiryBadge, PantryStore};
pub use preferences::{UiPreferenceStore, UI_STORE_KEY};
pub use signals::{SignalMount, SignalState, SignalStore};
