//! Device-local display preferences.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::models::{FontSize, UiPreferences};

/// Durable key of the persisted record.
pub const UI_STORE_KEY: &str = "ui-store";

/// Record layout under [`UI_STORE_KEY`]: `{"state": {...}, "version": 0}`.
#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    state: UiPreferences,
    #[serde(default)]
    version: u32,
}

#[derive(Clone)]
pub struct UiPreferenceStore {
    kv: Arc<dyn KeyValueStore>,
    state: Arc<watch::Sender<UiPreferences>>,
}

impl UiPreferenceStore {
    /// Load the persisted record. Missing or malformed records give defaults.
    pub async fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let prefs = match kv.get(UI_STORE_KEY).await? {
            Some(raw) => match serde_json::from_str::<Persisted>(&raw) {
                Ok(persisted) => persisted.state,
                Err(e) => {
                    warn!(error = %e, "malformed ui preferences, using defaults");
                    UiPreferences::default()
                }
            },
            None => UiPreferences::default(),
        };
        let (state, _) = watch::channel(prefs);
        Ok(Self {
            kv,
            state: Arc::new(state),
        })
    }

    pub fn snapshot(&self) -> UiPreferences {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<UiPreferences> {
        self.state.subscribe()
    }

    pub async fn toggle_low_stimulation(&self) -> Result<UiPreferences> {
        self.update(|p| p.low_stimulation_mode = !p.low_stimulation_mode).await
    }

    pub async fn set_font_size(&self, size: FontSize) -> Result<UiPreferences> {
        self.update(|p| p.font_size = size).await
    }

    pub async fn toggle_high_contrast(&self) -> Result<UiPreferences> {
        self.update(|p| p.high_contrast = !p.high_contrast).await
    }

    pub async fn toggle_reduced_motion(&self) -> Result<UiPreferences> {
        self.update(|p| p.reduced_motion = !p.reduced_motion).await
    }

    async fn update(&self, f: impl FnOnce(&mut UiPreferences)) -> Result<UiPreferences> {
        self.state.send_modify(f);
        let prefs = self.snapshot();
        let record = serde_json::to_string(&Persisted {
            state: prefs,
            version: 0,
        })?;
        self.kv.set(UI_STORE_KEY, record).await?;
        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_defaults_and_toggles_persist() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = UiPreferenceStore::load(kv.clone()).await.unwrap();
        assert_eq!(store.snapshot(), UiPreferences::default());

        store.toggle_high_contrast().await.unwrap();
        store.set_font_size(FontSize::Large).await.unwrap();
        store.toggle_reduced_motion().await.unwrap();
        store.toggle_reduced_motion().await.unwrap();

        let stored = kv.get(UI_STORE_KEY).await.unwrap().unwrap();
        let raw: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(
            raw,
            json!({
                "state": {
                    "lowStimulationMode": false,
                    "fontSize": "large",
                    "highContrast": true,
                    "reducedMotion": false
                },
                "version": 0
            })
        );

        let reloaded = UiPreferenceStore::load(kv).await.unwrap();
        assert!(reloaded.snapshot().high_contrast);
        assert_eq!(reloaded.snapshot().font_size, FontSize::Large);
    }

    #[tokio::test]
    async fn test_malformed_record_falls_back_to_defaults() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        kv.set(UI_STORE_KEY, "{\"state\": 3}".into()).await.unwrap();

        let store = UiPreferenceStore::load(kv).await.unwrap();
        assert_eq!(store.snapshot(), UiPreferences::default());
    }

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = UiPreferenceStore::load(kv).await.unwrap();
        let rx = store.watch();

        store.toggle_low_stimulation().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().low_stimulation_mode);
    }
}
