//! Solimesh client data and sync layer
//!
//! One [`Solimesh`] handle owns every store the view layer talks to: the
//! session bridge, the pantry and contact stores, the realtime signal board,
//! device-local UI preferences and the image extraction client.
//!
//! With a backend URL and key configured the stores run against the hosted
//! auth, PostgREST and realtime services. With neither, they run against
//! in-memory stand-ins (demo mode).

pub mod backend;
pub mod config;
pub mod error;
pub mod extraction;
pub mod kv;
pub mod lifecycle;
pub mod models;
pub mod session;
pub mod store;

use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    AuthProvider, DemoAuth, MemoryPush, MemoryTables, PushService, RemotePush, RemoteTables,
    TableService,
};
use crate::config::{ConfigState, SolimeshConfig, ENV_GEMINI_API_KEY};
use crate::error::{Error, Result};
use crate::extraction::ExtractionClient;
use crate::kv::{FileStore, KeyValueStore, MemoryStore};
use crate::session::SessionBridge;
use crate::store::{ContactStore, PantryStore, SignalStore, UiPreferenceStore};
use solimesh_auth::{Auth, AuthOptions};
use solimesh_realtime::RealtimeClient;
use solimesh_vision::VisionClient;

/// Which backends the stores run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Hosted,
    Demo,
}

/// The main entry point for the Solimesh client layer
pub struct Solimesh {
    mode: BackendMode,
    session: SessionBridge,
    pantry: PantryStore,
    contacts: ContactStore,
    signals: SignalStore,
    preferences: UiPreferenceStore,
    extraction: Option<ExtractionClient>,
    token_forwarder: Option<JoinHandle<()>>,
}

/// The collaborators a [`Solimesh`] is built from.
pub struct Parts {
    pub auth: Arc<dyn AuthProvider>,
    pub tables: Arc<dyn TableService>,
    pub push: Arc<dyn PushService>,
    pub kv: Arc<dyn KeyValueStore>,
    pub extraction: Option<ExtractionClient>,
}

impl Solimesh {
    /// Build every store from `config`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use solimesh::{config::SolimeshConfig, Solimesh};
    ///
    /// # async fn run() -> solimesh::error::Result<()> {
    /// let client = Solimesh::new(SolimeshConfig::from_env()).await?;
    /// let _mount = client.session().mount();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: SolimeshConfig) -> Result<Self> {
        let state = config.state();
        if let ConfigState::Misconfigured(reason) = &state {
            return Err(Error::config(reason));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build()?;

        let kv: Arc<dyn KeyValueStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStore::open(dir).await?),
            None => Arc::new(MemoryStore::new()),
        };

        let extraction = match config.vision_api_key.as_deref() {
            Some(key) => Some(ExtractionClient::new(
                VisionClient::new(key, http_client.clone())
                    .with_base_url(&config.vision_base_url)
                    .with_model(&config.vision_model),
            )),
            None => {
                debug!("{} not set, extraction disabled", ENV_GEMINI_API_KEY);
                None
            }
        };

        match (config.supabase_url.as_deref(), config.anon_key.as_deref()) {
            (Some(url), Some(key)) if state == ConfigState::Configured => {
                let url = url.trim();
                let key = key.trim();
                info!(url, "using hosted backend");

                let auth = Arc::new(Auth::new(
                    url,
                    key,
                    http_client.clone(),
                    AuthOptions {
                        auto_refresh_token: config.auto_refresh_token,
                        ..Default::default()
                    },
                ));
                let realtime = RealtimeClient::new(url, key);
                let token_forwarder = Some(forward_tokens(auth.as_ref(), realtime.clone()));

                let mut client = Self::from_parts(Parts {
                    auth: auth.clone(),
                    tables: Arc::new(RemoteTables::new(url, key, http_client, Some(auth))),
                    push: Arc::new(RemotePush::new(realtime)),
                    kv,
                    extraction,
                })
                .await?;
                client.mode = BackendMode::Hosted;
                client.token_forwarder = token_forwarder;
                Ok(client)
            }
            _ => {
                warn!("no backend configured, running in demo mode with in-memory data");
                Self::from_parts(Parts {
                    auth: Arc::new(DemoAuth::new(kv.clone())),
                    tables: Arc::new(MemoryTables::new()),
                    push: Arc::new(MemoryPush::new()),
                    kv,
                    extraction,
                })
                .await
            }
        }
    }

    /// Build from explicit collaborators. The result reports demo mode.
    pub async fn from_parts(parts: Parts) -> Result<Self> {
        let preferences = UiPreferenceStore::load(parts.kv.clone()).await?;
        Ok(Self {
            mode: BackendMode::Demo,
            session: SessionBridge::new(parts.auth),
            pantry: PantryStore::new(parts.tables.clone()),
            contacts: ContactStore::new(parts.tables.clone()),
            signals: SignalStore::new(parts.tables, parts.push),
            preferences,
            extraction: parts.extraction,
            token_forwarder: None,
        })
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn session(&self) -> &SessionBridge {
        &self.session
    }

    pub fn pantry(&self) -> &PantryStore {
        &self.pantry
    }

    pub fn contacts(&self) -> &ContactStore {
        &self.contacts
    }

    pub fn signals(&self) -> &SignalStore {
        &self.signals
    }

    pub fn preferences(&self) -> &UiPreferenceStore {
        &self.preferences
    }

    /// The extraction client, if a completion API key is configured.
    pub fn extraction(&self) -> Result<&ExtractionClient> {
        self.extraction
            .as_ref()
            .ok_or_else(|| Error::config(format!("{} is not set", ENV_GEMINI_API_KEY)))
    }
}

impl Drop for Solimesh {
    fn drop(&mut self) {
        if let Some(task) = &self.token_forwarder {
            task.abort();
        }
    }
}

/// Keep the realtime connection's access token in step with the session.
fn forward_tokens(auth: &Auth, realtime: RealtimeClient) -> JoinHandle<()> {
    let mut events = auth.on_auth_state_change();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(change) => {
                    let token = change.session.map(|s| s.access_token);
                    realtime.set_auth(token).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auth events lagged, realtime token may be stale");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Commonly used types.
pub mod prelude {
    pub use crate::backend::{AuthProvider, PushService, TableService};
    pub use crate::config::{ConfigState, SolimeshConfig};
    pub use crate::error::{Error, Result};
    pub use crate::extraction::{Extraction, ExtractionClient};
    pub use crate::kv::KeyValueStore;
    pub use crate::models::*;
    pub use crate::session::{SessionBridge, SessionMount, SessionState, SignUpForm, SignUpOutcome};
    pub use crate::store::{
        ContactStore, ExpiryBadge, PantryStore, QueryState, RelationshipHealth, SignalMount,
        SignalState, SignalStore, UiPreferenceStore,
    };
    pub use crate::{BackendMode, Parts, Solimesh};
}
