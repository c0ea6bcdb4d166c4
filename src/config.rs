//! Configuration for the Solimesh client layer

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const ENV_SUPABASE_URL: &str = "SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "SUPABASE_ANON_KEY";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_GEMINI_MODEL: &str = "GEMINI_MODEL";
pub const ENV_DATA_DIR: &str = "SOLIMESH_DATA_DIR";

/// Which backends a configuration resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigState {
    /// URL and key are both present and valid.
    Configured,
    /// Neither URL nor key is present; in-memory backends stand in.
    DemoMode,
    /// Anything else. The client refuses to start.
    Misconfigured(String),
}

/// Configuration options for the Solimesh client
#[derive(Debug, Clone)]
pub struct SolimeshConfig {
    /// Base URL of the hosted backend
    pub supabase_url: Option<String>,

    /// Anonymous API key for the hosted backend
    pub anon_key: Option<String>,

    /// API key for the completion endpoint
    pub vision_api_key: Option<String>,

    /// Completion model name
    pub vision_model: String,

    /// Completion endpoint base URL
    pub vision_base_url: String,

    /// Directory for durable local storage; memory only when unset
    pub data_dir: Option<PathBuf>,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    /// Whether the startup probe refreshes an expired session
    pub auto_refresh_token: bool,
}

impl Default for SolimeshConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            vision_api_key: None,
            vision_model: solimesh_vision::DEFAULT_MODEL.to_string(),
            vision_base_url: solimesh_vision::DEFAULT_BASE_URL.to_string(),
            data_dir: None,
            request_timeout: Some(Duration::from_secs(30)),
            auto_refresh_token: true,
        }
    }
}

impl SolimeshConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let defaults = Self::default();
        Self {
            supabase_url: get(ENV_SUPABASE_URL),
            anon_key: get(ENV_SUPABASE_ANON_KEY),
            vision_api_key: get(ENV_GEMINI_API_KEY),
            vision_model: get(ENV_GEMINI_MODEL).unwrap_or(defaults.vision_model),
            data_dir: get(ENV_DATA_DIR).map(PathBuf::from),
            ..defaults
        }
    }

    /// Set the backend URL and anonymous key
    pub fn with_supabase(mut self, url: &str, anon_key: &str) -> Self {
        self.supabase_url = Some(url.to_string());
        self.anon_key = Some(anon_key.to_string());
        self
    }

    /// Set the completion endpoint API key
    pub fn with_vision_api_key(mut self, value: &str) -> Self {
        self.vision_api_key = Some(value.to_string());
        self
    }

    /// Set the completion model
    pub fn with_vision_model(mut self, value: &str) -> Self {
        self.vision_model = value.to_string();
        self
    }

    /// Set the completion endpoint base URL
    pub fn with_vision_base_url(mut self, value: &str) -> Self {
        self.vision_base_url = value.to_string();
        self
    }

    /// Set the durable storage directory
    pub fn with_data_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(value.into());
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    /// Classify this configuration.
    pub fn state(&self) -> ConfigState {
        let url = self.supabase_url.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let key = self.anon_key.as_deref().map(str::trim).filter(|v| !v.is_empty());

        match (url, key) {
            (None, None) => ConfigState::DemoMode,
            (Some(_), None) => ConfigState::Misconfigured(format!(
                "{} is set but {} is not",
                ENV_SUPABASE_URL, ENV_SUPABASE_ANON_KEY
            )),
            (None, Some(_)) => ConfigState::Misconfigured(format!(
                "{} is set but {} is not",
                ENV_SUPABASE_ANON_KEY, ENV_SUPABASE_URL
            )),
            (Some(url), Some(_)) => match Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                    ConfigState::Configured
                }
                Ok(parsed) => ConfigState::Misconfigured(format!(
                    "{} must use http or https, got {}",
                    ENV_SUPABASE_URL,
                    parsed.scheme()
                )),
                Err(e) => ConfigState::Misconfigured(format!(
                    "{} is not a valid URL: {}",
                    ENV_SUPABASE_URL, e
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> SolimeshConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SolimeshConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_nothing_set_is_demo_mode() {
        assert_eq!(lookup(&[]).state(), ConfigState::DemoMode);
        assert_eq!(SolimeshConfig::default().state(), ConfigState::DemoMode);
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let config = lookup(&[(ENV_SUPABASE_URL, "  "), (ENV_SUPABASE_ANON_KEY, "")]);
        assert_eq!(config.state(), ConfigState::DemoMode);
    }

    #[test]
    fn test_full_config() {
        let config = lookup(&[
            (ENV_SUPABASE_URL, "https://abc.supabase.co"),
            (ENV_SUPABASE_ANON_KEY, "anon"),
            (ENV_GEMINI_API_KEY, "g"),
            (ENV_GEMINI_MODEL, "gemini-custom"),
            (ENV_DATA_DIR, "/tmp/solimesh"),
        ]);
        assert_eq!(config.state(), ConfigState::Configured);
        assert_eq!(config.vision_api_key.as_deref(), Some("g"));
        assert_eq!(config.vision_model, "gemini-custom");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/solimesh")));
    }

    #[test]
    fn test_half_config_is_misconfigured() {
        let config = lookup(&[(ENV_SUPABASE_URL, "https://abc.supabase.co")]);
        assert!(matches!(config.state(), ConfigState::Misconfigured(_)));

        let config = lookup(&[(ENV_SUPABASE_ANON_KEY, "anon")]);
        assert!(matches!(config.state(), ConfigState::Misconfigured(_)));
    }

    #[test]
    fn test_invalid_url_is_misconfigured() {
        let config = SolimeshConfig::default().with_supabase("not a url", "anon");
        assert!(matches!(config.state(), ConfigState::Misconfigured(_)));

        let config = SolimeshConfig::default().with_supabase("ftp://abc", "anon");
        assert!(matches!(config.state(), ConfigState::Misconfigured(_)));
    }
}
