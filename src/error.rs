//! Error handling for the Solimesh client layer

use std::fmt;
use thiserror::Error;

use solimesh_auth::AuthError;
use solimesh_postgrest::PostgrestError;
use solimesh_realtime::RealtimeError;
use solimesh_vision::VisionError;

/// Unified error type for the Solimesh client layer
#[derive(Error, Debug)]
pub enum Error {
    /// Auth provider errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Tabular data service errors
    #[error("Database error: {0}")]
    Database(#[from] PostgrestError),

    /// Push channel errors
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// Completion endpoint errors
    #[error("Vision error: {0}")]
    Vision(#[from] VisionError),

    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Missing or inconsistent backend configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// User input rejected before any network call. Displays the bare
    /// message so it can be shown as-is.
    #[error("{0}")]
    Validation(String),

    /// Durable key/value storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A backend (usually in-memory) refused the operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Malformed data that could not be turned into a domain value
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new validation error
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new storage error
    pub fn storage<T: fmt::Display>(msg: T) -> Self {
        Error::Storage(msg.to_string())
    }

    /// Create a new backend error
    pub fn backend<T: fmt::Display>(msg: T) -> Self {
        Error::Backend(msg.to_string())
    }

    /// Create a new decode error
    pub fn decode<T: fmt::Display>(msg: T) -> Self {
        Error::Decode(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_displays_bare_message() {
        let err = Error::validation("Passwords do not match");
        assert_eq!(err.to_string(), "Passwords do not match");
    }

    #[test]
    fn test_sub_crate_errors_convert() {
        let err: Error = AuthError::MissingSession.into();
        assert!(matches!(err, Error::Auth(AuthError::MissingSession)));
    }
}
