//! Solimesh Auth client for Rust
//!
//! This crate talks to the hosted auth provider (`/auth/v1`): sign up,
//! password sign in, session probing and sign out. Every change to the
//! current session is pushed to listeners registered through
//! [`Auth::on_auth_state_change`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing session")]
    MissingSession,
}

/// Error body returned by the provider, e.g. `{"error_description": "..."}`
/// or `{"msg": "..."}` depending on the endpoint.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(alias = "error_description", alias = "msg", alias = "message")]
    message: Option<String>,
}

impl AuthError {
    fn from_body(status: reqwest::StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| body.to_string());
        AuthError::ApiError(format!("{} ({})", message, status))
    }
}

/// ユーザー情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub app_metadata: Value,
    #[serde(default)]
    pub user_metadata: Value,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// セッション情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub token_type: String,
    pub user: User,
}

impl Session {
    /// Check if the session has expired. Sessions without `expires_at` never do.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now().timestamp() >= expires_at,
            None => false,
        }
    }

    fn stamp_expiry(mut self) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = Some(Utc::now().timestamp() + self.expires_in);
        }
        self
    }
}

/// Result of a sign up.
///
/// When the project requires email confirmation the provider returns the
/// user without a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpResponse {
    pub user: User,
    pub session: Option<Session>,
}

/// 認証状態の変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// A pushed auth state change. `session` is `None` once signed out.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStateChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

/// クライアントオプション
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub auto_refresh_token: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            auto_refresh_token: true,
        }
    }
}

/// Auth クライアント
pub struct Auth {
    url: String,
    key: String,
    http_client: Client,
    options: AuthOptions,
    current_session: Arc<RwLock<Option<Session>>>,
    state_change: broadcast::Sender<AuthStateChange>,
}

impl Auth {
    /// 新しい Auth クライアントを作成
    pub fn new(url: &str, key: &str, http_client: Client, options: AuthOptions) -> Self {
        let (state_change, _) = broadcast::channel(16);
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
            options,
            current_session: Arc::new(RwLock::new(None)),
            state_change,
        }
    }

    /// Receive every session change made through this client.
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthStateChange> {
        self.state_change.subscribe()
    }

    /// ユーザー登録
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpResponse, AuthError> {
        let url = format!("{}/auth/v1/signup", self.url);
        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let body: Value = self.post_json(&url, &payload).await?;

        // With auto-confirm the body is a full session; otherwise it is the user.
        if body.get("access_token").is_some() {
            let session = serde_json::from_value::<Session>(body)?.stamp_expiry();
            info!("Signed up and signed in user {}", session.user.id);
            self.store_session(Some(session.clone()), AuthChangeEvent::SignedIn);
            Ok(SignUpResponse {
                user: session.user.clone(),
                session: Some(session),
            })
        } else {
            let user: User = serde_json::from_value(body)?;
            info!("Signed up user {} (confirmation pending)", user.id);
            Ok(SignUpResponse { user, session: None })
        }
    }

    /// メール・パスワードでログイン
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.url);
        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let session = self
            .post_json::<Session>(&url, &payload)
            .await?
            .stamp_expiry();

        info!("Signed in user {}", session.user.id);
        self.store_session(Some(session.clone()), AuthChangeEvent::SignedIn);
        Ok(session)
    }

    /// 現在のセッションを取得
    pub fn get_session(&self) -> Option<Session> {
        self.read_session().clone()
    }

    /// Restore a session obtained elsewhere, e.g. from durable storage.
    pub fn set_session(&self, session: Session) {
        self.store_session(Some(session), AuthChangeEvent::SignedIn);
    }

    /// Return the current session, refreshing it first when it has expired
    /// and auto refresh is enabled. An expired session that cannot be
    /// refreshed is dropped.
    pub async fn probe_session(&self) -> Result<Option<Session>, AuthError> {
        let session = match self.get_session() {
            Some(session) => session,
            None => return Ok(None),
        };

        if !session.is_expired() {
            return Ok(Some(session));
        }

        if !self.options.auto_refresh_token {
            debug!("Session expired and auto refresh is disabled");
            self.store_session(None, AuthChangeEvent::SignedOut);
            return Ok(None);
        }

        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Failed to refresh expired session: {}", e);
                self.store_session(None, AuthChangeEvent::SignedOut);
                Err(e)
            }
        }
    }

    /// 現在のユーザーを取得
    pub async fn get_user(&self) -> Result<User, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;
        let url = format!("{}/auth/v1/user", self.url);

        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            return Err(AuthError::from_body(status, &error_text));
        }

        Ok(response.json().await?)
    }

    /// セッションをリフレッシュ
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.url);
        let payload = serde_json::json!({
            "refresh_token": session.refresh_token,
        });

        let new_session = self
            .post_json::<Session>(&url, &payload)
            .await?
            .stamp_expiry();

        debug!("Refreshed session for user {}", new_session.user.id);
        self.store_session(Some(new_session.clone()), AuthChangeEvent::TokenRefreshed);
        Ok(new_session)
    }

    /// サインアウト
    ///
    /// The local session is cleared even when the provider rejects the
    /// logout request; the error is still returned. Signing out without a
    /// session only clears local state.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(session) = self.get_session() else {
            debug!("No session to sign out, clearing local state");
            self.store_session(None, AuthChangeEvent::SignedOut);
            return Ok(());
        };
        let url = format!("{}/auth/v1/logout", self.url);

        let result = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await;

        self.store_session(None, AuthChangeEvent::SignedOut);

        let response = result?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            return Err(AuthError::from_body(status, &error_text));
        }

        info!("Signed out user {}", session.user.id);
        Ok(())
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        payload: &Value,
    ) -> Result<T, AuthError> {
        let response = self
            .http_client
            .post(url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            return Err(AuthError::from_body(status, &error_text));
        }

        Ok(response.json::<T>().await?)
    }

    fn store_session(&self, session: Option<Session>, event: AuthChangeEvent) {
        *self.write_session() = session.clone();

        // No receivers is fine; nobody is listening yet.
        let _ = self.state_change.send(AuthStateChange { event, session });
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.current_session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.current_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_body(token: &str) -> Value {
        serde_json::json!({
            "access_token": token,
            "refresh_token": "test_refresh_token",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": {
                "id": "test_user_id",
                "email": "test@example.com",
                "app_metadata": {},
                "user_metadata": {},
                "created_at": "2021-01-01T00:00:00Z",
                "updated_at": "2021-01-01T00:00:00Z"
            }
        })
    }

    #[test]
    fn test_sign_up_with_session() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("POST"))
                .and(path("/auth/v1/signup"))
                .respond_with(ResponseTemplate::new(200).set_body_json(session_body("t1")))
                .mount(&mock_server)
                .await;

            let auth = Auth::new(
                &mock_server.uri(),
                "test_key",
                Client::new(),
                AuthOptions::default(),
            );
            let mut events = auth.on_auth_state_change();

            let result = auth.sign_up("test@example.com", "password123").await.unwrap();
            assert_eq!(result.user.email.as_deref(), Some("test@example.com"));
            assert!(result.session.is_some());
            assert!(auth.get_session().is_some());

            let change = events.recv().await.unwrap();
            assert_eq!(change.event, AuthChangeEvent::SignedIn);
        });
    }

    #[tokio::test]
    async fn test_sign_up_pending_confirmation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pending_user",
                "email": "new@example.com",
                "created_at": "2024-05-01T10:00:00Z"
            })))
            .mount(&mock_server)
            .await;

        let auth = Auth::new(&mock_server.uri(), "test_key", Client::new(), AuthOptions::default());
        let result = auth.sign_up("new@example.com", "password123").await.unwrap();

        assert_eq!(result.user.id, "pending_user");
        assert!(result.session.is_none());
        assert!(auth.get_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_error_uses_description() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&mock_server)
            .await;

        let auth = Auth::new(&mock_server.uri(), "test_key", Client::new(), AuthOptions::default());
        let err = auth
            .sign_in_with_password("test@example.com", "wrong")
            .await
            .unwrap_err();

        match err {
            AuthError::ApiError(msg) => assert!(msg.contains("Invalid login credentials")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(auth.get_session().is_none());
    }

    #[test]
    fn test_session_expiry() {
        let mut session: Session = serde_json::from_value(session_body("t")).unwrap();
        assert!(!session.is_expired());

        session.expires_at = Some(Utc::now().timestamp() - 10);
        assert!(session.is_expired());

        session.expires_at = None;
        let stamped = session.stamp_expiry();
        assert!(stamped.expires_at.unwrap() > Utc::now().timestamp());
    }
}
