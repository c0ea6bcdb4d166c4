use reqwest::Client;
use serde_json::json;
use solimesh_auth::{Auth, AuthChangeEvent, AuthError, AuthOptions, Session};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session_json(access_token: &str, refresh_token: &str) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": refresh_token,
        "user": {
            "id": "test_user_id",
            "email": "test@example.com",
            "role": "authenticated",
            "created_at": "2024-01-01T00:00:00Z"
        }
    })
}

fn client(server: &MockServer) -> Auth {
    Auth::new(&server.uri(), "test_anon_key", Client::new(), AuthOptions::default())
}

#[tokio::test]
async fn test_sign_in_with_password() {
    // モックサーバーの起動
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .and(header("apikey", "test_anon_key"))
        .and(body_json(json!({
            "email": "test@example.com",
            "password": "password123"
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_json("test_access_token", "test_refresh_token")),
        )
        .mount(&mock_server)
        .await;

    let auth = client(&mock_server);
    let session = auth
        .sign_in_with_password("test@example.com", "password123")
        .await
        .unwrap();

    assert_eq!(session.access_token, "test_access_token");
    assert_eq!(session.user.id, "test_user_id");
    assert_eq!(session.user.created_at, "2024-01-01T00:00:00Z");
    assert!(session.expires_at.is_some());
    assert_eq!(auth.get_session(), Some(session));
}

#[tokio::test]
async fn test_sign_out_clears_session_and_notifies() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_json("test_access_token", "test_refresh_token")),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .and(header("Authorization", "Bearer test_access_token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let auth = client(&mock_server);
    auth.sign_in_with_password("test@example.com", "password123")
        .await
        .unwrap();

    let mut events = auth.on_auth_state_change();
    auth.sign_out().await.unwrap();

    assert!(auth.get_session().is_none());
    let change = events.recv().await.unwrap();
    assert_eq!(change.event, AuthChangeEvent::SignedOut);
    assert!(change.session.is_none());
}

#[tokio::test]
async fn test_sign_out_without_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&mock_server)
        .await;

    let auth = client(&mock_server);
    let mut events = auth.on_auth_state_change();

    auth.sign_out().await.unwrap();
    assert!(auth.get_session().is_none());
    assert_eq!(events.recv().await.unwrap().event, AuthChangeEvent::SignedOut);
}

#[tokio::test]
async fn test_sign_out_twice_is_idempotent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_json("test_access_token", "test_refresh_token")),
        )
        .mount(&mock_server)
        .await;

    // logout は一度だけ呼ばれる
    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let auth = client(&mock_server);
    auth.sign_in_with_password("test@example.com", "password123")
        .await
        .unwrap();

    auth.sign_out().await.unwrap();
    auth.sign_out().await.unwrap();
    assert!(auth.get_session().is_none());
}

#[tokio::test]
async fn test_session_is_kept_in_memory() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_json("test_access_token", "test_refresh_token")),
        )
        .mount(&mock_server)
        .await;

    let auth = Auth::new(
        &mock_server.uri(),
        "test_anon_key",
        Client::new(),
        AuthOptions {
            auto_refresh_token: false,
        },
    );
    let mut events = auth.on_auth_state_change();
    let session = auth
        .sign_in_with_password("test@example.com", "password123")
        .await
        .unwrap();

    let change = events.recv().await.unwrap();
    assert_eq!(change.event, AuthChangeEvent::SignedIn);
    assert_eq!(change.session.as_ref(), auth.get_session().as_ref());
    assert_eq!(auth.get_session(), Some(session));
}

#[tokio::test]
async fn test_probe_refreshes_expired_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(body_json(json!({ "refresh_token": "old_refresh_token" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_json("new_access_token", "new_refresh_token")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let auth = client(&mock_server);
    let mut expired: Session =
        serde_json::from_value(session_json("old_access_token", "old_refresh_token")).unwrap();
    expired.expires_at = Some(0);
    auth.set_session(expired);

    let mut events = auth.on_auth_state_change();
    let probed = auth.probe_session().await.unwrap().unwrap();

    assert_eq!(probed.access_token, "new_access_token");
    assert_eq!(probed.refresh_token, "new_refresh_token");
    assert_eq!(events.recv().await.unwrap().event, AuthChangeEvent::TokenRefreshed);
}

#[tokio::test]
async fn test_probe_without_session() {
    let mock_server = MockServer::start().await;
    let auth = client(&mock_server);

    assert_eq!(auth.probe_session().await.unwrap(), None);
}

#[tokio::test]
async fn test_get_user_requires_session() {
    let mock_server = MockServer::start().await;
    let auth = client(&mock_server);

    assert!(matches!(
        auth.get_user().await.unwrap_err(),
        AuthError::MissingSession
    ));
}
