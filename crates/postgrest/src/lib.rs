//! Solimesh PostgREST client for Rust
//!
//! This crate provides table access over the hosted PostgREST service:
//! selecting with filters and ordering, inserting, patching and deleting
//! rows. Mutations always ask for `return=representation` so callers learn
//! which rows were touched.
//!
//! # Features
//!
//! - Query API (`select`, `insert`, `update`, `delete`)
//! - Filtering (`eq`, `neq`, `gt`, `lt`, `in_list`, ...)
//! - Ordering and pagination

use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use url::Url;

/// PostgREST APIエラーの詳細情報
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

// エラー詳細を整形して表示するための Display 実装
impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// エラー型
#[derive(Error, Debug)]
pub enum PostgrestError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: PostgrestApiErrorDetails,
        status: StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError { message: String, status: StatusCode },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// ソート方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// PostgreST クライアント
///
/// One client addresses one table. Filters accumulate as query parameters
/// and apply to whichever verb is executed last.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    base_url: String,
    table: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
}

impl PostgrestClient {
    /// 新しい PostgreST クライアントを作成
    pub fn new(
        base_url: &str,
        api_key: &str,
        table: &str,
        http_client: Client,
    ) -> Result<Self, PostgrestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).map_err(|_| {
                PostgrestError::InvalidParameters("API key is not a valid header value".into())
            })?,
        );
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            http_client,
            headers,
            query_params: Vec::new(),
        })
    }

    /// The table this client addresses.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// ヘッダーを追加
    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, PostgrestError> {
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header value: {}", value))
        })?;
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header name: {}", key))
        })?;

        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// 認証トークンを設定
    pub fn with_auth(self, token: &str) -> Result<Self, PostgrestError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    /// 取得するカラムを指定
    pub fn select(self, columns: &str) -> Self {
        self.set_param("select", columns.to_string())
    }

    /// 等価フィルター
    pub fn eq(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("eq.{}", value))
    }

    /// 非等価フィルター
    pub fn neq(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("neq.{}", value))
    }

    /// より大きいフィルター
    pub fn gt(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("gt.{}", value))
    }

    /// 以上フィルター
    pub fn gte(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("gte.{}", value))
    }

    /// より小さいフィルター
    pub fn lt(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("lt.{}", value))
    }

    /// 以下フィルター
    pub fn lte(self, column: &str, value: &str) -> Self {
        self.push_param(column, format!("lte.{}", value))
    }

    /// IN フィルター
    pub fn in_list(self, column: &str, values: &[&str]) -> Self {
        self.push_param(column, format!("in.({})", values.join(",")))
    }

    /// ソート順を指定
    pub fn order(self, column: &str, order: SortOrder) -> Self {
        self.set_param("order", format!("{}.{}", column, order.as_str()))
    }

    /// 取得件数を制限
    pub fn limit(self, count: usize) -> Self {
        self.set_param("limit", count.to_string())
    }

    /// オフセットを指定
    pub fn offset(self, count: usize) -> Self {
        self.set_param("offset", count.to_string())
    }

    /// データを取得
    pub async fn execute<T: for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>, PostgrestError> {
        let url = self.build_url()?;
        debug!("GET {}", url);

        let response = self
            .http_client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// データを挿入
    pub async fn insert<T: Serialize>(&self, values: T) -> Result<Vec<Value>, PostgrestError> {
        let body = serde_json::to_value(values)?;
        self.send_mutation(Method::POST, Some(body)).await
    }

    /// データを更新
    ///
    /// Refuses to run without a filter so a patch never hits the whole table.
    pub async fn update<T: Serialize>(&self, values: T) -> Result<Vec<Value>, PostgrestError> {
        self.require_filter("update")?;
        let body = serde_json::to_value(values)?;
        self.send_mutation(Method::PATCH, Some(body)).await
    }

    /// データを削除
    pub async fn delete(&self) -> Result<Vec<Value>, PostgrestError> {
        self.require_filter("delete")?;
        self.send_mutation(Method::DELETE, None).await
    }

    async fn send_mutation(
        &self,
        method: Method,
        body: Option<Value>,
    ) -> Result<Vec<Value>, PostgrestError> {
        let url = self.build_url()?;
        debug!("{} {}", method, url);

        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("prefer"),
            HeaderValue::from_static("return=representation"),
        );

        let mut request = self.http_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }

        let body_text = response.text().await.map_err(|e| {
            PostgrestError::DeserializationError(format!("Failed to read response body: {}", e))
        })?;
        trace!("mutation response: {}", body_text);

        // 204 No Content: nothing came back.
        if body_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Value>(&body_text)
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))?
        {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }

    async fn api_error(status: StatusCode, response: reqwest::Response) -> PostgrestError {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        match serde_json::from_str::<PostgrestApiErrorDetails>(&error_text) {
            Ok(details) => PostgrestError::ApiError { details, status },
            Err(_) => PostgrestError::UnparsedApiError {
                message: error_text,
                status,
            },
        }
    }

    fn require_filter(&self, verb: &str) -> Result<(), PostgrestError> {
        let filtered = self
            .query_params
            .iter()
            .any(|(k, _)| !matches!(k.as_str(), "select" | "order" | "limit" | "offset"));
        if filtered {
            Ok(())
        } else {
            Err(PostgrestError::InvalidParameters(format!(
                "{} on {} requires at least one filter",
                verb, self.table
            )))
        }
    }

    fn set_param(mut self, key: &str, value: String) -> Self {
        self.query_params.retain(|(k, _)| k != key);
        self.query_params.push((key.to_string(), value));
        self
    }

    fn push_param(mut self, key: &str, value: String) -> Self {
        self.query_params.push((key.to_string(), value));
        self
    }

    fn build_url(&self) -> Result<Url, PostgrestError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, table: &str) -> PostgrestClient {
        PostgrestClient::new(&server.uri(), "fake-key", table, reqwest::Client::new()).unwrap()
    }

    #[tokio::test]
    async fn test_select_with_filter_and_order() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/items"))
            .and(query_param("select", "*"))
            .and(query_param("user_id", "eq.u1"))
            .and(query_param("order", "expiry_date.asc"))
            .and(header("apikey", "fake-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "name": "Test Item 1" },
                { "id": 2, "name": "Test Item 2" }
            ])))
            .mount(&mock_server)
            .await;

        let data = client(&mock_server, "items")
            .select("*")
            .eq("user_id", "u1")
            .order("expiry_date", SortOrder::Ascending)
            .execute::<Value>()
            .await
            .unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(
            data.first().and_then(|v| v.get("name")).and_then(Value::as_str),
            Some("Test Item 1")
        );
    }

    #[tokio::test]
    async fn test_insert_returns_rows() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/items"))
            .and(header("prefer", "return=representation"))
            .and(body_json(json!([{ "name": "Milk" }])))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!([{ "id": 7, "name": "Milk" }])),
            )
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "items")
            .insert(json!([{ "name": "Milk" }]))
            .await
            .unwrap();

        assert_eq!(rows, vec![json!({ "id": 7, "name": "Milk" })]);
    }

    #[tokio::test]
    async fn test_delete_no_content() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/items"))
            .and(query_param("id", "eq.7"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let rows = client(&mock_server, "items").eq("id", "7").delete().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_filter() {
        let mock_server = MockServer::start().await;

        let err = client(&mock_server, "items")
            .update(json!({ "name": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, PostgrestError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_api_error_details() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/items"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "42703",
                "message": "column items.nope does not exist",
                "details": null,
                "hint": null
            })))
            .mount(&mock_server)
            .await;

        let err = client(&mock_server, "items")
            .select("nope")
            .execute::<Value>()
            .await
            .unwrap_err();

        match err {
            PostgrestError::ApiError { details, status } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(details.code.as_deref(), Some("42703"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unparsed_error_message() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;

            Mock::given(method("PATCH"))
                .and(path("/rest/v1/items"))
                .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
                .mount(&mock_server)
                .await;

            let err = client(&mock_server, "items")
                .eq("id", "1")
                .update(json!({ "name": "x" }))
                .await
                .unwrap_err();

            match err {
                PostgrestError::UnparsedApiError { message, .. } => {
                    assert_eq!(message, "upstream down")
                }
                other => panic!("unexpected error: {:?}", other),
            }
        });
    }
}
