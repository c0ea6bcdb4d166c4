use serde_json::json;
use solimesh_vision::{GenerateContentRequest, Part, VisionClient, VisionError};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup_client(server_uri: &str) -> VisionClient {
    VisionClient::new("fake-api-key", reqwest::Client::new())
        .with_base_url(server_uri)
        .with_model("gemini-test")
}

#[tokio::test]
async fn test_generate_content_success() {
    let server = MockServer::start().await;
    let client = setup_client(&server.uri());

    let request = GenerateContentRequest::from_parts(vec![
        Part::text("list items"),
        Part::inline_data("image/png", "iVBOR"),
    ]);

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-test:generateContent"))
        .and(query_param("key", "fake-api-key"))
        .and(body_json(json!({
            "contents": [{
                "parts": [
                    { "text": "list items" },
                    { "inlineData": { "mimeType": "image/png", "data": "iVBOR" } }
                ]
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "[\"Milk\"]" }], "role": "model" },
                "finishReason": "STOP"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.generate_content(&request).await.unwrap();
    assert_eq!(response.first_text(), Some("[\"Milk\"]"));
    assert_eq!(response.candidates[0].finish_reason.as_deref(), Some("STOP"));
}

#[tokio::test]
async fn test_generate_content_api_error() {
    let server = MockServer::start().await;
    let client = setup_client(&server.uri());

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-test:generateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT" }
        })))
        .mount(&server)
        .await;

    let err = client
        .generate_content(&GenerateContentRequest::from_parts(vec![Part::text("x")]))
        .await
        .unwrap_err();

    match err {
        VisionError::ApiError { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "API key not valid");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_generate_content_unparsed_error() {
    let server = MockServer::start().await;
    let client = setup_client(&server.uri());

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let err = client
        .generate_content(&GenerateContentRequest::from_parts(vec![Part::text("x")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VisionError::ApiError { status: 503, ref message } if message == "Service Unavailable"
    ));
}
