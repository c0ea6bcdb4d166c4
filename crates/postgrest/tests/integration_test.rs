use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use solimesh_postgrest::{PostgrestClient, SortOrder};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Contact {
    id: String,
    contact_name: String,
}

fn create_test_client(server: &MockServer) -> PostgrestClient {
    PostgrestClient::new(&server.uri(), "anon", "support_contacts", Client::new())
        .unwrap()
        .with_auth("user-token")
        .unwrap()
}

#[tokio::test]
async fn test_crud_operations() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/support_contacts"))
        .and(query_param("user_id", "eq.u1"))
        .and(query_param("order", "last_contact_date.desc"))
        .and(header("Authorization", "Bearer user-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "c2", "contact_name": "Ana" },
            { "id": "c1", "contact_name": "Bo" }
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/support_contacts"))
        .and(query_param("id", "eq.c1"))
        .and(body_json(json!({ "notes": "called" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "c1", "contact_name": "Bo", "user_id": "u1" }
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);

    let listed: Vec<Contact> = client
        .clone()
        .select("*")
        .eq("user_id", "u1")
        .order("last_contact_date", SortOrder::Descending)
        .execute()
        .await
        .unwrap();
    assert_eq!(
        listed.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
        vec!["c2", "c1"]
    );

    let updated = client
        .eq("id", "c1")
        .update(json!({ "notes": "called" }))
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["user_id"], "u1");
}

#[tokio::test]
async fn test_order_replaces_previous_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/support_contacts"))
        .and(query_param("order", "created_at.asc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows: Vec<serde_json::Value> = create_test_client(&mock_server)
        .order("last_contact_date", SortOrder::Descending)
        .order("created_at", SortOrder::Ascending)
        .execute()
        .await
        .unwrap();
    assert!(rows.is_empty());
}
