//! Wire-level behavior of the FHIR client against a mock server.

use std::time::Duration;

use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harvest_client::{ensure_success, BundlePages, ClientConfig, ClientError, FhirClient, RetryPolicy};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

async fn client_for(server: &MockServer) -> FhirClient {
    let mut config = ClientConfig::new(server.uri());
    config.retry = fast_retry();
    FhirClient::new(config).await.unwrap()
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Patient/p1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/p1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"resourceType": "Patient", "id": "p1"})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resource = client.get_json("Patient/p1").await.unwrap();
    assert_eq!(resource["id"], "p1");
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Patient/p1"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get_json("Patient/p1").await.unwrap_err();
    match err {
        ClientError::Exhausted {
            status, attempts, ..
        } => {
            assert_eq!(status, 502);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn honors_retry_after_on_429() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Observation"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"resourceType": "Bundle", "type": "searchset"})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let bundle = client.get_json("Observation").await.unwrap();
    assert_eq!(bundle["resourceType"], "Bundle");
}

#[tokio::test]
async fn missing_resource_is_a_soft_miss() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Observation/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(client
        .fetch_resource("Observation/nope")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn surfaces_operation_outcome_diagnostics() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Condition"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [
                {"severity": "error", "code": "invalid", "diagnostics": "bad search parameter"},
            ],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get_json("Condition").await.unwrap_err();
    match err {
        ClientError::Rejected {
            status,
            diagnostics,
        } => {
            assert_eq!(status, 400);
            assert_eq!(diagnostics, "bad search parameter");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_export_is_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let response = client.request(Method::GET, "poll/1").await.unwrap();
    let err = ensure_success(response).await.unwrap_err();
    assert!(matches!(err, ClientError::ExportExpired { .. }));
}

#[tokio::test]
async fn static_bearer_token_is_attached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Patient/p1"))
        .and(header("authorization", "Bearer sesame"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"resourceType": "Patient", "id": "p1"})),
        )
        .mount(&server)
        .await;

    let mut config = ClientConfig::new(server.uri());
    config.retry = fast_retry();
    config.bearer_token = Some("sesame".to_string());
    let client = FhirClient::new(config).await.unwrap();

    let resource = client.get_json("Patient/p1").await.unwrap();
    assert_eq!(resource["id"], "p1");
}

#[tokio::test]
async fn pagination_follows_next_links() {
    let server = MockServer::start().await;

    let page2_url = format!("{}/page2", server.uri());
    Mock::given(method("GET"))
        .and(path("/Condition"))
        .and(query_param("patient", "p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": [{"relation": "next", "url": page2_url}],
            "entry": [{"resource": {"resourceType": "Condition", "id": "c1"}}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [{"resource": {"resourceType": "Condition", "id": "c2"}}],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let mut pages = BundlePages::new(&client, format!("{}/Condition?patient=p1", server.uri()));

    let mut ids = Vec::new();
    while let Some(bundle) = pages.next_page().await.unwrap() {
        for resource in harvest_client::paging::entry_resources(&bundle) {
            ids.push(resource["id"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(ids, vec!["c1", "c2"]);
    assert!(pages.cursor().is_none());
}
