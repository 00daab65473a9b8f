//! Hydration behavior against a mock FHIR server: attachment inlining,
//! missing-Observation closure, referenced Medications, and idempotence.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harvest_client::{ClientConfig, FhirClient, RetryPolicy};
use harvest_engine::{perform_hydrate, Budgets, Supervisor};
use harvest_store::{ndjson, ExportMetadata, ExportMode, ExportParams, SubExport, Workspace};

async fn client_for(server: &MockServer) -> FhirClient {
    let mut config = ClientConfig::new(server.uri());
    config.retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };
    FhirClient::new(config).await.unwrap()
}

fn supervisor() -> Arc<Supervisor> {
    Arc::new(Supervisor::new(Budgets::default()))
}

/// Seed a completed sub-export holding the given resources, uncompressed
/// so test assertions can read the bytes easily.
fn seed_subexport(
    workspace_dir: &std::path::Path,
    fhir_url: &str,
    pages: &[(&str, Vec<Value>)],
) -> (SubExport, ExportMetadata) {
    let workspace = Workspace::open(workspace_dir).unwrap();
    let params = ExportParams {
        fhir_url: fhir_url.to_string(),
        types: pages.iter().map(|(t, _)| t.to_string()).collect(),
        type_filters: vec![],
        since: None,
        since_mode: None,
        mode: ExportMode::Crawl,
        nickname: Some("seed".to_string()),
        compression: false,
        group: None,
    };
    let (sub, mut metadata) = workspace.open_subexport(&params).unwrap();
    for (res_type, resources) in pages {
        let mut writer = sub.writer(res_type, false).unwrap();
        for value in resources {
            writer.append(value).unwrap();
        }
        writer.finish().unwrap();
        metadata.mark_done(res_type, "2024-06-01T00:00:00Z".parse().unwrap());
    }
    metadata.complete = true;
    sub.save_metadata(&metadata).unwrap();
    (sub, metadata)
}

#[tokio::test]
async fn missing_observations_are_fetched_once() {
    let server = MockServer::start().await;

    // Two reports referencing the same missing Observation, which itself
    // chains to a member.
    let dir = tempfile::tempdir().unwrap();
    let (sub, _) = seed_subexport(
        dir.path(),
        &server.uri(),
        &[
            (
                "DiagnosticReport",
                vec![
                    json!({"resourceType": "DiagnosticReport", "id": "r1",
                           "result": [{"reference": "Observation/o99"}]}),
                    json!({"resourceType": "DiagnosticReport", "id": "r2",
                           "result": [{"reference": "Observation/o99"}]}),
                ],
            ),
            (
                "Observation",
                vec![json!({"resourceType": "Observation", "id": "present"})],
            ),
        ],
    );

    Mock::given(method("GET"))
        .and(path("/Observation/o99"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Observation",
            "id": "o99",
            "hasMember": [
                {"reference": "Observation/member1"},
                {"reference": "Observation/present"},
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Observation/member1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"resourceType": "Observation", "id": "member1"}),
        ))
        .expect(1)
        .mount(&server)
        .await;
    // A dangling reference is recorded and omitted.
    Mock::given(method("GET"))
        .and(path("/Observation/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let outcomes = perform_hydrate(&client, &supervisor(), dir.path(), None, false)
        .await
        .unwrap();

    let observations_task = outcomes
        .iter()
        .find(|outcome| outcome.task == "observations")
        .unwrap();
    assert_eq!(observations_task.count, 2);

    let observations = ndjson::collect_resources(sub.dir(), "Observation").unwrap();
    let mut ids: Vec<&str> = observations
        .iter()
        .map(|o| o["id"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["member1", "o99", "present"]);

    let metadata = sub.load_metadata().unwrap().unwrap();
    assert!(metadata.hydration["observations"].complete);
    assert_eq!(metadata.hydration["observations"].count, 2);

    // Second run: markers say complete, so no network and no mutation.
    let before = std::fs::read_dir(sub.dir()).unwrap().count();
    let outcomes = perform_hydrate(&client, &supervisor(), dir.path(), None, false)
        .await
        .unwrap();
    assert!(outcomes.iter().all(|outcome| outcome.skipped));
    assert_eq!(std::fs::read_dir(sub.dir()).unwrap().count(), before);
}

#[tokio::test]
async fn notes_are_inlined_with_hash_and_tag() {
    let server = MockServer::start().await;
    let body = "the patient is doing well";

    let dir = tempfile::tempdir().unwrap();
    let (sub, _) = seed_subexport(
        dir.path(),
        &server.uri(),
        &[(
            "DocumentReference",
            vec![json!({
                "resourceType": "DocumentReference",
                "id": "d1",
                "content": [
                    {"attachment": {"contentType": "text/plain; charset=utf-8",
                                    "url": format!("{}/Binary/b1", server.uri())}},
                    {"attachment": {"contentType": "application/pdf",
                                    "url": format!("{}/Binary/b2", server.uri())}},
                ],
            })],
        )],
    );

    Mock::given(method("GET"))
        .and(path("/Binary/b1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
        .expect(1)
        .mount(&server)
        .await;
    // The PDF attachment is out of the default mimetype allowlist.
    Mock::given(method("GET"))
        .and(path("/Binary/b2"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("%PDF", "application/pdf"))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let outcomes = perform_hydrate(&client, &supervisor(), dir.path(), None, false)
        .await
        .unwrap();
    let inline_task = outcomes
        .iter()
        .find(|outcome| outcome.task == "inline")
        .unwrap();
    assert_eq!(inline_task.count, 1);

    let docs = ndjson::collect_resources(sub.dir(), "DocumentReference").unwrap();
    assert_eq!(docs.len(), 1);
    let attachment = &docs[0]["content"][0]["attachment"];
    assert_eq!(attachment["data"], BASE64.encode(body));
    assert_eq!(attachment["size"], json!(body.len()));
    assert_eq!(attachment["hash"], BASE64.encode(Sha1::digest(body)));
    // untouched sibling attachment
    assert!(docs[0]["content"][1]["attachment"].get("data").is_none());
    // hydrated marker tag
    let tags = docs[0]["meta"]["tag"].as_array().unwrap();
    assert!(tags.iter().any(|tag| tag["code"] == "hydrated"));
}

#[tokio::test]
async fn referenced_medications_are_downloaded() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let (sub, _) = seed_subexport(
        dir.path(),
        &server.uri(),
        &[(
            "MedicationRequest",
            vec![
                json!({"resourceType": "MedicationRequest", "id": "m1",
                       "medicationReference": {"reference": "Medication/med1"}}),
                json!({"resourceType": "MedicationRequest", "id": "m2",
                       "medicationReference": {"reference": "Medication/med1"}}),
                json!({"resourceType": "MedicationRequest", "id": "m3",
                       "medicationCodeableConcept": {"text": "inline med"}}),
            ],
        )],
    );

    Mock::given(method("GET"))
        .and(path("/Medication/med1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"resourceType": "Medication", "id": "med1"}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let outcomes = perform_hydrate(&client, &supervisor(), dir.path(), None, false)
        .await
        .unwrap();
    let medications_task = outcomes
        .iter()
        .find(|outcome| outcome.task == "medications")
        .unwrap();
    assert_eq!(medications_task.count, 1);

    let medications = ndjson::collect_resources(sub.dir(), "Medication").unwrap();
    assert_eq!(medications.len(), 1);
    assert_eq!(medications[0]["id"], "med1");

    // The new Medication page is pooled to the workspace top level.
    assert!(dir.path().join("Medication.001.ndjson").is_symlink());
}
