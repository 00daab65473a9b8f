//! End-to-end engine behavior against a mock FHIR server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harvest_client::{ClientConfig, FhirClient, RetryPolicy};
use harvest_engine::{
    perform_export, Budgets, EngineError, ExportMode, ExportRequest, Supervisor,
};
use harvest_store::{ndjson, Workspace};

fn capability_statement() -> Value {
    let types = [
        "Patient",
        "Condition",
        "Observation",
        "DiagnosticReport",
        "DocumentReference",
        "MedicationRequest",
        "Medication",
        "Encounter",
    ];
    let resources: Vec<Value> = types
        .iter()
        .map(|res_type| {
            json!({
                "type": res_type,
                "searchParam": [{"name": "_lastUpdated"}, {"name": "identifier"}],
            })
        })
        .collect();
    json!({
        "resourceType": "CapabilityStatement",
        "fhirVersion": "4.0.1",
        "software": {"name": "Mock EHR", "version": "1.0"},
        "rest": [{"mode": "server", "resource": resources}],
    })
}

async fn mount_metadata(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(capability_statement()))
        .mount(server)
        .await;
}

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

fn fast_bulk_request(workspace: &std::path::Path, server: &MockServer) -> ExportRequest {
    let mut request = ExportRequest::new(workspace, server.uri());
    request.bulk_options.poll_min_delay = Duration::ZERO;
    request.bulk_options.poll_default_delay = Duration::from_millis(10);
    request
}

#[tokio::test]
async fn bulk_group_export_end_to_end() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    Mock::given(method("POST"))
        .and(path("/Group/G1/$export"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Content-Location", format!("{}/poll/1", server.uri()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(202).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactionTime": "2024-07-01T00:00:00Z",
            "request": format!("{}/Group/G1/$export", server.uri()),
            "requiresAccessToken": false,
            "output": [
                {"type": "Patient", "url": format!("{}/files/patients", server.uri()), "count": 2},
                {"type": "Condition", "url": format!("{}/files/conditions", server.uri()), "count": 2},
            ],
            "error": [],
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/patients"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"resourceType\":\"Patient\",\"id\":\"p1\"}\n{\"resourceType\":\"Patient\",\"id\":\"p2\"}\n",
            "application/fhir+ndjson",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/conditions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"resourceType\":\"Condition\",\"id\":\"c1\"}\n{\"resourceType\":\"Condition\",\"id\":\"c2\"}\n",
            "application/fhir+ndjson",
        ))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&server).await;
    let supervisor = supervisor();

    let mut request = fast_bulk_request(dir.path(), &server);
    request.types = Some(vec!["Patient".to_string(), "Condition".to_string()]);
    request.group = Some("G1".to_string());

    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);
    assert_eq!(summary.mode, harvest_store::ExportMode::Bulk);

    // The sub-export holds one gzip page per manifest file.
    let workspace = Workspace::open(dir.path()).unwrap();
    let (sub, metadata) = workspace.latest_complete().unwrap().unwrap();
    assert_eq!(sub.index(), 1);
    assert_eq!(
        ndjson::line_count(&sub.dir().join("Condition.001.ndjson.gz")).unwrap(),
        2
    );
    assert_eq!(
        metadata.transaction_times["Condition"].to_string(),
        "2024-07-01T00:00:00Z"
    );
    assert_eq!(
        metadata.transaction_times["Patient"].to_string(),
        "2024-07-01T00:00:00Z"
    );
    assert!(metadata.bulk_state.is_none());
    assert_eq!(metadata.cohort.as_ref().unwrap().count, 2);

    // Top-level symlinks resolve into the sub-export.
    let link = dir.path().join("Condition.001.ndjson.gz");
    assert!(link.is_symlink());
    assert_eq!(ndjson::line_count(&link).unwrap(), 2);

    // The bulk event log recorded the lifecycle.
    let events: Vec<Value> = ndjson::read_file(&sub.dir().join("log.ndjson"))
        .unwrap()
        .map(|r| r.unwrap().1)
        .collect();
    let ids: Vec<&str> = events
        .iter()
        .map(|event| event["eventId"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"kickoff"));
    assert!(ids.contains(&"status_complete"));
    assert!(ids.contains(&"download_complete"));
    assert!(ids.contains(&"export_complete"));
}

#[tokio::test]
async fn bulk_resume_skips_verified_downloads() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    // No kickoff mock: resuming must not kick off again.
    Mock::given(method("GET"))
        .and(path("/poll/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactionTime": "2024-07-02T00:00:00Z",
            "output": [
                {"type": "Patient", "url": format!("{}/files/a", server.uri())},
                {"type": "Patient", "url": format!("{}/files/b", server.uri())},
            ],
        })))
        .mount(&server)
        .await;

    let body_a = "{\"resourceType\":\"Patient\",\"id\":\"p1\"}\n";
    Mock::given(method("GET"))
        .and(path("/files/a"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body_a, "application/fhir+ndjson"))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"resourceType\":\"Patient\",\"id\":\"p2\"}\n",
            "application/fhir+ndjson",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/poll/9"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();

    // Seed an in-progress sub-export that already fetched file a.
    {
        let workspace = Workspace::open(dir.path()).unwrap();
        let params = harvest_store::ExportParams {
            fhir_url: server.uri(),
            types: vec!["Patient".to_string()],
            type_filters: vec![],
            since: None,
            since_mode: None,
            mode: harvest_store::ExportMode::Bulk,
            nickname: None,
            compression: true,
            group: None,
        };
        let (sub, mut metadata) = workspace.open_subexport(&params).unwrap();
        let mut writer =
            harvest_store::RawPageWriter::create(sub.dir().join("Patient.001.ndjson.gz")).unwrap();
        writer.write(body_a.as_bytes()).unwrap();
        let size = writer.finish().unwrap();

        let mut state = harvest_store::BulkState::default();
        state.status_url = Some(format!("{}/poll/9", server.uri()));
        state.downloaded.insert(format!("{}/files/a", server.uri()), size);
        metadata.bulk_state = Some(state);
        sub.save_metadata(&metadata).unwrap();
    }

    let client = client_for(&server).await;
    let supervisor = supervisor();
    let mut request = fast_bulk_request(dir.path(), &server);
    request.types = Some(vec!["Patient".to_string()]);
    request.mode = ExportMode::Bulk;

    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);

    let workspace = Workspace::open(dir.path()).unwrap();
    let (sub, metadata) = workspace.latest_complete().unwrap().unwrap();
    assert_eq!(sub.index(), 1);
    assert!(metadata.bulk_state.is_none());
    assert_eq!(
        ndjson::line_count(&sub.dir().join("Patient.001.ndjson.gz")).unwrap(),
        1
    );
    assert_eq!(
        ndjson::line_count(&sub.dir().join("Patient.002.ndjson.gz")).unwrap(),
        1
    );
}

#[tokio::test]
async fn crawl_with_identifier_cohort() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    // Identifier resolution: one MRN maps to Patient/123.
    Mock::given(method("GET"))
        .and(path("/Patient"))
        .and(query_param("identifier", "uri:oid:1.2.3.4|abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [{"resource": {
                "resourceType": "Patient",
                "id": "123",
                "meta": {"lastUpdated": "2024-05-01T00:00:00Z"},
            }}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Condition search pages twice.
    Mock::given(method("GET"))
        .and(path("/Condition"))
        .and(query_param("patient", "123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "link": [{"relation": "next", "url": format!("{}/Condition-page2", server.uri())}],
            "entry": [{"resource": {
                "resourceType": "Condition",
                "id": "c1",
                "meta": {"lastUpdated": "2024-04-01T00:00:00Z"},
            }}],
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Condition-page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                {"resource": {"resourceType": "Condition", "id": "c2"}},
                // duplicate of page 1; dedup drops it
                {"resource": {"resourceType": "Condition", "id": "c1"}},
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&server).await;
    let supervisor = supervisor();

    let mut request = ExportRequest::new(dir.path(), server.uri());
    request.types = Some(vec!["Patient".to_string(), "Condition".to_string()]);
    request.id_list = Some("abc".to_string());
    request.id_system = Some("uri:oid:1.2.3.4".to_string());

    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);
    assert_eq!(summary.mode, harvest_store::ExportMode::Crawl);
    assert_eq!(summary.cohort_size, Some(1));

    let workspace = Workspace::open(dir.path()).unwrap();
    let (sub, metadata) = workspace.latest_complete().unwrap().unwrap();

    let conditions = ndjson::collect_resources(sub.dir(), "Condition").unwrap();
    let mut ids: Vec<&str> = conditions
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["c1", "c2"]);

    let patients = ndjson::collect_resources(sub.dir(), "Patient").unwrap();
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0]["id"], "123");

    // Per-type transaction times recorded; the crawl clamps them to the
    // walk start, so the stale server dates come through unchanged.
    assert_eq!(
        metadata.transaction_times["Patient"].to_string(),
        "2024-05-01T00:00:00Z"
    );
    assert_eq!(
        metadata.transaction_times["Condition"].to_string(),
        "2024-04-01T00:00:00Z"
    );
    assert_eq!(metadata.failures, 0);

    // The synthetic bulk log makes the folder readable by bulk tooling.
    let events: Vec<Value> = ndjson::read_file(&sub.dir().join("log.ndjson"))
        .unwrap()
        .map(|r| r.unwrap().1)
        .collect();
    assert!(events
        .iter()
        .any(|event| event["eventId"] == "status_complete"));
    drop(workspace);

    // Re-running the identical export touches nothing: every data mock
    // above carries expect(1) and the server verifies on drop.
    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);
    let workspace = Workspace::open(dir.path()).unwrap();
    assert_eq!(workspace.subexports().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_cohort_completes_cleanly() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&server).await;
    let supervisor = supervisor();

    let mut request = ExportRequest::new(dir.path(), server.uri());
    request.types = Some(vec!["Patient".to_string(), "Condition".to_string()]);
    request.id_list = Some("".to_string());

    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);
    assert_eq!(summary.cohort_size, Some(0));

    let workspace = Workspace::open(dir.path()).unwrap();
    let (sub, metadata) = workspace.latest_complete().unwrap().unwrap();
    assert!(metadata.is_done("Patient"));
    assert!(metadata.is_done("Condition"));
    assert!(ndjson::list_resource_files(sub.dir(), "Patient")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn since_auto_uses_prior_transaction_times() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    Mock::given(method("GET"))
        .and(path("/Patient"))
        .and(query_param("identifier", "sys|abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [{"resource": {"resourceType": "Patient", "id": "123"}}],
        })))
        .mount(&server)
        .await;
    // Only matches the first, unfiltered crawl; it expires so the
    // since-filtered mock below can match the second run.
    Mock::given(method("GET"))
        .and(path("/Condition"))
        .and(query_param("patient", "123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&server).await;
    let supervisor = supervisor();

    // First: a full export.
    let mut request = ExportRequest::new(dir.path(), server.uri());
    request.types = Some(vec!["Patient".to_string(), "Condition".to_string()]);
    request.id_list = Some("abc".to_string());
    request.id_system = Some("sys".to_string());
    perform_export(&client, &supervisor, &request).await.unwrap();

    let workspace = Workspace::open(dir.path()).unwrap();
    let (_, metadata) = workspace.latest_complete().unwrap().unwrap();
    let condition_time = metadata.transaction_times["Condition"].to_string();
    drop(workspace);

    // Second: --since=auto must filter Conditions by that stamp.
    Mock::given(method("GET"))
        .and(path("/Condition"))
        .and(query_param("patient", "123"))
        .and(query_param("_lastUpdated", format!("gt{condition_time}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = request.clone();
    request.since = Some("auto".to_string());
    let summary = perform_export(&client, &supervisor, &request).await.unwrap();
    assert!(summary.complete);

    let workspace = Workspace::open(dir.path()).unwrap();
    assert_eq!(workspace.subexports().unwrap().len(), 2);
}

#[tokio::test]
async fn since_auto_without_prior_export_is_a_config_error() {
    let server = MockServer::start().await;
    mount_metadata(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&server).await;
    let supervisor = supervisor();

    let mut request = ExportRequest::new(dir.path(), server.uri());
    request.types = Some(vec!["Condition".to_string()]);
    request.id_list = Some("p1".to_string());
    request.since = Some("auto".to_string());

    let err = perform_export(&client, &supervisor, &request)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert_eq!(err.exit_code(), 1);
}
