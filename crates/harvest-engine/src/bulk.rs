//! Client-side FHIR Bulk Data Access export.
//!
//! Kickoff, polling, manifest interpretation, and parallel file download,
//! with resume state persisted in `metadata.json` so an interrupted run
//! picks up where it left off. See
//! <https://hl7.org/fhir/uv/bulkdata/export.html>.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use harvest_client::capabilities;
use harvest_client::retry::parse_retry_after;
use harvest_client::{ensure_success, FhirClient, RequestOptions};
use harvest_core::time::{now_utc, parse_lenient};
use harvest_core::FhirDateTime;
use harvest_store::ndjson;
use harvest_store::{BulkState, EventLog, ExportMetadata, NdjsonFileWriter, RawPageWriter, SubExport};

use crate::error::{EngineError, Result};
use crate::filters::Filters;
use crate::scheduler::Supervisor;

/// Tunables for the bulk state machine.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Export a FHIR Group instead of the whole system.
    pub group: Option<String>,
    /// Poll delay when the server sends no `Retry-After`.
    pub poll_default_delay: Duration,
    /// Floor for poll delays (a 202 with no delay still waits this long).
    pub poll_min_delay: Duration,
    /// Some servers ask for hours; cap what we will actually wait.
    pub poll_max_delay: Duration,
    /// Give up polling after this much accumulated waiting. EHR exports
    /// have been observed to take weeks, so the default is generous.
    pub total_wait_cap: Duration,
    /// Per-file download timeout.
    pub download_timeout: Duration,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            group: None,
            poll_default_delay: Duration::from_secs(60),
            poll_min_delay: Duration::from_secs(1),
            poll_max_delay: Duration::from_secs(300),
            total_wait_cap: Duration::from_secs(60 * 60 * 24 * 30),
            download_timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct BulkOutcome {
    pub transaction_time: FhirDateTime,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "transactionTime")]
    transaction_time: Option<String>,
    #[serde(default)]
    output: Vec<ManifestFile>,
    #[serde(default)]
    deleted: Vec<ManifestFile>,
    #[serde(default)]
    error: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    #[serde(rename = "type")]
    resource_type: String,
    url: String,
    #[serde(default)]
    #[allow(dead_code)]
    count: Option<u64>,
}

/// Run (or resume) a bulk export into the sub-export directory.
///
/// On success every requested type is marked done with the manifest's
/// transaction time. Resume state lives in `metadata.bulk_state`: the
/// status URL from kickoff plus the decompressed size of every finished
/// download.
pub async fn run_bulk(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    filters: &Filters,
    options: &BulkOptions,
) -> Result<BulkOutcome> {
    let mut log = EventLog::new(sub.dir());

    let resuming = metadata
        .bulk_state
        .as_ref()
        .and_then(|state| state.status_url.clone());

    let mut res_types = filters.type_names();
    if resuming.is_none() {
        res_types.retain(|res_type| {
            if metadata.is_done(res_type) {
                tracing::info!(resource_type = %res_type, "Skipping, already done");
                false
            } else {
                true
            }
        });
    }
    if res_types.is_empty() {
        return Ok(BulkOutcome {
            transaction_time: now_utc(),
        });
    }

    let status_url = match resuming {
        Some(url) => {
            tracing::info!("Resuming bulk FHIR export");
            log.set_export_id(url.clone());
            url
        }
        None => {
            tracing::info!("Starting bulk FHIR export");
            kickoff(client, sub, metadata, filters, options, &mut log, &res_types).await?
        }
    };

    let manifest = poll_status(client, supervisor, &log, &status_url, options).await?;

    let transaction_time = manifest
        .transaction_time
        .as_deref()
        .and_then(parse_lenient)
        .unwrap_or_else(|| {
            tracing::error!(
                value = ?manifest.transaction_time,
                "Could not parse manifest transactionTime, using now"
            );
            now_utc()
        });

    log.event(
        "status_complete",
        json!({"transactionTime": manifest.transaction_time}),
    )?;
    log.event(
        "status_page_complete",
        json!({
            "transactionTime": manifest.transaction_time,
            "outputFileCount": manifest.output.len(),
            "deletedFileCount": manifest.deleted.len(),
            "errorFileCount": manifest.error.len(),
        }),
    )?;
    log.event(
        "manifest_complete",
        json!({
            "transactionTime": manifest.transaction_time,
            "totalOutputFileCount": manifest.output.len(),
            "totalDeletedFileCount": manifest.deleted.len(),
            "totalErrorFileCount": manifest.error.len(),
            "totalManifests": 1,
        }),
    )?;

    tracing::info!(
        files = manifest.output.len(),
        "Bulk FHIR export finished, downloading resources"
    );

    let totals = download_all(client, supervisor, sub, metadata, &log, &manifest, options).await?;
    process_deleted(client, sub, metadata, &log, &manifest, options).await?;

    log.event(
        "export_complete",
        json!({
            "files": totals.files,
            "resources": totals.resources,
            "bytes": totals.bytes,
            "attachments": Value::Null,
            "duration": 0,
        }),
    )?;

    // Tell the server it can drop the export. Some servers (Epic at
    // least) only allow one export per client/group combo, so this is
    // more than courtesy, but a failure here must not fail the run.
    match client.request(Method::DELETE, &status_url).await {
        Ok(response) if response.status().is_success() || response.status().as_u16() == 202 => {}
        Ok(response) => {
            tracing::warn!(status = %response.status(), "Failed to clean up export job on the server side");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to clean up export job on the server side");
        }
    }

    metadata.bulk_state = None;
    for res_type in &res_types {
        metadata.mark_done(res_type, transaction_time.clone());
    }
    sub.save_metadata(metadata)?;

    // The server may have attached OperationOutcome files with issues it
    // hit. Everything is already downloaded and cleaned up, so humans can
    // inspect what we got; only now do fatal issues fail the run.
    let (fatal, info) = gather_error_messages(sub)?;
    for message in &info {
        tracing::warn!(message = %message, "Message from server");
    }
    if !fatal.is_empty() {
        let joined: Vec<String> = fatal.into_iter().collect();
        return Err(EngineError::ExportFailed(format!(
            "server reported errors during export: {}",
            joined.join("; ")
        )));
    }

    Ok(BulkOutcome { transaction_time })
}

/// Cancel an in-flight export (DELETE on the saved status URL).
pub async fn cancel_bulk(client: &FhirClient, metadata: &mut ExportMetadata) -> Result<()> {
    let Some(url) = metadata
        .bulk_state
        .as_ref()
        .and_then(|state| state.status_url.clone())
    else {
        return Ok(());
    };
    let response = client.request(Method::DELETE, &url).await?;
    ensure_success(response).await?;
    metadata.bulk_state = None;
    Ok(())
}

async fn kickoff(
    client: &FhirClient,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    filters: &Filters,
    options: &BulkOptions,
    log: &mut EventLog,
    res_types: &[String],
) -> Result<String> {
    let url = kickoff_url(
        client.base_url(),
        options.group.as_deref(),
        res_types,
        &filters.bulk_type_filters(),
        filters.bulk_since().as_deref(),
    );

    let caps = client.capabilities().await.ok();
    let (software_name, software_version, software_release) = caps
        .map(capabilities::software_info)
        .unwrap_or((None, None, None));
    let fhir_version = caps
        .and_then(|caps| caps.get("fhirVersion"))
        .cloned()
        .unwrap_or(Value::Null);

    let kickoff_detail = |error_code: Option<u16>, error_body: Option<String>| {
        json!({
            "exportUrl": url,
            "softwareName": software_name,
            "softwareVersion": software_version,
            "softwareReleaseDate": software_release,
            "fhirVersion": fhir_version,
            "errorCode": error_code,
            "errorBody": error_body,
        })
    };

    let request_options =
        RequestOptions::accept("application/fhir+json").with_header("Prefer", "respond-async");
    let response = match client.send(Method::POST, &url, &request_options).await {
        Ok(response) => response,
        Err(err) => {
            log.event("kickoff", kickoff_detail(None, Some(err.to_string())))?;
            return Err(err.into());
        }
    };

    let status = response.status();
    if status.as_u16() != 202 {
        let body = response.text().await.unwrap_or_default();
        log.event("kickoff", kickoff_detail(Some(status.as_u16()), Some(body.clone())))?;
        return Err(EngineError::ExportFailed(format!(
            "kickoff returned HTTP {status} instead of 202: {body}"
        )));
    }

    let poll_url = response
        .headers()
        .get("Content-Location")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::ExportFailed("kickoff response had no Content-Location header".into())
        })?;

    log.set_export_id(poll_url.clone());
    log.event("kickoff", kickoff_detail(None, None))?;

    let downloaded = metadata
        .bulk_state
        .take()
        .map(|state| state.downloaded)
        .unwrap_or_default();
    metadata.bulk_state = Some(BulkState {
        status_url: Some(poll_url.clone()),
        downloaded,
    });
    sub.save_metadata(metadata)?;

    Ok(poll_url)
}

/// Build the `$export` kickoff URL with `_type`, `_typeFilter`, `_since`,
/// and `_outputFormat`.
///
/// Repeated query params are condensed into comma-delimited ones (the
/// spec prefers repetition, but not every EHR accepts it), and each
/// `_typeFilter` entry is form-encoded so its internal commas stay
/// distinct from the separating ones.
pub fn kickoff_url(
    base_url: &str,
    group: Option<&str>,
    res_types: &[String],
    type_filters: &BTreeMap<String, BTreeSet<String>>,
    since: Option<&str>,
) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();
    if let Some(group) = group {
        url.push_str("/Group/");
        url.push_str(group);
    }
    url.push_str("/$export");

    let mut sorted_types = res_types.to_vec();
    sorted_types.sort();
    sorted_types.dedup();

    let mut query = vec![format!("_type={}", sorted_types.join(","))];

    let combined: Vec<String> = type_filters
        .iter()
        .filter(|(res_type, _)| sorted_types.contains(res_type))
        .flat_map(|(res_type, entries)| {
            entries
                .iter()
                .map(move |entry| form_encode(&format!("{res_type}?{entry}")))
        })
        .collect();
    if !combined.is_empty() {
        query.push(format!("_typeFilter={}", combined.join(",")));
    }

    if let Some(since) = since {
        query.push(format!("_since={}", form_encode(since)));
    }
    query.push("_outputFormat=application%2Ffhir%2Bndjson".to_string());

    format!("{url}?{}", query.join("&"))
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn poll_status(
    client: &FhirClient,
    supervisor: &Supervisor,
    log: &EventLog,
    status_url: &str,
    options: &BulkOptions,
) -> Result<Manifest> {
    let mut total_wait = Duration::ZERO;

    loop {
        supervisor.checkpoint()?;

        let response = match client
            .send(Method::GET, status_url, &RequestOptions::accept("application/json"))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log.event("status_error", json!({"message": err.to_string()}))?;
                return Err(err.into());
            }
        };

        match response.status().as_u16() {
            200 => {
                let manifest: Manifest = response.json().await.map_err(|err| {
                    EngineError::ExportFailed(format!("malformed status manifest: {err}"))
                })?;
                return Ok(manifest);
            }
            202 => {
                let progress = response
                    .headers()
                    .get("X-Progress")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("waiting");
                let delay = parse_retry_after(&response)
                    .unwrap_or(options.poll_default_delay)
                    .clamp(options.poll_min_delay, options.poll_max_delay);
                total_wait += delay;
                if total_wait > options.total_wait_cap {
                    log.event("status_error", json!({"message": "timed out"}))?;
                    return Err(EngineError::ExportFailed(
                        "timed out waiting for the bulk FHIR export to finish".into(),
                    ));
                }
                tracing::info!(progress = %progress, delay = ?delay, "Export still in progress");
                tokio::time::sleep(delay).await;
            }
            410 => {
                log.event(
                    "status_error",
                    json!({"code": 410, "message": "export expired"}),
                )?;
                return Err(EngineError::ExportFailed(
                    "the export expired on the server (HTTP 410); start a new run".into(),
                ));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                log.event("status_error", json!({"code": status, "body": body}))?;
                return Err(EngineError::ExportFailed(format!(
                    "unexpected status code {status} from the bulk status endpoint"
                )));
            }
        }
    }
}

#[derive(Default)]
struct DownloadTotals {
    files: u64,
    resources: u64,
    bytes: u64,
}

struct DownloadJob {
    url: String,
    resource_type: String,
    dest: std::path::PathBuf,
    item_type: &'static str,
}

async fn download_all(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    log: &EventLog,
    manifest: &Manifest,
    options: &BulkOptions,
) -> Result<DownloadTotals> {
    let compress = metadata.params.compression;
    let recorded = metadata
        .bulk_state
        .as_ref()
        .map(|state| state.downloaded.clone())
        .unwrap_or_default();

    let mut jobs = Vec::new();
    let mut skipped = DownloadTotals::default();

    let mut counters: BTreeMap<(String, &'static str), u32> = BTreeMap::new();
    for (files, item_type, dir) in [
        (&manifest.output, "output", sub.dir().to_path_buf()),
        (&manifest.error, "error", sub.error_dir()),
    ] {
        for file in files.iter() {
            let counter = counters
                .entry((file.resource_type.clone(), item_type))
                .or_insert(0);
            *counter += 1;
            let dest = dir.join(ndjson::page_filename(&file.resource_type, *counter, compress));

            // Already-downloaded files whose recorded size matches are
            // skipped; anything else is redone from scratch.
            if let Some(expected) = recorded.get(&file.url) {
                if dest.exists() && ndjson::decompressed_size(&dest)? == *expected {
                    tracing::info!(file = %dest.display(), "Already downloaded, skipping");
                    skipped.files += 1;
                    skipped.bytes += *expected;
                    skipped.resources += ndjson::line_count(&dest)?;
                    continue;
                }
            }

            jobs.push(DownloadJob {
                url: file.url.clone(),
                resource_type: file.resource_type.clone(),
                dest,
                item_type,
            });
        }
    }

    let semaphore = supervisor.bulk_downloads();
    let results: Vec<Result<(String, u64, u64)>> = futures_util::stream::iter(jobs)
        .map(|job| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Cancelled)?;
                supervisor.checkpoint()?;
                download_one(client, log, &job, options).await
            }
        })
        .buffer_unordered(supervisor.budgets().bulk_download.max(1))
        .collect()
        .await;

    // Record every finished file even if a sibling failed, so the next
    // run resumes instead of refetching.
    let mut totals = skipped;
    let mut first_error = None;
    {
        let state = metadata.bulk_state.get_or_insert_with(BulkState::default);
        for result in results {
            match result {
                Ok((url, size, lines)) => {
                    state.downloaded.insert(url, size);
                    totals.files += 1;
                    totals.bytes += size;
                    totals.resources += lines;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
    }
    sub.save_metadata(metadata)?;

    match first_error {
        Some(err) => Err(err),
        None => Ok(totals),
    }
}

async fn download_one(
    client: &FhirClient,
    log: &EventLog,
    job: &DownloadJob,
    options: &BulkOptions,
) -> Result<(String, u64, u64)> {
    log.event(
        "download_request",
        json!({
            "fileUrl": job.url,
            "itemType": job.item_type,
            "resourceType": job.resource_type,
        }),
    )?;

    let request_options = RequestOptions::accept("application/fhir+ndjson")
        .with_timeout(options.download_timeout);
    let response = client.send(Method::GET, &job.url, &request_options).await;
    let response = match response {
        Ok(response) => ensure_success(response).await,
        Err(err) => Err(err),
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            log.event(
                "download_error",
                json!({"fileUrl": job.url, "message": err.to_string()}),
            )?;
            return Err(err.into());
        }
    };

    let mut writer = RawPageWriter::create(&job.dest)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                log.event(
                    "download_error",
                    json!({"fileUrl": job.url, "message": err.to_string()}),
                )?;
                return Err(EngineError::Client(err.into()));
            }
        };
        writer.write(&chunk)?;
    }
    let size = writer.finish()?;
    let lines = ndjson::line_count(&job.dest)?;

    log.event(
        "download_complete",
        json!({"fileUrl": job.url, "resourceCount": lines, "fileSize": size}),
    )?;
    tracing::info!(file = %job.dest.display(), bytes = size, "Downloaded");

    Ok((job.url.clone(), size, lines))
}

/// Fetch the manifest's `deleted[]` Bundles and write the deletion
/// identifiers to `deleted/<Type>.ndjson`, one DELETE Bundle per line so
/// the count of deletions is just the line count.
async fn process_deleted(
    client: &FhirClient,
    sub: &SubExport,
    metadata: &ExportMetadata,
    log: &EventLog,
    manifest: &Manifest,
    options: &BulkOptions,
) -> Result<()> {
    if manifest.deleted.is_empty() {
        return Ok(());
    }

    let mut by_type: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for file in &manifest.deleted {
        log.event(
            "download_request",
            json!({"fileUrl": file.url, "itemType": "deleted", "resourceType": file.resource_type}),
        )?;
        let request_options = RequestOptions::accept("application/fhir+ndjson")
            .with_timeout(options.download_timeout);
        let response = client.send(Method::GET, &file.url, &request_options).await?;
        let response = ensure_success(response).await?;
        let body = response.text().await.map_err(harvest_client::ClientError::from)?;

        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let bundle: Value = match serde_json::from_str(line) {
                Ok(bundle) => bundle,
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping malformed deleted-bundle line");
                    continue;
                }
            };
            for entry in bundle
                .get("entry")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let request = entry.get("request");
                let method = request
                    .and_then(|r| r.get("method"))
                    .and_then(Value::as_str);
                let url = request.and_then(|r| r.get("url")).and_then(Value::as_str);
                if method != Some("DELETE") {
                    continue;
                }
                if let Some((res_type, id)) = url.and_then(|u| u.split_once('/')) {
                    by_type
                        .entry(res_type.to_string())
                        .or_default()
                        .insert(id.to_string());
                }
            }
        }
    }

    let suffix = if metadata.params.compression { ".gz" } else { "" };
    for (res_type, ids) in by_type {
        let path = sub
            .deleted_dir()
            .join(format!("{res_type}.ndjson{suffix}"));
        let mut writer = NdjsonFileWriter::create(path, false);
        for id in ids {
            writer.write(&json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "entry": [{"request": {"method": "DELETE", "url": format!("{res_type}/{id}")}}],
            }))?;
        }
        writer.finish()?;
    }
    Ok(())
}

/// Parse the error-manifest OperationOutcomes the server attached.
/// Returns `(fatal, informational)` message sets.
fn gather_error_messages(sub: &SubExport) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut fatal = BTreeSet::new();
    let mut info = BTreeSet::new();

    for outcome in ndjson::collect_resources(&sub.error_dir(), "OperationOutcome")? {
        for issue in outcome
            .get("issue")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let text = issue
                .get("diagnostics")
                .and_then(Value::as_str)
                .or_else(|| {
                    issue
                        .get("details")
                        .and_then(|details| details.get("text"))
                        .and_then(Value::as_str)
                })
                // code is required, so there is always something
                .or_else(|| issue.get("code").and_then(Value::as_str))
                .unwrap_or("unknown issue");
            let severity = issue.get("severity").and_then(Value::as_str);
            if matches!(severity, Some("fatal") | Some("error")) {
                fatal.insert(text.to_string());
            } else {
                info.insert(text.to_string());
            }
        }
    }

    Ok((fatal, info))
}
