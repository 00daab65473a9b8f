//! The crawl engine: a client-driven alternative to bulk export that fans
//! out per-patient searches.
//!
//! Concurrency model: up to `crawl_patients` patients in flight, each
//! running up to `crawl_types` resource-type queries at once. Every
//! resource type has a single writer task that owns its NDJSON pages and
//! its dedup set; query tasks just send resources down a channel.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use harvest_client::paging::entry_resources;
use harvest_client::{BundlePages, FhirClient};
use harvest_core::time::now_utc;
use harvest_core::{resource, FhirDateTime, ResourceType};
use harvest_store::{EventLog, ExportMetadata, SubExport};

use crate::cohort::{clamp_to_start, observe_dates, Cohort};
use crate::error::{EngineError, Result};
use crate::filters::Filters;
use crate::scheduler::Supervisor;

pub struct CrawlOutcome {
    /// Queries that failed after the client's whole retry budget.
    pub failures: u64,
}

struct TypeStats {
    count: u64,
    latest: Option<FhirDateTime>,
}

/// Crawl every `(patient, resource type)` pair of the cohort into the
/// sub-export. Patient itself is handled by cohort resolution.
pub async fn run_crawl(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    filters: &Filters,
    cohort: &Cohort,
    group_name: Option<&str>,
) -> Result<CrawlOutcome> {
    let compress = metadata.params.compression;
    let walk_start = now_utc();

    let mut pending: Vec<String> = Vec::new();
    for res_type in filters.types() {
        if *res_type == ResourceType::Patient {
            continue;
        }
        let name = res_type.to_string();
        if metadata.is_done(&name) {
            tracing::info!(resource_type = %name, "Skipping, already done");
            continue;
        }
        // An interrupted type is redone from scratch so the sub-export
        // never holds duplicates.
        sub.remove_pages(&name)?;
        pending.push(name);
    }

    let log = EventLog::new(sub.dir());
    let failures = AtomicU64::new(0);

    if !pending.is_empty() && !cohort.ids.is_empty() {
        let mut senders = BTreeMap::new();
        let mut handles = Vec::new();

        for res_type in &pending {
            let (tx, mut rx) = mpsc::channel::<Value>(256);
            let mut writer = sub.writer(res_type, compress)?;
            let expected_type = res_type.clone();
            let handle = tokio::spawn(async move {
                let mut seen: HashSet<String> = HashSet::new();
                let mut latest: Option<FhirDateTime> = None;
                while let Some(value) = rx.recv().await {
                    // Servers sometimes attach extra resources (think
                    // _include); each file holds only its own type.
                    if resource::resource_type(&value) != Some(expected_type.as_str()) {
                        continue;
                    }
                    let Some(id) = resource::resource_id(&value) else {
                        continue;
                    };
                    if !seen.insert(id.to_string()) {
                        continue;
                    }
                    observe_dates(&value, &mut latest);
                    writer.append(&value)?;
                }
                let count = writer.count();
                writer.finish()?;
                Ok::<TypeStats, harvest_store::StoreError>(TypeStats { count, latest })
            });
            senders.insert(res_type.clone(), tx);
            handles.push((res_type.clone(), handle));
        }

        let budgets = supervisor.budgets();
        {
            let senders = &senders;
            let failures = &failures;
            let log = &log;
            let pending = &pending;
            futures_util::stream::iter(cohort.ids.iter())
                .for_each_concurrent(budgets.crawl_patients.max(1), |patient| async move {
                    let is_new = cohort.new.contains(patient);
                    let queries = patient_queries(filters, pending, patient, is_new);
                    futures_util::stream::iter(queries)
                        .for_each_concurrent(budgets.crawl_types.max(1), |(res_type, url)| {
                            async move {
                                if supervisor.is_cancelled() {
                                    return;
                                }
                                let sender = &senders[&res_type];
                                if let Err(err) =
                                    crawl_query(client, supervisor, sender, &url).await
                                {
                                    failures.fetch_add(1, Ordering::Relaxed);
                                    tracing::warn!(
                                        resource_type = %res_type,
                                        patient_id = %patient,
                                        url = %url,
                                        error = %err,
                                        "Query failed after retries, continuing"
                                    );
                                    let _ = log.event(
                                        "crawl_query_error",
                                        json!({
                                            "phase": "crawl",
                                            "resourceType": res_type,
                                            "patientId": patient,
                                            "url": url,
                                            "error": err.to_string(),
                                        }),
                                    );
                                }
                            }
                        })
                        .await;
                })
                .await;
        }

        drop(senders);
        for (res_type, handle) in handles {
            let stats = handle
                .await
                .map_err(|err| EngineError::ExportFailed(format!("writer task died: {err}")))??;
            tracing::info!(resource_type = %res_type, count = stats.count, "Crawled");
            if !supervisor.is_cancelled() {
                metadata.mark_done(&res_type, clamp_to_start(stats.latest, walk_start.clone()));
            }
        }
    } else if !pending.is_empty() {
        // Empty cohort: every pending type completes with zero results.
        for res_type in &pending {
            metadata.mark_done(res_type, walk_start.clone());
        }
    }

    metadata.failures = failures.load(Ordering::Relaxed);
    sub.save_metadata(metadata)?;
    supervisor.checkpoint()?;

    write_synthetic_log(client, sub, metadata, group_name)?;

    Ok(CrawlOutcome {
        failures: metadata.failures,
    })
}

/// The query URLs for one patient: one per (pending type, filter
/// variant). New patients are fetched without the since filter so their
/// history comes along.
fn patient_queries(
    filters: &Filters,
    pending: &[String],
    patient: &str,
    is_new: bool,
) -> Vec<(String, String)> {
    let mut queries = Vec::new();
    for res_type in pending {
        for variant in filters.search_variants(res_type, !is_new) {
            let url = if variant.is_empty() {
                format!("{res_type}?patient={patient}")
            } else {
                format!("{res_type}?patient={patient}&{variant}")
            };
            queries.push((res_type.clone(), url));
        }
    }
    queries
}

/// Walk one search to completion, streaming entries to the type writer.
async fn crawl_query(
    client: &FhirClient,
    supervisor: &Supervisor,
    sender: &mpsc::Sender<Value>,
    url: &str,
) -> Result<()> {
    let mut pages = BundlePages::new(client, client.absolute_url(url));
    while let Some(bundle) = pages.next_page().await? {
        supervisor.checkpoint()?;
        for entry in entry_resources(&bundle) {
            if resource::resource_type(entry) == Some("OperationOutcome") {
                return Err(EngineError::ExportFailed(format!(
                    "server returned an OperationOutcome for {url}"
                )));
            }
            if sender.send(entry.clone()).await.is_err() {
                // Writer gone; cancellation is in progress.
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Leave a bulk-shaped `log.ndjson` behind so tooling that reads bulk
/// export logs can treat a crawl folder the same way.
fn write_synthetic_log(
    client: &FhirClient,
    sub: &SubExport,
    metadata: &ExportMetadata,
    group_name: Option<&str>,
) -> Result<()> {
    let Some(earliest) = metadata.earliest_transaction_time() else {
        return Ok(());
    };

    let export_url = match group_name {
        Some(group) => format!("{}/Group/{}/$export", client.base_url(), group),
        None => format!("{}/$export", client.base_url()),
    };

    let mut log = EventLog::new(sub.dir());
    log.set_export_id("synthetic");
    log.event("kickoff", json!({"exportUrl": export_url}))?;
    log.event(
        "status_complete",
        json!({"transactionTime": earliest.to_string()}),
    )?;
    log.event(
        "export_complete",
        json!({
            "files": Value::Null,
            "resources": Value::Null,
            "bytes": Value::Null,
            "attachments": Value::Null,
            "duration": 0,
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::SinceModeArg;
    use std::str::FromStr;

    fn filters_for(since: Option<&str>) -> Filters {
        Filters::new(
            vec![
                ResourceType::from_str("Condition").unwrap(),
                ResourceType::from_str("Observation").unwrap(),
            ],
            &[],
            since.map(str::to_string),
            SinceModeArg::Updated,
            true,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_patient_queries_basic() {
        let filters = filters_for(None);
        let pending = vec!["Condition".to_string()];
        let queries = patient_queries(&filters, &pending, "p1", false);
        assert_eq!(
            queries,
            vec![("Condition".to_string(), "Condition?patient=p1".to_string())]
        );
    }

    #[test]
    fn test_patient_queries_with_since_and_defaults() {
        let filters = filters_for(Some("2024-01-01T00:00:00Z"));
        let pending = vec!["Condition".to_string(), "Observation".to_string()];

        let queries = patient_queries(&filters, &pending, "p1", false);
        assert_eq!(queries.len(), 2);
        assert_eq!(
            queries[0].1,
            "Condition?patient=p1&_lastUpdated=gt2024-01-01T00:00:00Z"
        );
        assert!(queries[1].1.starts_with("Observation?patient=p1&category="));
        assert!(queries[1].1.contains("&_lastUpdated=gt2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_new_patients_skip_since() {
        let filters = filters_for(Some("2024-01-01T00:00:00Z"));
        let pending = vec!["Condition".to_string()];
        let queries = patient_queries(&filters, &pending, "p9", true);
        assert_eq!(queries[0].1, "Condition?patient=p9");
    }
}
