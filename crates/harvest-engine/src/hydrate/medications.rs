//! Fetching referenced Medications.
//!
//! MedicationRequests usually carry a `medicationReference` pointing at a
//! server-level Medication resource that no patient compartment search
//! returns. Collect the references, dedupe, fetch, and write a
//! `Medication.<PPP>.ndjson` page.

use std::collections::BTreeSet;

use futures_util::StreamExt;
use serde_json::Value;

use harvest_client::FhirClient;
use harvest_core::{parse_reference, resource};
use harvest_store::{ndjson, SubExport};

use crate::error::Result;
use crate::scheduler::Supervisor;

/// Returns the number of Medications fetched.
pub async fn fetch_referenced_medications(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    compress: bool,
) -> Result<u64> {
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for request in ndjson::collect_resources(sub.dir(), "MedicationRequest")? {
        let Some(reference) = request
            .get("medicationReference")
            .and_then(|med_ref| med_ref.get("reference"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if let Ok(parsed) = parse_reference(reference, Some(client.base_url())) {
            if parsed.resource_type == "Medication" {
                referenced.insert(parsed.id);
            }
        }
    }

    let present: BTreeSet<String> = ndjson::collect_resources(sub.dir(), "Medication")?
        .iter()
        .filter_map(|med| resource::resource_id(med).map(str::to_string))
        .collect();

    let missing: Vec<String> = referenced.difference(&present).cloned().collect();
    if missing.is_empty() {
        return Ok(0);
    }

    supervisor.checkpoint()?;
    let concurrency = supervisor.budgets().crawl_patients.max(1);
    let results: Vec<(String, Result<Option<Value>>)> = futures_util::stream::iter(missing)
        .map(|id| async move {
            let result = client
                .fetch_resource(&format!("Medication/{id}"))
                .await
                .map_err(Into::into);
            (id, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut writer = sub.writer("Medication", compress)?;
    let mut fetched = 0u64;
    for (id, result) in results {
        match result? {
            Some(medication) => {
                writer.append(&medication)?;
                fetched += 1;
            }
            None => {
                tracing::warn!(medication_id = %id, "Referenced Medication does not exist");
            }
        }
    }
    writer.finish()?;

    tracing::info!(fetched, "Downloaded referenced Medications");
    Ok(fetched)
}
