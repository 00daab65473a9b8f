//! Closing the missing-Observation gap.
//!
//! DiagnosticReport results and Observation `hasMember` chains reference
//! Observations the original acquisition may not have returned (panels
//! and components are common offenders). We union the referenced IDs
//! with what is already on disk and fetch the difference, following
//! `hasMember` chains on the fetched resources too.

use std::collections::BTreeSet;

use futures_util::StreamExt;
use serde_json::Value;

use harvest_client::FhirClient;
use harvest_core::{parse_reference, resource};
use harvest_store::{ndjson, SubExport};

use crate::error::Result;
use crate::scheduler::Supervisor;

/// Fetch Observations referenced but absent, appending them to a new
/// Observation page. Returns the number fetched; 404s are logged and
/// omitted.
pub async fn fetch_missing_observations(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    compress: bool,
) -> Result<u64> {
    let mut present: BTreeSet<String> = BTreeSet::new();
    let mut referenced: BTreeSet<String> = BTreeSet::new();

    for report in ndjson::collect_resources(sub.dir(), "DiagnosticReport")? {
        for result in report
            .get("result")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            collect_observation_ref(result, client.base_url(), &mut referenced);
        }
    }
    for observation in ndjson::collect_resources(sub.dir(), "Observation")? {
        if let Some(id) = resource::resource_id(&observation) {
            present.insert(id.to_string());
        }
        collect_member_refs(&observation, client.base_url(), &mut referenced);
    }

    let mut pending: Vec<String> = referenced.difference(&present).cloned().collect();
    let mut known: BTreeSet<String> = present;
    known.extend(pending.iter().cloned());

    let mut writer = sub.writer("Observation", compress)?;
    let mut fetched = 0u64;
    let mut missing = 0u64;

    // Fetched Observations can reference more members, so work in waves
    // until the closure is complete.
    while !pending.is_empty() {
        supervisor.checkpoint()?;
        let wave = std::mem::take(&mut pending);
        let concurrency = supervisor.budgets().crawl_patients.max(1);

        let results: Vec<(String, Result<Option<Value>>)> = futures_util::stream::iter(wave)
            .map(|id| async move {
                let result = client
                    .fetch_resource(&format!("Observation/{id}"))
                    .await
                    .map_err(Into::into);
                (id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result? {
                Some(observation) => {
                    let mut members = BTreeSet::new();
                    collect_member_refs(&observation, client.base_url(), &mut members);
                    for member in members {
                        if known.insert(member.clone()) {
                            pending.push(member);
                        }
                    }
                    writer.append(&observation)?;
                    fetched += 1;
                }
                None => {
                    tracing::warn!(observation_id = %id, "Referenced Observation does not exist");
                    missing += 1;
                }
            }
        }
    }

    writer.finish()?;
    if fetched > 0 || missing > 0 {
        tracing::info!(fetched, missing, "Resolved referenced Observations");
    }
    Ok(fetched)
}

fn collect_observation_ref(reference_holder: &Value, base_url: &str, into: &mut BTreeSet<String>) {
    let Some(reference) = reference_holder.get("reference").and_then(Value::as_str) else {
        return;
    };
    if let Ok(parsed) = parse_reference(reference, Some(base_url)) {
        if parsed.resource_type == "Observation" {
            into.insert(parsed.id);
        }
    }
}

fn collect_member_refs(observation: &Value, base_url: &str, into: &mut BTreeSet<String>) {
    for member in observation
        .get("hasMember")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        collect_observation_ref(member, base_url, into);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collect_observation_ref_forms() {
        let mut refs = BTreeSet::new();
        let base = "https://ehr.example.com/fhir";

        collect_observation_ref(&json!({"reference": "Observation/o1"}), base, &mut refs);
        collect_observation_ref(
            &json!({"reference": "https://ehr.example.com/fhir/Observation/o2"}),
            base,
            &mut refs,
        );
        // Wrong type, contained, and external references are ignored
        collect_observation_ref(&json!({"reference": "Specimen/s1"}), base, &mut refs);
        collect_observation_ref(&json!({"reference": "#contained"}), base, &mut refs);
        collect_observation_ref(
            &json!({"reference": "https://elsewhere.example.com/Observation/o3"}),
            base,
            &mut refs,
        );
        collect_observation_ref(&json!({"display": "no reference"}), base, &mut refs);

        assert_eq!(
            refs,
            ["o1", "o2"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn test_collect_member_refs() {
        let mut refs = BTreeSet::new();
        let observation = json!({
            "resourceType": "Observation",
            "id": "panel",
            "hasMember": [
                {"reference": "Observation/m1"},
                {"reference": "Observation/m2"},
            ],
        });
        collect_member_refs(&observation, "https://x/fhir", &mut refs);
        assert_eq!(refs.len(), 2);
    }
}
