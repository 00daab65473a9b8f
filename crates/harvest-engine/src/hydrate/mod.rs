//! Hydration: post-acquisition enrichment of a sub-export.
//!
//! Three idempotent tasks, each with a completion marker in
//! `metadata.json.hydration`:
//! - `inline`: fetch note attachments and embed them as base64 `data`.
//! - `observations`: fetch Observations referenced by DiagnosticReport
//!   results or `hasMember` chains but missing from the export.
//! - `medications`: fetch Medications referenced by MedicationRequests.

pub mod inline;
pub mod medications;
pub mod observations;

use std::collections::BTreeSet;

use harvest_client::FhirClient;
use harvest_core::time::now_utc;
use harvest_store::{ExportMetadata, HydrationMarker, SubExport};

use crate::error::Result;
use crate::scheduler::Supervisor;

/// The `meta.tag` marking resources whose attachments were inlined.
pub const HYDRATED_TAG_SYSTEM: &str = "urn:fhir-harvest:hydration";
pub const HYDRATED_TAG_CODE: &str = "hydrated";

/// Settings for a hydration pass.
#[derive(Debug, Clone)]
pub struct HydrateOptions {
    /// Attachment content types worth inlining.
    pub mimetypes: BTreeSet<String>,
    /// Re-run tasks whose markers say complete.
    pub force: bool,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self {
            mimetypes: default_mimetypes(),
            force: false,
        }
    }
}

pub fn default_mimetypes() -> BTreeSet<String> {
    ["text/plain", "text/html", "application/xhtml+xml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Parse a `--mimetypes` argument (comma separated, case folded).
pub fn parse_mimetypes(arg: Option<&str>) -> BTreeSet<String> {
    match arg {
        None => default_mimetypes(),
        Some(list) => list
            .split(',')
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: &'static str,
    pub count: u64,
    pub skipped: bool,
}

/// Run all hydration tasks against a sub-export, skipping completed ones
/// unless forced.
pub async fn run_all(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    options: &HydrateOptions,
) -> Result<Vec<TaskOutcome>> {
    let mut outcomes = Vec::new();
    let compress = metadata.params.compression;

    for task in ["inline", "observations", "medications"] {
        let already_done = metadata
            .hydration
            .get(task)
            .map(|marker| marker.complete)
            .unwrap_or(false);
        if already_done && !options.force {
            tracing::info!(task = %task, "Skipping hydration task, already done");
            outcomes.push(TaskOutcome {
                task,
                count: metadata
                    .hydration
                    .get(task)
                    .map(|marker| marker.count)
                    .unwrap_or(0),
                skipped: true,
            });
            continue;
        }

        supervisor.checkpoint()?;
        let started = now_utc();
        let count = match task {
            "inline" => {
                inline::inline_attachments(client, supervisor, sub, &options.mimetypes).await?
            }
            "observations" => {
                observations::fetch_missing_observations(client, supervisor, sub, compress).await?
            }
            _ => {
                medications::fetch_referenced_medications(client, supervisor, sub, compress)
                    .await?
            }
        };

        metadata.hydration.insert(
            task.to_string(),
            HydrationMarker {
                complete: true,
                count,
                started,
                finished: Some(now_utc()),
            },
        );
        sub.save_metadata(metadata)?;

        outcomes.push(TaskOutcome {
            task,
            count,
            skipped: false,
        });
    }

    Ok(outcomes)
}
