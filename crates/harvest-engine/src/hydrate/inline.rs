//! Inlining note attachments.
//!
//! DiagnosticReport `presentedForm` and DocumentReference
//! `content[].attachment` entries that carry a `url` but no `data` get
//! their bodies fetched and embedded: base64 `data`, byte `size`, and the
//! SHA-1 `hash` the FHIR Attachment type calls for. Affected page files
//! are rewritten atomically; untouched files are left byte-identical so a
//! second pass does nothing.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use harvest_client::{ensure_success, FhirClient, RequestOptions};
use harvest_store::{ndjson, NdjsonFileWriter, SubExport};

use crate::error::Result;
use crate::scheduler::Supervisor;

use super::{HYDRATED_TAG_CODE, HYDRATED_TAG_SYSTEM};

/// Where an attachment lives inside its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `presentedForm[i]` (DiagnosticReport)
    PresentedForm(usize),
    /// `content[i].attachment` (DocumentReference)
    Content(usize),
}

struct FetchJob {
    resource_index: usize,
    slot: Slot,
    url: String,
    mimetype: String,
}

/// Inline eligible attachments across the sub-export's DiagnosticReport
/// and DocumentReference pages. Returns the number of attachments newly
/// inlined.
pub async fn inline_attachments(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    mimetypes: &BTreeSet<String>,
) -> Result<u64> {
    let mut inlined = 0;

    for res_type in ["DiagnosticReport", "DocumentReference"] {
        for page in ndjson::list_resource_files(sub.dir(), res_type)? {
            supervisor.checkpoint()?;

            let mut resources = Vec::new();
            let mut unreadable = false;
            for record in ndjson::read_file(&page)? {
                match record {
                    Ok((_, value)) => resources.push(value),
                    Err(err) => {
                        tracing::warn!(error = %err, "Not rewriting page with malformed lines");
                        unreadable = true;
                        break;
                    }
                }
            }
            if unreadable {
                continue;
            }

            let jobs: Vec<FetchJob> = resources
                .iter()
                .enumerate()
                .flat_map(|(index, value)| fetch_jobs(index, value, mimetypes))
                .collect();
            if jobs.is_empty() {
                continue;
            }

            let semaphore = supervisor.hydrate_attachments();
            let results: Vec<(FetchJob, Option<Vec<u8>>)> = futures_util::stream::iter(jobs)
                .map(|job| {
                    let semaphore = semaphore.clone();
                    async move {
                        let _permit = match semaphore.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => return (job, None),
                        };
                        if supervisor.is_cancelled() {
                            return (job, None);
                        }
                        let body = fetch_attachment(client, &job).await;
                        (job, body)
                    }
                })
                .buffer_unordered(supervisor.budgets().hydrate_attachments.max(1))
                .collect()
                .await;

            let mut modified = false;
            for (job, body) in results {
                let Some(body) = body else { continue };
                let Some(attachment) = attachment_mut(&mut resources[job.resource_index], job.slot)
                else {
                    continue;
                };
                if !attachment.is_object() {
                    continue;
                }
                let digest = Sha1::digest(&body);
                attachment["size"] = json!(body.len());
                attachment["hash"] = json!(BASE64.encode(digest));
                attachment["data"] = json!(BASE64.encode(&body));
                add_hydrated_tag(&mut resources[job.resource_index]);
                inlined += 1;
                modified = true;
            }

            if modified {
                let mut writer = NdjsonFileWriter::create(&page, false);
                for value in &resources {
                    writer.write(value)?;
                }
                writer.finish()?;
            }

            supervisor.checkpoint()?;
        }
    }

    Ok(inlined)
}

/// The attachments of a resource worth fetching: an allowed content
/// type, a `url`, and no `data` yet.
fn fetch_jobs(resource_index: usize, value: &Value, mimetypes: &BTreeSet<String>) -> Vec<FetchJob> {
    let slots: Vec<(Slot, &Value)> = match value.get("resourceType").and_then(Value::as_str) {
        Some("DiagnosticReport") => value
            .get("presentedForm")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(i, attachment)| (Slot::PresentedForm(i), attachment))
            .collect(),
        Some("DocumentReference") => value
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(|(i, content)| content.get("attachment").map(|a| (Slot::Content(i), a)))
            .collect(),
        _ => Vec::new(),
    };

    let mut jobs = Vec::new();
    for (slot, attachment) in slots {
        let Some(content_type) = attachment.get("contentType").and_then(Value::as_str) else {
            continue;
        };
        let mimetype = mime_essence(content_type);
        if !mimetypes.contains(&mimetype) {
            tracing::debug!(content_type = %content_type, "Skipping attachment content type");
            continue;
        }
        if attachment.get("data").is_some() {
            continue;
        }
        let Some(url) = attachment.get("url").and_then(Value::as_str) else {
            continue;
        };
        jobs.push(FetchJob {
            resource_index,
            slot,
            url: url.to_string(),
            mimetype,
        });
    }
    jobs
}

async fn fetch_attachment(client: &FhirClient, job: &FetchJob) -> Option<Vec<u8>> {
    // The Accept header asks for raw content rather than a Binary
    // resource wrapper. See https://www.hl7.org/fhir/binary.html
    let options = RequestOptions::accept(job.mimetype.clone());
    let response = match client.send(Method::GET, &job.url, &options).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = %job.url, error = %err, "Attachment fetch failed");
            return None;
        }
    };
    let response = match ensure_success(response).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = %job.url, error = %err, "Attachment fetch rejected");
            return None;
        }
    };
    match response.bytes().await {
        Ok(bytes) => Some(bytes.to_vec()),
        Err(err) => {
            tracing::warn!(url = %job.url, error = %err, "Attachment body read failed");
            None
        }
    }
}

fn attachment_mut(resource: &mut Value, slot: Slot) -> Option<&mut Value> {
    match slot {
        Slot::PresentedForm(i) => resource.get_mut("presentedForm")?.get_mut(i),
        Slot::Content(i) => resource.get_mut("content")?.get_mut(i)?.get_mut("attachment"),
    }
}

/// The mimetype part of a Content-Type value, lowercased.
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn add_hydrated_tag(resource: &mut Value) {
    let Some(object) = resource.as_object_mut() else {
        return;
    };
    let meta = object.entry("meta").or_insert_with(|| json!({}));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    let tags = meta.entry("tag").or_insert_with(|| json!([]));
    let Some(tags) = tags.as_array_mut() else {
        return;
    };
    let already_tagged = tags.iter().any(|tag| {
        tag.get("system").and_then(Value::as_str) == Some(HYDRATED_TAG_SYSTEM)
            && tag.get("code").and_then(Value::as_str) == Some(HYDRATED_TAG_CODE)
    });
    if !already_tagged {
        tags.push(json!({"system": HYDRATED_TAG_SYSTEM, "code": HYDRATED_TAG_CODE}));
    }
}
