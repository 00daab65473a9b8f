//! Cohort resolution: turning a Group, identifier list, identifier file,
//! or prior export into the set of Patient IDs an export covers, plus the
//! new/deleted delta against the previous export.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use harvest_client::paging::entry_resources;
use harvest_client::{BundlePages, FhirClient};
use harvest_core::time::now_utc;
use harvest_core::{resource, FhirDateTime, ResourceType};
use harvest_store::{
    cohort_hash, ndjson, CohortInfo, ExportMetadata, NdjsonFileWriter, SubExport, Workspace,
};

use crate::bulk::{run_bulk, BulkOptions};
use crate::error::{EngineError, Result};
use crate::filters::Filters;
use crate::scheduler::Supervisor;

/// Patients per identifier-search request.
const ID_BATCH: usize = 100;

/// Where the cohort comes from. Mutually exclusive inputs, listed in
/// priority order.
#[derive(Debug, Clone)]
pub enum CohortSource {
    /// `--id-list`: identifiers straight from the command line.
    IdList(Vec<String>),
    /// `--id-file`: newline file, or CSV with an ID/MRN column.
    IdFile(PathBuf),
    /// `--source-dir`: reuse the Patient NDJSON of another workspace.
    SourceDir(PathBuf),
    /// `--group`: server-side FHIR Group membership.
    Group(String),
}

impl CohortSource {
    pub fn from_options(
        id_list: Option<&str>,
        id_file: Option<&Path>,
        source_dir: Option<&Path>,
        group: Option<&str>,
    ) -> Option<Self> {
        if let Some(list) = id_list {
            let ids = list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            return Some(Self::IdList(ids));
        }
        if let Some(path) = id_file {
            return Some(Self::IdFile(path.to_path_buf()));
        }
        if let Some(dir) = source_dir {
            return Some(Self::SourceDir(dir.to_path_buf()));
        }
        group.map(|g| Self::Group(g.to_string()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::IdList(_) => "id-list",
            Self::IdFile(_) => "id-file",
            Self::SourceDir(_) => "source-dir",
            Self::Group(_) => "group",
        }
    }
}

/// The resolved cohort for one export run.
#[derive(Debug, Clone)]
pub struct Cohort {
    /// Local `Patient.id` values.
    pub ids: BTreeSet<String>,
    /// Patients to treat as new: pull their history without `--since`.
    pub new: BTreeSet<String>,
    /// Patients present last time but gone now.
    pub deleted: BTreeSet<String>,
}

/// Resolve the cohort, fetching Patient resources into the sub-export
/// when the export includes the Patient type, and reconcile against the
/// previous export's cohort.
pub async fn resolve_cohort(
    client: &FhirClient,
    supervisor: &Supervisor,
    workspace: &Workspace,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    filters: &Filters,
    source: &CohortSource,
    id_system: Option<&str>,
    bulk_options: &BulkOptions,
) -> Result<Cohort> {
    let wants_patients = filters.types().contains(&ResourceType::Patient);

    let ids: BTreeSet<String> = if wants_patients && metadata.is_done("Patient") {
        tracing::info!("Skipping Patient, already done");
        patient_ids_in(sub.dir())?
    } else {
        match source {
            CohortSource::Group(group) => {
                fetch_patients_via_group(
                    client, supervisor, sub, metadata, filters, group, bulk_options,
                )
                .await?
            }
            CohortSource::SourceDir(dir) => {
                let ids = patient_ids_in(dir)?;
                if ids.is_empty() {
                    return Err(EngineError::configuration(format!(
                        "no cohort patients found in {}; run an export with Patient there first",
                        dir.display()
                    )));
                }
                if wants_patients {
                    // The cohort is borrowed, not re-fetched; record the
                    // type as done with an empty result.
                    metadata.mark_done("Patient", now_utc());
                }
                ids
            }
            CohortSource::IdList(raw_ids) => {
                resolve_identifiers(client, supervisor, sub, metadata, raw_ids, id_system, wants_patients)
                    .await?
            }
            CohortSource::IdFile(path) => {
                let raw_ids = read_id_file(path)?;
                resolve_identifiers(client, supervisor, sub, metadata, &raw_ids, id_system, wants_patients)
                    .await?
            }
        }
    };

    let (new, deleted) = reconcile_with_previous(workspace, sub, metadata, &ids)?;

    if !deleted.is_empty() {
        write_deleted_patients(sub, metadata, &deleted)?;
        tracing::info!(count = deleted.len(), "Patients removed since last export");
    }
    if !new.is_empty() {
        tracing::info!(count = new.len(), "New patients since last export");
    }

    metadata.new_patients = new.iter().cloned().collect();
    metadata.cohort = Some(CohortInfo {
        source: source.label().to_string(),
        hash: cohort_hash(ids.iter().map(String::as_str)),
        count: ids.len() as u64,
    });
    sub.save_metadata(metadata)?;

    Ok(Cohort { ids, new, deleted })
}

/// After a bulk export that included Patient, note which patients are
/// new (so later crawls can pull their history) and snapshot the cohort.
/// Deletions are not derived here - the server's own `deleted[]` manifest
/// already told us about those.
pub fn note_new_patients_after_bulk(
    workspace: &Workspace,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    group: Option<&str>,
) -> Result<()> {
    let ids = patient_ids_in(sub.dir())?;
    let (new, _deleted) = reconcile_with_previous(workspace, sub, metadata, &ids)?;
    if !new.is_empty() {
        tracing::info!(count = new.len(), "New patients since last export");
    }
    metadata.new_patients = new.into_iter().collect();
    metadata.cohort = Some(CohortInfo {
        source: if group.is_some() { "group" } else { "system" }.to_string(),
        hash: cohort_hash(ids.iter().map(String::as_str)),
        count: ids.len() as u64,
    });
    sub.save_metadata(metadata)?;
    Ok(())
}

/// Group membership is discovered the standard way: a bulk export of
/// type Patient only, against the Group.
async fn fetch_patients_via_group(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    filters: &Filters,
    group: &str,
    bulk_options: &BulkOptions,
) -> Result<BTreeSet<String>> {
    // Even when Patient is not among the requested types, membership
    // discovery still needs the full Patient roster.
    let patient_filters = if filters.types().contains(&ResourceType::Patient) {
        filters.restricted_to(&ResourceType::Patient)
    } else {
        Filters::new(
            vec![ResourceType::Patient],
            &[],
            None,
            crate::filters::SinceModeArg::Auto,
            false,
            None,
        )?
    };
    let options = BulkOptions {
        group: Some(group.to_string()),
        ..bulk_options.clone()
    };
    run_bulk(client, supervisor, sub, metadata, &patient_filters, &options).await?;
    patient_ids_in(sub.dir())
}

/// Resolve raw identifiers into local Patient IDs.
///
/// With an `--id-system`, each value is a `Patient.identifier` and we
/// search `Patient?identifier=S|V` in batches. Without one, the values
/// already are `Patient.id`s, and Patient resources (when wanted) are
/// fetched with batched `_id` searches.
async fn resolve_identifiers(
    client: &FhirClient,
    supervisor: &Supervisor,
    sub: &SubExport,
    metadata: &mut ExportMetadata,
    raw_ids: &[String],
    id_system: Option<&str>,
    wants_patients: bool,
) -> Result<BTreeSet<String>> {
    let unique: BTreeSet<&str> = raw_ids.iter().map(String::as_str).collect();

    if unique.is_empty() {
        if wants_patients {
            metadata.mark_done("Patient", now_utc());
        }
        return Ok(BTreeSet::new());
    }

    if id_system.is_none() && !wants_patients {
        return Ok(unique.into_iter().map(str::to_string).collect());
    }

    // Either way we search the server now, so partial Patient pages
    // from an interrupted run are discarded first.
    sub.remove_pages("Patient")?;
    let walk_start = now_utc();
    let mut writer = sub.writer("Patient", metadata.params.compression)?;
    let mut found = BTreeSet::new();
    let mut latest: Option<FhirDateTime> = None;

    let batches: Vec<Vec<&str>> = unique
        .iter()
        .copied()
        .collect::<Vec<_>>()
        .chunks(ID_BATCH)
        .map(|chunk| chunk.to_vec())
        .collect();

    for batch in batches {
        supervisor.checkpoint()?;
        let query = match id_system {
            Some(system) => {
                let values: Vec<String> =
                    batch.iter().map(|id| format!("{system}|{id}")).collect();
                format!("Patient?identifier={}", values.join(","))
            }
            None => format!("Patient?_id={}", batch.join(",")),
        };

        let mut pages = BundlePages::new(client, client.absolute_url(&query));
        while let Some(bundle) = pages.next_page().await? {
            supervisor.checkpoint()?;
            for patient in entry_resources(&bundle) {
                if resource::resource_type(patient) != Some("Patient") {
                    continue;
                }
                let Some(id) = resource::resource_id(patient) else {
                    continue;
                };
                if found.insert(id.to_string()) {
                    observe_dates(patient, &mut latest);
                    writer.append(patient)?;
                }
            }
        }
    }

    writer.finish()?;
    let transaction_time = clamp_to_start(latest, walk_start);
    metadata.mark_done("Patient", transaction_time);

    if id_system.is_some() {
        Ok(found)
    } else {
        // Direct IDs: the cohort is what the user listed, even if some
        // Patient reads came back empty.
        Ok(unique.into_iter().map(str::to_string).collect())
    }
}

/// Latest update/created date seen, clamped down to the walk start so a
/// stale replica yields a conservative transaction time.
pub(crate) fn clamp_to_start(latest: Option<FhirDateTime>, start: FhirDateTime) -> FhirDateTime {
    match latest {
        Some(seen) if seen < start => seen,
        _ => start,
    }
}

/// Track the newest updated/created date on a resource.
pub(crate) fn observe_dates(value: &Value, latest: &mut Option<FhirDateTime>) {
    for date in [resource::updated_date(value), resource::created_date(value)]
        .into_iter()
        .flatten()
    {
        if let Some(parsed) = harvest_core::time::parse_lenient(date) {
            if latest.as_ref().map(|seen| parsed > *seen).unwrap_or(true) {
                *latest = Some(parsed);
            }
        }
    }
}

/// Parse `--id-file`: a CSV with a case-insensitive `id` or `mrn` column,
/// or a plain newline-separated list.
fn read_id_file(path: &Path) -> Result<Vec<String>> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| EngineError::configuration(format!("cannot read {}: {err}", path.display())))?;
        let headers = reader
            .headers()
            .map_err(|err| EngineError::configuration(format!("bad CSV header in {}: {err}", path.display())))?
            .clone();
        let column = headers.iter().position(|name| {
            name.eq_ignore_ascii_case("id") || name.eq_ignore_ascii_case("mrn")
        });
        let Some(column) = column else {
            return Err(EngineError::configuration(format!(
                "{} has no 'ID' or 'MRN' column",
                path.display()
            )));
        };
        let mut ids = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| {
                EngineError::configuration(format!("bad CSV row in {}: {err}", path.display()))
            })?;
            if let Some(value) = record.get(column) {
                let value = value.trim();
                if !value.is_empty() {
                    ids.push(value.to_string());
                }
            }
        }
        Ok(ids)
    } else {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| EngineError::configuration(format!("cannot read {}: {err}", path.display())))?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn patient_ids_in(dir: &Path) -> Result<BTreeSet<String>> {
    Ok(ndjson::collect_resources(dir, "Patient")?
        .iter()
        .filter_map(|patient| resource::resource_id(patient).map(str::to_string))
        .collect())
}

/// Patient IDs with their `link[type=replaces]` targets, for merge
/// detection.
fn patients_with_replaces(dir: &Path) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut map = BTreeMap::new();
    for patient in ndjson::collect_resources(dir, "Patient")? {
        let Some(id) = resource::resource_id(&patient) else {
            continue;
        };
        let replaced: &mut BTreeSet<String> = map.entry(id.to_string()).or_default();
        for link in patient
            .get("link")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if link.get("type").and_then(Value::as_str) != Some("replaces") {
                continue;
            }
            let reference = link
                .get("other")
                .and_then(|other| other.get("reference"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if let Some(replaced_id) = reference.strip_prefix("Patient/") {
                replaced.insert(replaced_id.to_string());
            }
        }
    }
    Ok(map)
}

/// Compare against the newest prior export that covered Patient.
///
/// New patients are those literally absent last time, plus patients with
/// fresh `replaces` links (a merge target needs its history re-pulled in
/// case old resources now point at it). Deleted patients are those
/// missing from the current cohort.
fn reconcile_with_previous(
    workspace: &Workspace,
    sub: &SubExport,
    metadata: &ExportMetadata,
    current_ids: &BTreeSet<String>,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut previous = None;
    for (prior_sub, prior_metadata) in workspace.history()? {
        if prior_sub.dir() == sub.dir() {
            continue;
        }
        let same_mode =
            prior_metadata.params.since_mode == metadata.params.since_mode;
        if prior_metadata.is_done("Patient") && same_mode {
            previous = Some(prior_sub);
            break;
        }
    }
    let Some(previous) = previous else {
        return Ok((BTreeSet::new(), BTreeSet::new()));
    };

    let prior = patients_with_replaces(previous.dir())?;
    let current = patients_with_replaces(sub.dir())?;

    let mut new: BTreeSet<String> = current_ids
        .iter()
        .filter(|id| !prior.contains_key(*id))
        .cloned()
        .collect();
    let deleted: BTreeSet<String> = prior
        .keys()
        .filter(|id| !current_ids.contains(*id))
        .cloned()
        .collect();

    for (id, replaced) in &current {
        let previously_replaced = prior.get(id).cloned().unwrap_or_default();
        if replaced.difference(&previously_replaced).next().is_some() {
            new.insert(id.clone());
        }
    }

    Ok((new, deleted))
}

/// One DELETE-transaction Bundle per line, so the deletion count is just
/// the line count.
fn write_deleted_patients(
    sub: &SubExport,
    metadata: &ExportMetadata,
    deleted: &BTreeSet<String>,
) -> Result<()> {
    let suffix = if metadata.params.compression { ".gz" } else { "" };
    let path = sub.deleted_dir().join(format!("Patient.ndjson{suffix}"));
    let mut writer = NdjsonFileWriter::create(path, false);
    for id in deleted {
        writer.write(&json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{"request": {"method": "DELETE", "url": format!("Patient/{id}")}}],
        }))?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_priority() {
        let source = CohortSource::from_options(
            Some("a,b"),
            Some(Path::new("ids.csv")),
            Some(Path::new("/prior")),
            Some("G1"),
        )
        .unwrap();
        assert!(matches!(source, CohortSource::IdList(_)));

        let source =
            CohortSource::from_options(None, None, Some(Path::new("/prior")), Some("G1")).unwrap();
        assert!(matches!(source, CohortSource::SourceDir(_)));

        assert!(CohortSource::from_options(None, None, None, None).is_none());
    }

    #[test]
    fn test_id_list_parsing() {
        let source = CohortSource::from_options(Some(" a , b ,,c"), None, None, None).unwrap();
        match source {
            CohortSource::IdList(ids) => assert_eq!(ids, vec!["a", "b", "c"]),
            _ => panic!("expected IdList"),
        }
    }

    #[test]
    fn test_read_id_file_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "mrn1\n\n  mrn2  \nmrn3\n").unwrap();
        assert_eq!(read_id_file(&path).unwrap(), vec!["mrn1", "mrn2", "mrn3"]);
    }

    #[test]
    fn test_read_id_file_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "name,MRN\nalice,mrn1\nbob,mrn2\n").unwrap();
        assert_eq!(read_id_file(&path).unwrap(), vec!["mrn1", "mrn2"]);
    }

    #[test]
    fn test_read_id_file_csv_without_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "name,dob\nalice,1990\n").unwrap();
        let err = read_id_file(&path).unwrap_err();
        assert!(err.to_string().contains("'ID' or 'MRN'"));
    }

    #[test]
    fn test_clamp_to_start() {
        let start: FhirDateTime = "2024-06-01T00:00:00Z".parse().unwrap();
        let earlier: FhirDateTime = "2024-05-01T00:00:00Z".parse().unwrap();
        let later: FhirDateTime = "2024-07-01T00:00:00Z".parse().unwrap();

        assert_eq!(clamp_to_start(None, start.clone()), start);
        assert_eq!(clamp_to_start(Some(earlier.clone()), start.clone()), earlier);
        // A date later than the walk start means data changed under us;
        // stick with the start so nothing is missed next time.
        assert_eq!(clamp_to_start(Some(later), start.clone()), start);
    }

    #[test]
    fn test_observe_dates_takes_maximum() {
        let mut latest = None;
        observe_dates(
            &json!({"resourceType": "Condition", "id": "c1",
                    "meta": {"lastUpdated": "2024-01-01T00:00:00Z"},
                    "recordedDate": "2024-03-01"}),
            &mut latest,
        );
        // The partial recordedDate gets the +14:00 offset, so in UTC it
        // lands on Feb 29 and beats the January lastUpdated.
        let first = latest.clone().unwrap();
        assert_eq!(first.utc_date(), "2024-02-29");

        observe_dates(
            &json!({"resourceType": "Condition", "id": "c2",
                    "meta": {"lastUpdated": "2024-05-01T00:00:00Z"}}),
            &mut latest,
        );
        assert_eq!(latest.unwrap().to_string(), "2024-05-01T00:00:00Z");
    }
}
