//! The managed export workflow: pick a mode, open or resume a
//! sub-export, acquire, hydrate, pool, finalize.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use harvest_client::{capabilities, FhirClient};
use harvest_core::fhir::PATIENT_COMPARTMENT;
use harvest_core::time::now_utc;
use harvest_core::ResourceType;
use harvest_store::{symlinks, ExportParams, SubExport, Workspace};

use crate::bulk::{run_bulk, BulkOptions};
use crate::cohort::{note_new_patients_after_bulk, resolve_cohort, Cohort, CohortSource};
use crate::crawl::run_crawl;
use crate::error::{EngineError, Result};
use crate::filters::{Filters, SinceModeArg};
use crate::hydrate::{self, HydrateOptions, TaskOutcome};
use crate::scheduler::Supervisor;

/// The `--export-mode` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    /// Bulk when the cohort source allows it, crawl otherwise.
    #[default]
    Auto,
    Bulk,
    Crawl,
}

/// Everything a run needs, assembled by the CLI from flags and config.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub workspace_dir: PathBuf,
    pub fhir_url: String,
    /// None means the full patient compartment.
    pub types: Option<Vec<String>>,
    pub type_filters: Vec<String>,
    /// A timestamp, or "auto" to continue from the last complete export.
    pub since: Option<String>,
    pub since_mode: SinceModeArg,
    pub mode: ExportMode,
    pub nickname: Option<String>,
    pub compression: bool,
    pub group: Option<String>,
    pub id_list: Option<String>,
    pub id_file: Option<PathBuf>,
    pub id_system: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub no_default_filters: bool,
    pub mimetypes: Option<String>,
    /// `bulk` and `crawl` subcommands skip the hydration stage.
    pub run_hydration: bool,
    pub bulk_options: BulkOptions,
}

impl ExportRequest {
    pub fn new(workspace_dir: impl Into<PathBuf>, fhir_url: impl Into<String>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            fhir_url: fhir_url.into(),
            types: None,
            type_filters: Vec::new(),
            since: None,
            since_mode: SinceModeArg::Auto,
            mode: ExportMode::Auto,
            nickname: None,
            compression: true,
            group: None,
            id_list: None,
            id_file: None,
            id_system: None,
            source_dir: None,
            no_default_filters: false,
            mimetypes: None,
            run_hydration: true,
            bulk_options: BulkOptions::default(),
        }
    }
}

/// What happened, for the CLI to report.
#[derive(Debug)]
pub struct ExportSummary {
    pub subexport: String,
    pub mode: harvest_store::ExportMode,
    pub complete: bool,
    pub failures: u64,
    pub cohort_size: Option<u64>,
    pub hydration: Vec<TaskOutcome>,
}

/// Run one export end to end.
pub async fn perform_export(
    client: &FhirClient,
    supervisor: &Supervisor,
    request: &ExportRequest,
) -> Result<ExportSummary> {
    let caps = client.capabilities().await?.clone();

    let types = requested_types(request.types.as_deref())?;
    let mut filters = Filters::new(
        types,
        &request.type_filters,
        request.since.clone(),
        request.since_mode,
        !request.no_default_filters,
        Some(&caps),
    )?;

    if let Some(supported) = capabilities::server_resource_types(&caps) {
        for skipped in filters.retain_types(&supported) {
            tracing::warn!(resource_type = %skipped, "Skipping, the server does not support it");
        }
    }
    if filters.types().is_empty() {
        return Err(EngineError::configuration(
            "no requested resource type is supported by this server",
        ));
    }

    let source = CohortSource::from_options(
        request.id_list.as_deref(),
        request.id_file.as_deref(),
        request.source_dir.as_deref(),
        request.group.as_deref(),
    );
    let mode = resolve_mode(request.mode, &source)?;

    let workspace = Workspace::open(&request.workspace_dir)?;

    if request.since.as_deref() == Some("auto") {
        let resolved = resolve_auto_since(&workspace, &filters)?;
        filters.set_detailed_since(resolved);
    }

    let params = ExportParams {
        fhir_url: request.fhir_url.clone(),
        types: filters.type_names(),
        type_filters: filters.filter_descriptions(),
        since: request.since.clone(),
        since_mode: filters.since_mode().map(|m| m.to_string()),
        mode,
        nickname: request.nickname.clone(),
        compression: request.compression,
        group: request.group.clone(),
    };
    let (sub, mut metadata) = workspace.open_subexport(&params)?;

    let bulk_options = BulkOptions {
        group: request.group.clone(),
        ..request.bulk_options.clone()
    };

    match mode {
        harvest_store::ExportMode::Bulk => {
            run_bulk(client, supervisor, &sub, &mut metadata, &filters, &bulk_options).await?;
            if filters.types().contains(&ResourceType::Patient) {
                note_new_patients_after_bulk(
                    &workspace,
                    &sub,
                    &mut metadata,
                    request.group.as_deref(),
                )?;
            }
        }
        harvest_store::ExportMode::Crawl => {
            let source = source.ok_or_else(|| {
                EngineError::configuration(
                    "a crawl needs a cohort: pass --group, --id-list, --id-file, or --source-dir",
                )
            })?;
            let cohort = resolve_cohort(
                client,
                supervisor,
                &workspace,
                &sub,
                &mut metadata,
                &filters,
                &source,
                request.id_system.as_deref(),
                &bulk_options,
            )
            .await?;
            run_crawl(
                client,
                supervisor,
                &sub,
                &mut metadata,
                &filters,
                &cohort,
                request.group.as_deref().or(request.nickname.as_deref()),
            )
            .await?;
        }
    }

    let hydration = if request.run_hydration {
        let options = HydrateOptions {
            mimetypes: hydrate::parse_mimetypes(request.mimetypes.as_deref()),
            force: false,
        };
        hydrate::run_all(client, supervisor, &sub, &mut metadata, &options).await?
    } else {
        Vec::new()
    };

    pool_outputs(&workspace, &sub, &filters)?;

    supervisor.checkpoint()?;
    metadata.complete = metadata.failures == 0;
    metadata.finished = Some(now_utc());
    sub.save_metadata(&metadata)?;

    Ok(ExportSummary {
        subexport: sub.name(),
        mode,
        complete: metadata.complete,
        failures: metadata.failures,
        cohort_size: metadata.cohort.as_ref().map(|cohort| cohort.count),
        hydration,
    })
}

/// Run hydration alone against the newest sub-export of a workspace.
pub async fn perform_hydrate(
    client: &FhirClient,
    supervisor: &Supervisor,
    workspace_dir: &std::path::Path,
    mimetypes: Option<&str>,
    force: bool,
) -> Result<Vec<TaskOutcome>> {
    let workspace = Workspace::open(workspace_dir)?;
    let Some(sub) = workspace.subexports()?.into_iter().next_back() else {
        return Err(EngineError::configuration(format!(
            "{} has no sub-exports to hydrate",
            workspace_dir.display()
        )));
    };
    let Some(mut metadata) = sub.load_metadata()? else {
        return Err(EngineError::configuration(format!(
            "{} has no metadata.json",
            sub.name()
        )));
    };

    let options = HydrateOptions {
        mimetypes: hydrate::parse_mimetypes(mimetypes),
        force,
    };
    let outcomes = hydrate::run_all(client, supervisor, &sub, &mut metadata, &options).await?;

    // Hydration can add Observation and Medication pages.
    for res_type in ["Observation", "Medication", "DiagnosticReport", "DocumentReference"] {
        symlinks::pool(workspace.root(), &sub, res_type)?;
    }
    Ok(outcomes)
}

fn requested_types(requested: Option<&[String]>) -> Result<Vec<ResourceType>> {
    let Some(requested) = requested else {
        return Ok(PATIENT_COMPARTMENT.to_vec());
    };
    let mut types = Vec::new();
    for name in requested {
        let parsed = ResourceType::from_str(name)
            .map_err(|err| EngineError::configuration(err.to_string()))?;
        if !types.contains(&parsed) {
            types.push(parsed);
        }
    }
    Ok(types)
}

/// Identifier cohorts can only be crawled; everything else defaults to
/// bulk.
fn resolve_mode(
    mode: ExportMode,
    source: &Option<CohortSource>,
) -> Result<harvest_store::ExportMode> {
    let needs_crawl = matches!(
        source,
        Some(CohortSource::IdList(_)) | Some(CohortSource::IdFile(_)) | Some(CohortSource::SourceDir(_))
    );
    match mode {
        ExportMode::Bulk if needs_crawl => Err(EngineError::configuration(
            "identifier and source-dir cohorts require --export-mode=crawl",
        )),
        ExportMode::Bulk => Ok(harvest_store::ExportMode::Bulk),
        ExportMode::Crawl => Ok(harvest_store::ExportMode::Crawl),
        ExportMode::Auto if needs_crawl => {
            tracing::info!("Identifier cohort provided, using crawl mode");
            Ok(harvest_store::ExportMode::Crawl)
        }
        ExportMode::Auto => Ok(harvest_store::ExportMode::Bulk),
    }
}

/// `--since=auto`: per-type transaction times of the newest complete
/// sub-export. Types it never covered get None (full fetch).
fn resolve_auto_since(
    workspace: &Workspace,
    filters: &Filters,
) -> Result<BTreeMap<String, Option<harvest_core::FhirDateTime>>> {
    let Some((_, prior)) = workspace.latest_complete()? else {
        return Err(EngineError::configuration(
            "could not detect a since value from previous exports; \
             run without --since or provide a timestamp",
        ));
    };
    let mut resolved = BTreeMap::new();
    for res_type in filters.type_names() {
        resolved.insert(
            res_type.clone(),
            prior.transaction_times.get(&res_type).cloned(),
        );
    }
    Ok(resolved)
}

/// Pool every resource type this run could have produced, including the
/// hydration outputs.
fn pool_outputs(workspace: &Workspace, sub: &SubExport, filters: &Filters) -> Result<()> {
    let mut res_types = filters.type_names();
    for extra in ["Observation", "Medication"] {
        if !res_types.iter().any(|t| t == extra) {
            res_types.push(extra.to_string());
        }
    }
    for res_type in res_types {
        symlinks::pool(workspace.root(), sub, &res_type)?;
    }
    Ok(())
}
