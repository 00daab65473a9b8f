use std::sync::Arc;

use harvest_engine::{
    perform_export, Budgets, EngineError, ExportMode, ExportRequest, Result, SinceModeArg,
    Supervisor,
};

use crate::cli::{ExportArgs, ExportModeOpt, SinceModeOpt};
use crate::config::{self, FileConfig};

/// Shared driver for the `export`, `bulk`, and `crawl` subcommands.
/// `forced_mode` pins the acquisition mode for the latter two, which also
/// skip hydration.
pub async fn run(
    mut args: ExportArgs,
    file_config: &FileConfig,
    forced_mode: Option<ExportMode>,
    run_hydration: bool,
) -> Result<()> {
    config::apply_auth(&mut args.auth, file_config);
    if args.group.is_none() {
        args.group = file_config.group.clone();
    }
    if args.id_system.is_none() {
        args.id_system = file_config.id_system.clone();
    }
    if args.mimetypes.is_none() {
        args.mimetypes = file_config.mimetypes.clone();
    }
    if args.nickname.is_none() {
        args.nickname = file_config.nickname.clone();
    }

    let client = super::make_client(&args.auth).await?;

    let mut budgets = Budgets::default();
    if let Some(n) = args.bulk_download_concurrency {
        budgets.bulk_download = n;
    }
    if let Some(n) = args.patient_concurrency {
        budgets.crawl_patients = n;
    }
    if let Some(n) = args.type_concurrency {
        budgets.crawl_types = n;
    }
    if let Some(n) = args.attachment_concurrency {
        budgets.hydrate_attachments = n;
    }
    let supervisor = Arc::new(Supervisor::new(budgets));
    supervisor.install_signal_handler();

    let mut request = ExportRequest::new(&args.folder, client.base_url());
    request.types = args
        .types
        .as_deref()
        .map(|list| list.split(',').map(|t| t.trim().to_string()).collect());
    request.type_filters = args.type_filter.clone();
    request.since = args.since.clone();
    request.since_mode = match args.since_mode {
        SinceModeOpt::Auto => SinceModeArg::Auto,
        SinceModeOpt::Updated => SinceModeArg::Updated,
        SinceModeOpt::Created => SinceModeArg::Created,
    };
    request.mode = forced_mode.unwrap_or(match args.export_mode {
        ExportModeOpt::Auto => ExportMode::Auto,
        ExportModeOpt::Bulk => ExportMode::Bulk,
        ExportModeOpt::Crawl => ExportMode::Crawl,
    });
    request.nickname = args.nickname.clone();
    request.compression = !args.no_compression;
    request.group = args.group.clone();
    request.id_list = args.id_list.clone();
    request.id_file = args.id_file.clone();
    request.id_system = args.id_system.clone();
    request.source_dir = args.source_dir.clone();
    request.no_default_filters = args.no_default_filters;
    request.mimetypes = args.mimetypes.clone();
    request.run_hydration = run_hydration;

    let summary = perform_export(&client, &supervisor, &request).await?;

    if supervisor.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    println!(
        "Sub-export {} finished via {} ({})",
        summary.subexport,
        summary.mode,
        if summary.complete {
            "complete".to_string()
        } else {
            format!("incomplete, {} failed queries", summary.failures)
        }
    );
    if let Some(count) = summary.cohort_size {
        println!("Cohort: {count} patients");
    }
    for task in &summary.hydration {
        if task.skipped {
            println!("Hydration {}: already done ({})", task.task, task.count);
        } else {
            println!("Hydration {}: {}", task.task, task.count);
        }
    }

    Ok(())
}
