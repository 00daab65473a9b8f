use std::sync::Arc;

use harvest_engine::{perform_hydrate, Budgets, Result, Supervisor};

use crate::cli::HydrateArgs;
use crate::config::{self, FileConfig};

pub async fn run(mut args: HydrateArgs, file_config: &FileConfig) -> Result<()> {
    config::apply_auth(&mut args.auth, file_config);
    if args.mimetypes.is_none() {
        args.mimetypes = file_config.mimetypes.clone();
    }

    let client = super::make_client(&args.auth).await?;

    let mut budgets = Budgets::default();
    if let Some(n) = args.attachment_concurrency {
        budgets.hydrate_attachments = n;
    }
    let supervisor = Arc::new(Supervisor::new(budgets));
    supervisor.install_signal_handler();

    let outcomes = perform_hydrate(
        &client,
        &supervisor,
        &args.folder,
        args.mimetypes.as_deref(),
        args.force,
    )
    .await?;

    for task in &outcomes {
        if task.skipped {
            println!("Hydration {}: already done ({})", task.task, task.count);
        } else {
            println!("Hydration {}: {}", task.task, task.count);
        }
    }
    Ok(())
}
