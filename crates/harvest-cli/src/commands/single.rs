use harvest_engine::{EngineError, Result};

use crate::cli::SingleArgs;
use crate::config::{self, FileConfig};

pub async fn run(mut args: SingleArgs, file_config: &FileConfig) -> Result<()> {
    config::apply_auth(&mut args.auth, file_config);
    let client = super::make_client(&args.auth).await?;

    let resource = client
        .fetch_resource(&args.reference)
        .await?
        .ok_or_else(|| {
            EngineError::ExportFailed(format!("{} was not found on the server", args.reference))
        })?;

    if args.compact {
        println!("{}", serde_json::to_string(&resource).map_err(harvest_core::CoreError::from)?);
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&resource).map_err(harvest_core::CoreError::from)?
        );
    }
    Ok(())
}
