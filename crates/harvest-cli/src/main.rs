mod cli;
mod commands;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use harvest_engine::{EngineError, ExportMode};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let file_config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Export(args) => commands::export::run(args, &file_config, None, true).await,
        Commands::Bulk(args) => {
            commands::export::run(args, &file_config, Some(ExportMode::Bulk), false).await
        }
        Commands::Crawl(args) => {
            commands::export::run(args, &file_config, Some(ExportMode::Crawl), false).await
        }
        Commands::Hydrate(args) => commands::hydrate::run(args, &file_config).await,
        Commands::Single(args) => commands::single::run(args, &file_config).await,
    }
}
