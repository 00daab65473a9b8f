use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fhir-harvest")]
#[command(about = "Extract clinical FHIR data from EHR servers into NDJSON workspaces")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML config file; command line flags win over it
    #[arg(short, long, global = true, env = "FHIR_HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// More logging (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a managed export: acquire, hydrate, and pool symlinks
    Export(ExportArgs),
    /// Run only the bulk export stage
    Bulk(ExportArgs),
    /// Run only the crawl stage
    Crawl(ExportArgs),
    /// Run hydration against an already-exported workspace
    Hydrate(HydrateArgs),
    /// Request a single resource and print it
    Single(SingleArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum SinceModeOpt {
    /// Pick from the server's capabilities
    #[default]
    Auto,
    /// Filter on the server's update time
    Updated,
    /// Filter on per-type creation dates
    Created,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum ExportModeOpt {
    /// Bulk when the cohort source allows it
    #[default]
    Auto,
    Bulk,
    Crawl,
}

#[derive(clap::Args)]
pub struct AuthArgs {
    /// FHIR server base URL
    #[arg(long, env = "FHIR_HARVEST_URL")]
    pub fhir_url: Option<String>,

    /// Client ID for SMART backend-services authentication
    #[arg(long)]
    pub smart_client_id: Option<String>,

    /// PEM private key for SMART backend-services authentication
    #[arg(long)]
    pub smart_key: Option<PathBuf>,

    /// Token endpoint, only needed if the server does not advertise it
    #[arg(long)]
    pub token_url: Option<String>,

    /// File holding a static bearer token
    #[arg(long)]
    pub bearer_token_file: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct ExportArgs {
    /// Output workspace directory
    #[arg(value_name = "OUTPUT_DIR")]
    pub folder: PathBuf,

    #[command(flatten)]
    pub auth: AuthArgs,

    /// A FHIR Group to export (default is the whole system)
    #[arg(long)]
    pub group: Option<String>,

    /// Comma-separated identifiers defining the cohort
    #[arg(long)]
    pub id_list: Option<String>,

    /// File with identifiers, one per line or a CSV with an ID/MRN column
    #[arg(long)]
    pub id_file: Option<PathBuf>,

    /// Identifier system; identifiers are then resolved via
    /// Patient?identifier searches instead of used as Patient IDs
    #[arg(long)]
    pub id_system: Option<String>,

    /// Reuse the Patient cohort of another workspace
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Only these resource types (comma separated; default is the whole
    /// patient compartment)
    #[arg(long = "type")]
    pub types: Option<String>,

    /// Search filter to apply (_typeFilter style, repeatable)
    #[arg(long = "type-filter", value_name = "FILTER")]
    pub type_filter: Vec<String>,

    /// Only data since this instant, or 'auto' to continue from the
    /// previous complete export
    #[arg(long, value_name = "TIMESTAMP")]
    pub since: Option<String>,

    /// How to interpret --since
    #[arg(long, value_enum, default_value_t = SinceModeOpt::Auto)]
    pub since_mode: SinceModeOpt,

    /// How to acquire data
    #[arg(long, value_enum, default_value_t = ExportModeOpt::Auto)]
    pub export_mode: ExportModeOpt,

    /// Nickname for this sub-export (defaults to today's date)
    #[arg(long, value_name = "NAME")]
    pub nickname: Option<String>,

    /// Write plain .ndjson instead of .ndjson.gz
    #[arg(long)]
    pub no_compression: bool,

    /// Skip the default Observation category filters
    #[arg(long)]
    pub no_default_filters: bool,

    /// Attachment mimetypes to inline (comma separated)
    #[arg(long)]
    pub mimetypes: Option<String>,

    /// Concurrent bulk file downloads
    #[arg(long, value_name = "N")]
    pub bulk_download_concurrency: Option<usize>,

    /// Patients crawled in parallel
    #[arg(long, value_name = "N")]
    pub patient_concurrency: Option<usize>,

    /// Resource types crawled in parallel per patient
    #[arg(long, value_name = "N")]
    pub type_concurrency: Option<usize>,

    /// Concurrent attachment downloads during hydration
    #[arg(long, value_name = "N")]
    pub attachment_concurrency: Option<usize>,
}

#[derive(clap::Args)]
pub struct HydrateArgs {
    /// Workspace whose newest sub-export should be hydrated
    #[arg(value_name = "OUTPUT_DIR")]
    pub folder: PathBuf,

    #[command(flatten)]
    pub auth: AuthArgs,

    /// Attachment mimetypes to inline (comma separated)
    #[arg(long)]
    pub mimetypes: Option<String>,

    /// Re-run tasks already marked complete
    #[arg(long)]
    pub force: bool,

    /// Concurrent attachment downloads
    #[arg(long, value_name = "N")]
    pub attachment_concurrency: Option<usize>,
}

#[derive(clap::Args)]
pub struct SingleArgs {
    /// Resource reference, e.g. Patient/123
    #[arg(value_name = "ResourceType/ID")]
    pub reference: String,

    #[command(flatten)]
    pub auth: AuthArgs,

    /// Print compact JSON (all on one line)
    #[arg(long)]
    pub compact: bool,
}
