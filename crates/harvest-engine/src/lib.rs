//! The acquisition engines: bulk export, crawl, cohort resolution, and
//! hydration, coordinated by a supervisor that owns the concurrency
//! budgets and the cancellation signal.

pub mod bulk;
pub mod cohort;
pub mod crawl;
pub mod error;
pub mod export;
pub mod filters;
pub mod hydrate;
pub mod scheduler;

pub use bulk::BulkOptions;
pub use error::{EngineError, Result};
pub use export::{perform_export, perform_hydrate, ExportMode, ExportRequest, ExportSummary};
pub use filters::{Filters, SinceMode, SinceModeArg};
pub use hydrate::{HydrateOptions, TaskOutcome};
pub use scheduler::{Budgets, Supervisor};
