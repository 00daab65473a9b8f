//! Export workspace layout and on-disk formats.
//!
//! A workspace is the user-facing output directory. Each acquisition run
//! writes into a numbered sub-export directory (`001.<label>/`) full of
//! NDJSON pages, and finished pages are pooled to the workspace top level
//! as symlinks with a global page numbering per resource type.

pub mod error;
pub mod log;
pub mod metadata;
pub mod ndjson;
pub mod symlinks;
pub mod workspace;

pub use error::{Result, StoreError};
pub use log::EventLog;
pub use metadata::{
    cohort_hash, BulkState, CohortInfo, ExportMetadata, ExportMode, ExportParams, HydrationMarker,
};
pub use ndjson::{NdjsonFileWriter, PageWriter, RawPageWriter};
pub use workspace::{SubExport, Workspace};
