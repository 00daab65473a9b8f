//! The `metadata.json` file that makes runs resumable.
//!
//! Every sub-export records the parameters it was started with, the
//! per-type transaction times it has finished, bulk resume state, the
//! cohort snapshot, and hydration markers. The file is rewritten
//! atomically after every state change.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use harvest_core::time::{now_utc, parse_lenient};
use harvest_core::FhirDateTime;

use crate::error::{Result, StoreError};

pub const METADATA_FILE: &str = "metadata.json";

/// How the data was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    Bulk,
    Crawl,
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulk => write!(f, "bulk"),
            Self::Crawl => write!(f, "crawl"),
        }
    }
}

impl FromStr for ExportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bulk" => Ok(Self::Bulk),
            "crawl" => Ok(Self::Crawl),
            other => Err(format!("unknown export mode: {other}")),
        }
    }
}

/// The normalized parameters of one acquisition run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    pub fhir_url: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub type_filters: Vec<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub since_mode: Option<String>,
    pub mode: ExportMode,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: bool,
    #[serde(default)]
    pub group: Option<String>,
}

fn default_compression() -> bool {
    true
}

impl ExportParams {
    /// Sorted and deduplicated types and filters, since-date in UTC Z
    /// form. Applied before hashing or comparing parameter sets.
    pub fn normalized(&self) -> Self {
        let mut types = self.types.clone();
        types.sort();
        types.dedup();

        let mut type_filters = self.type_filters.clone();
        type_filters.sort();
        type_filters.dedup();

        let since = self.since.as_deref().map(|value| {
            if value == "auto" {
                value.to_string()
            } else {
                parse_lenient(value)
                    .map(|dt| dt.to_utc_string())
                    .unwrap_or_else(|| value.to_string())
            }
        });

        Self {
            fhir_url: self.fhir_url.trim_end_matches('/').to_string(),
            types,
            type_filters,
            since,
            ..self.clone()
        }
    }

    /// Structural equality of the parts that define "the same export".
    ///
    /// The mode is deliberately ignored: users may swap between bulk and
    /// crawl against the same sub-export.
    pub fn matches(&self, other: &Self) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.types == b.types
            && a.type_filters == b.type_filters
            && a.since == b.since
            && (a.since.is_none() || a.since_mode == b.since_mode)
    }
}

/// Resume state for an in-flight bulk export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkState {
    /// The status URL handed back by kickoff.
    #[serde(default)]
    pub status_url: Option<String>,
    /// Finished downloads: file URL to decompressed byte count.
    #[serde(default)]
    pub downloaded: BTreeMap<String, u64>,
}

/// Where the cohort came from and what it looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortInfo {
    pub source: String,
    pub hash: String,
    pub count: u64,
}

/// Completion marker for one hydration task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationMarker {
    pub complete: bool,
    pub count: u64,
    pub started: FhirDateTime,
    #[serde(default)]
    pub finished: Option<FhirDateTime>,
}

/// Everything we persist about one sub-export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub params: ExportParams,
    /// Per-type upper bound of data completeness. A type present here is
    /// done; absence means not yet acquired.
    #[serde(default)]
    pub transaction_times: BTreeMap<String, FhirDateTime>,
    #[serde(default)]
    pub cohort: Option<CohortInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_state: Option<BulkState>,
    #[serde(default)]
    pub hydration: BTreeMap<String, HydrationMarker>,
    /// Patients first seen in this export; they are crawled without a
    /// since filter to pick up their history.
    #[serde(default)]
    pub new_patients: Vec<String>,
    /// Queries that failed after all retries.
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub complete: bool,
    pub started: FhirDateTime,
    #[serde(default)]
    pub finished: Option<FhirDateTime>,
}

impl ExportMetadata {
    pub fn new(params: ExportParams) -> Self {
        Self {
            params: params.normalized(),
            transaction_times: BTreeMap::new(),
            cohort: None,
            bulk_state: None,
            hydration: BTreeMap::new(),
            new_patients: Vec::new(),
            failures: 0,
            complete: false,
            started: now_utc(),
            finished: None,
        }
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(METADATA_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let metadata = serde_json::from_str(&contents).map_err(|err| StoreError::Metadata {
            dir: dir.to_path_buf(),
            message: format!("unreadable {METADATA_FILE}: {err}"),
        })?;
        Ok(Some(metadata))
    }

    /// Atomic write: temp file, fsync, rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(METADATA_FILE);
        let tmp_path = dir.join(format!("{METADATA_FILE}.tmp"));

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn is_done(&self, res_type: &str) -> bool {
        self.transaction_times.contains_key(res_type)
    }

    pub fn mark_done(&mut self, res_type: &str, transaction_time: FhirDateTime) {
        self.transaction_times
            .insert(res_type.to_string(), transaction_time);
    }

    /// The earliest per-type transaction time, used as the overall stamp
    /// of a crawl.
    pub fn earliest_transaction_time(&self) -> Option<&FhirDateTime> {
        self.transaction_times.values().min()
    }
}

/// A stable fingerprint of a cohort: SHA-1 over the sorted patient IDs.
pub fn cohort_hash<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = ids.into_iter().collect();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
