//! The export workspace: a directory of numbered sub-exports plus pooled
//! top-level symlinks.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use harvest_core::time::now_utc;

use crate::error::{Result, StoreError};
use crate::metadata::{ExportMetadata, ExportParams};
use crate::ndjson::{self, PageWriter};

/// One numbered acquisition directory (`NNN.<label>/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubExport {
    dir: PathBuf,
    index: u32,
    label: String,
}

impl SubExport {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The directory name, `NNN.<label>`.
    pub fn name(&self) -> String {
        format!("{:03}.{}", self.index, self.label)
    }

    pub fn load_metadata(&self) -> Result<Option<ExportMetadata>> {
        ExportMetadata::load(&self.dir)
    }

    pub fn save_metadata(&self, metadata: &ExportMetadata) -> Result<()> {
        metadata.save(&self.dir)
    }

    /// A rolling page writer for a resource type, continuing from the
    /// highest existing page.
    pub fn writer(&self, res_type: &str, compress: bool) -> Result<PageWriter> {
        let start = self.next_page_index(res_type)?;
        Ok(PageWriter::new(&self.dir, res_type, start, compress))
    }

    /// The next unused `PPP` page index for a resource type.
    pub fn next_page_index(&self, res_type: &str) -> Result<u32> {
        let mut highest = 0;
        for path in ndjson::list_resource_files(&self.dir, res_type)? {
            if let Some(page) = page_index(&path) {
                highest = highest.max(page);
            }
        }
        Ok(highest + 1)
    }

    /// Remove the numbered pages of one resource type. Used when an
    /// interrupted type is re-acquired from scratch, so a sub-export
    /// never holds duplicate `(resourceType, id)` pairs.
    pub fn remove_pages(&self, res_type: &str) -> Result<()> {
        for path in ndjson::list_resource_files(&self.dir, res_type)? {
            if page_index(&path).is_some() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn deleted_dir(&self) -> PathBuf {
        self.dir.join("deleted")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.dir.join("error")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log.ndjson")
    }
}

/// The numeric `PPP` component of `Type.PPP.ndjson[.gz]`, if present.
pub fn page_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let middle = name.split('.').nth(1)?;
    middle.parse().ok()
}

/// An open workspace, exclusive to this process.
///
/// The `.lock` file uses OS advisory locking, so a crashed run releases
/// it automatically.
pub struct Workspace {
    root: PathBuf,
    _lock: File,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lock = File::create(root.join(".lock"))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::WorkspaceLocked(root.clone()))?;

        Ok(Self { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All sub-exports, ordered by index ascending.
    pub fn subexports(&self) -> Result<Vec<SubExport>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((index, label)) = name.split_once('.') else {
                continue;
            };
            let Ok(index) = index.parse::<u32>() else {
                continue;
            };
            found.push(SubExport {
                dir: entry.path(),
                index,
                label: label.to_string(),
            });
        }
        found.sort_by_key(|sub| sub.index);
        Ok(found)
    }

    /// The newest sub-export whose metadata says `complete=true`.
    pub fn latest_complete(&self) -> Result<Option<(SubExport, ExportMetadata)>> {
        for sub in self.subexports()?.into_iter().rev() {
            if let Some(metadata) = sub.load_metadata()? {
                if metadata.complete {
                    return Ok(Some((sub, metadata)));
                }
            }
        }
        Ok(None)
    }

    /// All `(sub-export, metadata)` pairs newest first, for walking back
    /// through prior runs.
    pub fn history(&self) -> Result<Vec<(SubExport, ExportMetadata)>> {
        let mut pairs = Vec::new();
        for sub in self.subexports()?.into_iter().rev() {
            if let Some(metadata) = sub.load_metadata()? {
                pairs.push((sub, metadata));
            }
        }
        Ok(pairs)
    }

    /// Open the sub-export this run should write into.
    ///
    /// Reuse rules, in order: an exact nickname match; a sub-export with
    /// structurally equal parameters (a completed one is only reused for
    /// a concrete `--since` - re-running it is then a no-op; `auto`
    /// resolves a fresh since-date per run, so a finished auto export
    /// gets a new directory). An in-progress sub-export with *different*
    /// parameters is an error - there can be only one in-progress
    /// sub-export per workspace. Otherwise a fresh `max+1` directory is
    /// created.
    pub fn open_subexport(
        &self,
        params: &ExportParams,
    ) -> Result<(SubExport, ExportMetadata)> {
        let existing = self.subexports()?;
        let highest = existing.last().map(|sub| sub.index).unwrap_or(0);

        if let Some(nickname) = &params.nickname {
            for sub in &existing {
                if sub.label() == nickname {
                    tracing::info!(dir = %sub.name(), "Re-using sub-export with the same nickname");
                    return self.resume(sub.clone(), params);
                }
            }
        }

        let auto_since = params.since.as_deref() == Some("auto");
        for sub in existing.iter().rev() {
            let Some(metadata) = sub.load_metadata()? else {
                continue;
            };
            if metadata.params.matches(params) {
                if metadata.complete && auto_since {
                    continue;
                }
                tracing::info!(dir = %sub.name(), "Re-using sub-export with the same parameters");
                return Ok((sub.clone(), metadata));
            }
            if !metadata.complete {
                return Err(StoreError::ParamsMismatch {
                    dir: sub.dir().to_path_buf(),
                });
            }
        }

        let label = params
            .nickname
            .clone()
            .unwrap_or_else(|| now_utc().utc_date());
        let sub = SubExport {
            dir: self.root.join(format!("{:03}.{}", highest + 1, label)),
            index: highest + 1,
            label,
        };
        fs::create_dir_all(sub.dir())?;
        let metadata = ExportMetadata::new(params.clone());
        sub.save_metadata(&metadata)?;
        tracing::info!(dir = %sub.name(), "Created new sub-export");
        Ok((sub, metadata))
    }

    fn resume(&self, sub: SubExport, params: &ExportParams) -> Result<(SubExport, ExportMetadata)> {
        match sub.load_metadata()? {
            Some(metadata) => {
                if !metadata.params.matches(params) {
                    return Err(StoreError::ParamsMismatch {
                        dir: sub.dir().to_path_buf(),
                    });
                }
                Ok((sub, metadata))
            }
            None => {
                let metadata = ExportMetadata::new(params.clone());
                sub.save_metadata(&metadata)?;
                Ok((sub, metadata))
            }
        }
    }
}
