//! Top-level symlink pooling.
//!
//! Finished sub-export pages are exposed at the workspace root as
//! `Type.GGG.ndjson[.gz]` symlinks, where `GGG` is a dense global page
//! numbering per resource type across all sub-exports. Consumers can
//! then read the workspace root as if it were one big export.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::ndjson;
use crate::workspace::{page_index, SubExport};

/// Current top-level links for a resource type: global index to target
/// path (as stored, i.e. relative to the workspace root).
pub fn link_targets(root: &Path, res_type: &str) -> Result<BTreeMap<u32, PathBuf>> {
    let mut links = BTreeMap::new();
    for path in ndjson::list_resource_files(root, res_type)? {
        if !path.is_symlink() {
            continue;
        }
        if let Some(index) = page_index(&path) {
            links.insert(index, fs::read_link(&path)?);
        }
    }
    Ok(links)
}

/// Pool one resource type of a sub-export up to the workspace root.
///
/// Broken links (pointing at files that no longer exist) are pruned
/// first, then any of the sub-export's pages that are not yet linked get
/// the next free global indexes. Already-linked pages keep their links,
/// so re-pooling is a no-op.
pub fn pool(root: &Path, sub: &SubExport, res_type: &str) -> Result<()> {
    prune_broken_links(root, res_type)?;

    let links = link_targets(root, res_type)?;
    let mut next_index = links.keys().max().copied().unwrap_or(0) + 1;
    let linked: Vec<&PathBuf> = links.values().collect();

    for page in ndjson::list_resource_files(sub.dir(), res_type)? {
        let Some(file_name) = page.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // Relative target, so the workspace can be moved wholesale.
        let target = PathBuf::from(sub.name()).join(file_name);
        if linked.contains(&&target) {
            continue;
        }

        let compressed = ndjson::is_compressed(&page);
        let link_name = ndjson::page_filename(res_type, next_index, compressed);
        symlink(&target, root.join(link_name))?;
        next_index += 1;
    }
    Ok(())
}

/// Pool several resource types at once.
pub fn pool_all<'a>(
    root: &Path,
    sub: &SubExport,
    res_types: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for res_type in res_types {
        pool(root, sub, res_type)?;
    }
    Ok(())
}

/// Remove top-level links whose target has gone away, renumbering the
/// remainder so the global numbering stays dense.
fn prune_broken_links(root: &Path, res_type: &str) -> Result<()> {
    let links = link_targets(root, res_type)?;
    let mut survivors = Vec::new();
    let mut any_broken = false;

    for (index, target) in &links {
        let compressed = target.extension().map(|e| e == "gz").unwrap_or(false);
        let link_path = root.join(ndjson::page_filename(res_type, *index, compressed));
        if root.join(target).exists() {
            survivors.push((link_path, target.clone(), compressed));
        } else {
            fs::remove_file(&link_path)?;
            any_broken = true;
        }
    }

    if !any_broken {
        return Ok(());
    }

    // Relink the survivors densely, preserving their order.
    for (link_path, _, _) in &survivors {
        fs::remove_file(link_path)?;
    }
    for (position, (_, target, compressed)) in survivors.into_iter().enumerate() {
        let link_name = ndjson::page_filename(res_type, position as u32 + 1, compressed);
        symlink(&target, root.join(link_name))?;
    }
    Ok(())
}
