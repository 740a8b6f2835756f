use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::layout::join_repo_rel;

/// Directory (repository-relative, `""` for the root) → source file names in it.
pub type AffectedFiles = BTreeMap<String, Vec<String>>;

/// Every source file present in each touched directory, not only the patched
/// ones: siblings share headers and Kbuild rules, so they are rebuilt too.
///
/// A directory that no longer exists (the patch removed its last file) maps to
/// an empty list.
pub fn resolve_affected(
    tree: &Path,
    dirs: &BTreeSet<String>,
    source_suffix: &str,
) -> Result<AffectedFiles> {
    let mut out = AffectedFiles::new();
    for dir in dirs {
        let abs = join_repo_rel(tree, dir)?;
        let mut files = Vec::new();
        if abs.is_dir() {
            for entry in fs::read_dir(&abs)
                .map_err(|e| Error::msg(format!("failed to read {}: {e}", abs.display())))?
            {
                let entry = entry.map_err(|e| Error::msg(e.to_string()))?;
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_file && name.ends_with(source_suffix) {
                    files.push(name);
                }
            }
            files.sort();
        } else {
            tracing::debug!(dir = %abs.display(), "touched directory missing at checkout");
        }
        out.insert(dir.clone(), files);
    }
    Ok(out)
}

/// `dir/name` for every entry, with the root directory contributing bare names.
pub fn affected_paths(files: &AffectedFiles) -> Vec<String> {
    let mut out = Vec::new();
    for (dir, names) in files {
        for name in names {
            if dir.is_empty() {
                out.push(name.clone());
            } else {
                out.push(format!("{dir}/{name}"));
            }
        }
    }
    out
}
