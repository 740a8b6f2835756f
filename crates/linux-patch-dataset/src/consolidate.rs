use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::layout::{RECORD_FILE, copy_dir_all, ensure_dir};

/// Copy every complete datapoint under `data_dir` into `meta_dir/<commit>`.
/// Returns the number of datapoints copied.
pub fn consolidate(data_dir: &Path, meta_dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(data_dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", data_dir.display())))?;
    let mut complete = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::msg(format!("failed to read {}: {e}", data_dir.display())))?;
        let path = entry.path();
        if path.is_dir() && path.join(RECORD_FILE).is_file() {
            complete.push(path);
        }
    }
    complete.sort();

    ensure_dir(meta_dir)?;
    for src in &complete {
        let Some(name) = src.file_name() else {
            continue;
        };
        let files = copy_dir_all(src, &meta_dir.join(name))?;
        tracing::debug!(datapoint = %name.to_string_lossy(), files, "copied");
    }
    Ok(complete.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_dir_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(consolidate(&tmp.path().join("nope"), &tmp.path().join("meta")).is_err());
    }

    #[test]
    fn empty_data_dir_counts_zero() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tmp.path().join("data")).unwrap();
        assert_eq!(consolidate(&tmp.path().join("data"), &tmp.path().join("meta")).unwrap(), 0);
        assert!(tmp.path().join("meta").is_dir());
    }
}
