use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::PathsConfig;
use crate::error::{Error, Result};

/// File name of the metadata record; its presence marks a complete datapoint.
pub const RECORD_FILE: &str = "patch.json";
pub const BEFORE_DIR: &str = "before";
pub const AFTER_DIR: &str = "after";

#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub linux_dir: PathBuf,
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub error_log: PathBuf,
    pub fixes_dir: PathBuf,
}

/// Where one commit's datapoint lives on disk.
#[derive(Debug, Clone)]
pub struct DatapointPaths {
    pub dir: PathBuf,
    pub patch_file: PathBuf,
    pub record: PathBuf,
    pub before: PathBuf,
    pub after: PathBuf,
}

impl DatasetLayout {
    pub fn resolve(cfg: &PathsConfig) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
        let root = resolve_user_path(&cwd, &cfg.root)?;
        Ok(Self {
            linux_dir: resolve_user_path(&root, &cfg.linux_dir)?,
            data_dir: resolve_user_path(&root, &cfg.data_dir)?,
            meta_dir: resolve_user_path(&root, &cfg.meta_dir)?,
            error_log: resolve_user_path(&root, &cfg.error_log)?,
            fixes_dir: resolve_user_path(&root, &cfg.fixes_dir)?,
            root,
        })
    }

    /// A user-supplied path outside `[paths]`, rooted the same way.
    pub fn rooted(&self, p: &str) -> Result<PathBuf> {
        resolve_user_path(&self.root, p)
    }

    pub fn datapoint(&self, commit: &str, patch_file_template: &str) -> Result<DatapointPaths> {
        validate_commit_id(commit)?;
        let dir = self.data_dir.join(commit);
        let patch_name = expand_commit_template(patch_file_template, commit);
        validate_file_name(&patch_name)?;
        Ok(DatapointPaths {
            patch_file: dir.join(patch_name),
            record: dir.join(RECORD_FILE),
            before: dir.join(BEFORE_DIR),
            after: dir.join(AFTER_DIR),
            dir,
        })
    }
}

pub fn expand_commit_template(raw: &str, commit: &str) -> String {
    raw.replace("{commit}", commit)
}

/// Commit ids become directory names; keep them to a single plain segment.
pub fn validate_commit_id(commit: &str) -> Result<()> {
    if commit.is_empty() || commit.trim() != commit {
        return Err(Error::msg(format!("invalid commit id '{commit}'")));
    }
    if commit == "." || commit == ".." || commit.contains(['/', '\\']) {
        return Err(Error::msg(format!(
            "invalid commit id '{commit}' (must be a single path segment)"
        )));
    }
    Ok(())
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::msg(format!("invalid patch file name '{name}'")));
    }
    Ok(())
}

/// Repository-relative directory from a patch. The root is the empty string.
pub fn validate_repo_rel(p: &str) -> Result<()> {
    let pb = Path::new(p);
    if pb.is_absolute() {
        return Err(Error::msg(format!("path '{}' is absolute", p)));
    }
    if pb
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(Error::msg(format!("path '{}' contains '..'", p)));
    }
    Ok(())
}

/// Join a repository-relative directory under `base`; the empty dir maps to `base`.
pub fn join_repo_rel(base: &Path, rel: &str) -> Result<PathBuf> {
    validate_repo_rel(rel)?;
    if rel.is_empty() {
        return Ok(base.to_path_buf());
    }
    Ok(base.join(rel))
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty path in [paths]"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    if p.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_file(p: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, contents).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

/// Recursive copy; existing files at the destination are overwritten.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0usize;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let rel = entry.path().strip_prefix(src).map_err(|e| {
            Error::msg(format!(
                "unexpected path {} under {}: {e}",
                entry.path().display(),
                src.display()
            ))
        })?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
