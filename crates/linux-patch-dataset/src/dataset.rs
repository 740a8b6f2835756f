//! The datapoint pipeline: patch in, before/after bitcode trees and a
//! metadata record out.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{BeforeBuildPolicy, DatasetConfig};
use crate::error::{Error, Result};
use crate::exec::{CommitStatus, ExecCtx, ExecEvent};
use crate::kbuild::fixes::FixTable;
use crate::kbuild::{BitcodeJob, KernelBuild, build_bitcode};
use crate::layout::{DatapointPaths, DatasetLayout, ensure_dir, join_repo_rel, write_file};
use crate::patch::{PatchSource, diff};
use crate::resolver::{AffectedFiles, resolve_affected};
use crate::switch::{reset_tree, switch_commit};
use crate::vcs::VersionControl;

/// `patch.json`: the only success marker downstream tooling looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub commit: String,
    pub parent: String,
    pub files: AffectedFiles,
}

impl MetadataRecord {
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        self.serialize(&mut ser)?;
        String::from_utf8(buf).map_err(|e| Error::msg(format!("record is not utf-8: {e}")))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_file(path, &self.to_json()?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("invalid record {}: {e}", path.display())))
    }
}

/// Append-only, one line per processed commit.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", self.path.display())))?;
        writeln!(f, "{line}")
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", self.path.display())))
    }

    pub fn record_after(&self, commit: &str, after: &[String]) -> Result<()> {
        self.append(&format!("[{commit}] {}", serde_json::to_string(after)?))
    }

    pub fn record_both(&self, commit: &str, after: &[String], before: &[String]) -> Result<()> {
        self.append(&format!(
            "[{commit}] after={} before={}",
            serde_json::to_string(after)?,
            serde_json::to_string(before)?
        ))
    }

    pub fn record_error(&self, commit: &str, err: &Error) -> Result<()> {
        let msg = err.to_string();
        let first = msg.lines().next().unwrap_or_default();
        self.append(&format!("[{commit}] error: {first}"))
    }
}

/// One identifier per line; blanks dropped, first occurrence wins.
pub fn parse_commit_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn read_commit_list(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read commit list {}: {e}", path.display())))?;
    Ok(parse_commit_list(&raw))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MakeOptions {
    pub skip_compile: bool,
    pub rebuild_all: bool,
    pub rebuild_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointOutcome {
    AlreadyComplete,
    AlreadyAttempted,
    /// Patch persisted; nothing in it compiles to bitcode.
    NoCompilableSources,
    CompileSkipped,
    BuildFailed {
        after: Vec<String>,
        before: Option<Vec<String>>,
    },
    Recorded {
        parent: String,
        before: Vec<String>,
    },
}

impl DatapointOutcome {
    pub fn status(&self) -> CommitStatus {
        match self {
            DatapointOutcome::Recorded { .. } => CommitStatus::Complete,
            DatapointOutcome::BuildFailed { .. } => CommitStatus::Failed,
            _ => CommitStatus::Skipped,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DatapointOutcome::AlreadyComplete => "already complete".into(),
            DatapointOutcome::AlreadyAttempted => "already attempted".into(),
            DatapointOutcome::NoCompilableSources => "no compilable sources in patch".into(),
            DatapointOutcome::CompileSkipped => "compilation skipped".into(),
            DatapointOutcome::BuildFailed { after, .. } => {
                format!("no bitcode for {}", after.join(", "))
            }
            DatapointOutcome::Recorded { parent, before } if before.is_empty() => {
                format!("recorded (parent {parent})")
            }
            DatapointOutcome::Recorded { parent, before } => format!(
                "recorded (parent {parent}); before build missed {}",
                before.join(", ")
            ),
        }
    }
}

pub struct DatapointMaker<'a> {
    source: &'a dyn PatchSource,
    vcs: &'a dyn VersionControl,
    kernel: &'a dyn KernelBuild,
    layout: &'a DatasetLayout,
    cfg: &'a DatasetConfig,
    fixes: FixTable,
    errors: ErrorLog,
    opts: MakeOptions,
}

impl<'a> DatapointMaker<'a> {
    pub fn new(
        source: &'a dyn PatchSource,
        vcs: &'a dyn VersionControl,
        kernel: &'a dyn KernelBuild,
        layout: &'a DatasetLayout,
        cfg: &'a DatasetConfig,
        opts: MakeOptions,
    ) -> Self {
        Self {
            source,
            vcs,
            kernel,
            layout,
            cfg,
            fixes: FixTable::from_config(&cfg.build.fixes, &layout.fixes_dir),
            errors: ErrorLog::new(&layout.error_log),
            opts,
        }
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    fn skip_reason(&self, dp: &DatapointPaths) -> Option<DatapointOutcome> {
        if dp.record.exists() && !self.opts.rebuild_all {
            return Some(DatapointOutcome::AlreadyComplete);
        }
        if dp.patch_file.exists() && !self.opts.rebuild_fail && !self.opts.rebuild_all {
            return Some(DatapointOutcome::AlreadyAttempted);
        }
        None
    }

    fn build_before(&self, ctx: &ExecCtx, parent: &str, job: &BitcodeJob<'_>) -> Result<Vec<String>> {
        switch_commit(self.vcs, self.kernel, ctx, parent)?;
        let report = build_bitcode(self.kernel, ctx, &self.cfg.build, &self.fixes, job)?;
        Ok(report.failures)
    }

    /// Produce (or skip) the datapoint for `commit`.
    pub fn make(&self, ctx: &ExecCtx, commit: &str) -> Result<DatapointOutcome> {
        let dp = self.layout.datapoint(commit, &self.cfg.patch.file_name)?;
        if let Some(skip) = self.skip_reason(&dp) {
            return Ok(skip);
        }

        ctx.log(&format!("checking patch {commit}"));
        let body = self.source.fetch(commit)?;
        let set = diff::parse(&String::from_utf8_lossy(&body))?;
        let analysis = diff::analyze(&set, &self.cfg.build.source_suffix)?;
        tracing::debug!(
            commit,
            files = set.files.len(),
            dirs = analysis.modified_dirs.len(),
            sources = analysis.modified_sources.len(),
            "patch analyzed"
        );

        discard_stale(&dp)?;
        ensure_dir(&dp.dir)?;
        write_file(&dp.patch_file, &body)?;
        ensure_dir(&dp.before)?;
        ensure_dir(&dp.after)?;
        for dir in &analysis.modified_dirs {
            ensure_dir(&join_repo_rel(&dp.before, dir)?)?;
            ensure_dir(&join_repo_rel(&dp.after, dir)?)?;
        }

        if analysis.modified_sources.is_empty() {
            return Ok(DatapointOutcome::NoCompilableSources);
        }

        let dirs = analysis
            .modified_dirs
            .iter()
            .map(|d| if d.is_empty() { "." } else { d.as_str() })
            .collect::<Vec<_>>();
        ctx.log(&format!("modified folders: {}", dirs.join(", ")));

        switch_commit(self.vcs, self.kernel, ctx, commit)?;
        let parent = self.vcs.parent_of(commit)?;
        let files = resolve_affected(self.vcs.root(), &analysis.modified_dirs, &self.cfg.build.source_suffix)?;
        for (dir, names) in &files {
            let shown = if dir.is_empty() { "." } else { dir.as_str() };
            ctx.log(&format!("files from {shown}: {}", names.join(", ")));
        }

        if self.opts.skip_compile {
            return Ok(DatapointOutcome::CompileSkipped);
        }

        let after = build_bitcode(
            self.kernel,
            ctx,
            &self.cfg.build,
            &self.fixes,
            &BitcodeJob {
                files: &files,
                modified: &analysis.modified_sources,
                dest: &dp.after,
            },
        )?
        .failures;

        let policy = self.cfg.build.before_build;
        let before = if after.is_empty() || policy == BeforeBuildPolicy::Always {
            let job = BitcodeJob {
                files: &files,
                modified: &analysis.modified_sources,
                dest: &dp.before,
            };
            match self.build_before(ctx, &parent, &job) {
                Ok(failures) => Some(failures),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // The parent side never gates the record; count every source as missed.
                    tracing::warn!(commit, parent = %parent, error = %e, "before build failed");
                    ctx.log(&format!("before build failed: {e}"));
                    self.errors.record_error(commit, &e)?;
                    Some(analysis.modified_sources.clone())
                }
            }
        } else {
            None
        };

        match (policy, &before) {
            (BeforeBuildPolicy::Always, Some(b)) => self.errors.record_both(commit, &after, b)?,
            _ => self.errors.record_after(commit, &after)?,
        }

        if !after.is_empty() {
            return Ok(DatapointOutcome::BuildFailed { after, before });
        }

        MetadataRecord {
            commit: commit.to_string(),
            parent: parent.clone(),
            files,
        }
        .write(&dp.record)?;
        Ok(DatapointOutcome::Recorded {
            parent,
            before: before.unwrap_or_default(),
        })
    }
}

/// A rebuild must not be judged against bitcode or a record from an earlier run.
fn discard_stale(dp: &DatapointPaths) -> Result<()> {
    if dp.record.exists() {
        fs::remove_file(&dp.record)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dp.record.display())))?;
    }
    for tree in [&dp.before, &dp.after] {
        if tree.exists() {
            fs::remove_dir_all(tree)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", tree.display())))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Process `commits` in order against the shared kernel tree.
///
/// Per-commit failures go to the error log and the batch moves on. A fatal
/// error (the patch could not be fetched) ends the run.
pub fn run_batch(
    maker: &DatapointMaker<'_>,
    ctx: &mut ExecCtx,
    commits: &[String],
    sync_remote: bool,
) -> Result<BatchSummary> {
    ctx.clear_commit();
    ctx.log(&format!("linux directory: {}", maker.layout.linux_dir.display()));
    ctx.log(&format!("data directory: {}", maker.layout.data_dir.display()));
    ctx.log(&format!("commits: {}", commits.len()));

    let prepared = reset_tree(maker.vcs, maker.kernel, ctx).and_then(|()| {
        if sync_remote {
            maker.vcs.fetch(ctx)
        } else {
            Ok(())
        }
    });
    if let Err(e) = prepared {
        ctx.sink.emit(ExecEvent::RunDone {
            ok: false,
            error: Some(e.to_string()),
        });
        return Err(e);
    }

    let mut summary = BatchSummary::default();
    for commit in commits {
        ctx.set_commit(commit.clone());
        ctx.sink.emit(ExecEvent::CommitStarted { id: commit.clone() });
        let started = Instant::now();

        let status = match maker.make(ctx, commit) {
            Ok(outcome) => {
                ctx.log(&outcome.describe());
                outcome.status()
            }
            Err(e) if e.is_fatal() => {
                ctx.log(&e.to_string());
                ctx.sink.emit(ExecEvent::CommitFinished {
                    id: commit.clone(),
                    status: CommitStatus::Failed,
                    elapsed_ms: started.elapsed().as_millis(),
                });
                ctx.clear_commit();
                ctx.sink.emit(ExecEvent::RunDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(commit = %commit, error = %e, "datapoint failed");
                ctx.log(&format!("error: {e}"));
                if let Err(log_err) = maker.errors.record_error(commit, &e) {
                    tracing::warn!(error = %log_err, "failed to append to error log");
                }
                CommitStatus::Failed
            }
        };

        match status {
            CommitStatus::Complete => summary.complete += 1,
            CommitStatus::Failed => summary.failed += 1,
            CommitStatus::Skipped => summary.skipped += 1,
        }
        ctx.sink.emit(ExecEvent::CommitFinished {
            id: commit.clone(),
            status,
            elapsed_ms: started.elapsed().as_millis(),
        });
    }

    ctx.clear_commit();
    ctx.sink.emit(ExecEvent::RunDone {
        ok: true,
        error: None,
    });
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn commit_list_trims_and_dedups_in_order() {
        let got = parse_commit_list("  b1\n\na2\nb1\n c3 \n\n");
        assert_eq!(got, vec!["b1".to_string(), "a2".into(), "c3".into()]);
    }

    #[test]
    fn record_uses_four_space_indent() {
        let mut files = BTreeMap::new();
        files.insert("drivers/net".to_string(), vec!["foo.c".to_string()]);
        let rec = MetadataRecord {
            commit: "abc123".into(),
            parent: "def456".into(),
            files,
        };
        let json = rec.to_json().expect("json");
        assert!(json.starts_with("{\n    \"commit\": \"abc123\""), "got: {json}");
        assert!(json.contains("\n        \"drivers/net\": [\n            \"foo.c\"\n"));

        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("patch.json");
        rec.write(&p).expect("write");
        assert_eq!(MetadataRecord::read(&p).expect("read"), rec);
    }

    #[test]
    fn error_log_appends_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = ErrorLog::new(&tmp.path().join("logs/err.log"));
        log.record_after("c1", &[]).unwrap();
        log.record_after("c2", &["net/a.c".to_string()]).unwrap();
        log.record_both("c3", &[], &["net/b.c".to_string()]).unwrap();
        log.record_error("c4", &Error::msg("checkout failed\nstderr tail"))
            .unwrap();
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            text,
            "[c1] []\n[c2] [\"net/a.c\"]\n[c3] after=[] before=[\"net/b.c\"]\n[c4] error: checkout failed\n"
        );
    }

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(DatapointOutcome::AlreadyComplete.status(), CommitStatus::Skipped);
        assert_eq!(
            DatapointOutcome::BuildFailed {
                after: vec!["a.c".into()],
                before: None
            }
            .status(),
            CommitStatus::Failed
        );
        assert_eq!(
            DatapointOutcome::Recorded {
                parent: "p".into(),
                before: vec![]
            }
            .status(),
            CommitStatus::Complete
        );
    }
}
