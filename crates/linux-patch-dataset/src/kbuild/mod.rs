use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::{BuildConfig, ToolchainConfig};
use crate::error::{Error, Result};
use crate::exec::ExecCtx;
use crate::layout::{copy_file, join_repo_rel};
use crate::log_sanitize::tail_lines;
use crate::resolver::{AffectedFiles, affected_paths};

pub mod fixes;
pub mod kconfig;

use fixes::FixTable;

const REPORT_TAIL_LINES: usize = 15;

/// One invocation of the object build.
#[derive(Debug, Clone, Default)]
pub struct BuildAttempt {
    pub ok: bool,
    pub timed_out: bool,
    /// Compiler diagnostics, searched for known failure signatures.
    pub error_output: String,
}

/// What the kernel tree's build system has to offer the pipeline.
pub trait KernelBuild {
    fn tree(&self) -> &Path;
    fn clean(&self, ctx: &ExecCtx) -> Result<()>;
    /// Leave a `.config` ready for building the current checkout.
    fn configure(&self, ctx: &ExecCtx) -> Result<()>;
    fn build(
        &self,
        ctx: &ExecCtx,
        targets: &[String],
        jobs: usize,
        timeout: Duration,
    ) -> Result<BuildAttempt>;
    fn apply_fix(&self, ctx: &ExecCtx, patch: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct KconfigPlan {
    pub marker: String,
    pub disabled: Vec<String>,
    pub normalize_target: String,
}

impl KconfigPlan {
    pub fn from_build(cfg: &BuildConfig) -> Self {
        Self {
            marker: cfg.kernel_hacking_marker.clone(),
            disabled: cfg.disabled_symbols.clone(),
            normalize_target: cfg.normalize_target.clone(),
        }
    }
}

/// Kbuild driven through `make -C <tree> CC=<cc>`.
pub struct MakeKernel {
    tree: PathBuf,
    make: String,
    cc: String,
    kcfg: KconfigPlan,
}

impl MakeKernel {
    pub fn new(tree: &Path, toolchain: &ToolchainConfig, kcfg: KconfigPlan) -> Self {
        Self {
            tree: tree.to_path_buf(),
            make: toolchain.make.clone(),
            cc: toolchain.cc.clone(),
            kcfg,
        }
    }

    fn make_cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.make);
        cmd.arg("-C").arg(&self.tree);
        cmd.arg(format!("CC={}", self.cc));
        for a in args {
            cmd.arg(a);
        }
        cmd
    }

    fn run_make(&self, ctx: &ExecCtx, args: &[&str]) -> Result<()> {
        ctx.run_cmd(self.make_cmd(args))
    }

    fn read_config(&self) -> Result<String> {
        let p = self.tree.join(".config");
        fs::read_to_string(&p)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
    }
}

impl KernelBuild for MakeKernel {
    fn tree(&self) -> &Path {
        &self.tree
    }

    fn clean(&self, ctx: &ExecCtx) -> Result<()> {
        self.run_make(ctx, &["clean"])
    }

    fn configure(&self, ctx: &ExecCtx) -> Result<()> {
        ctx.log("configuring kernel (defconfig + allyesconfig)");
        self.run_make(ctx, &["defconfig"])?;
        let baseline = self.read_config()?;

        self.run_make(ctx, &["allyesconfig"])?;
        let maximal = self.read_config()?;

        let mut spliced = kconfig::splice_section(&maximal, &baseline, &self.kcfg.marker)?;
        for sym in &self.kcfg.disabled {
            kconfig::disable_symbol(&mut spliced, sym);
        }
        let p = self.tree.join(".config");
        fs::write(&p, spliced)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))?;

        self.run_make(ctx, &[self.kcfg.normalize_target.as_str()])
    }

    fn build(
        &self,
        ctx: &ExecCtx,
        targets: &[String],
        jobs: usize,
        timeout: Duration,
    ) -> Result<BuildAttempt> {
        let jobs_arg = format!("-j{}", jobs.max(1));
        let mut cmd = self.make_cmd(&[jobs_arg.as_str()]);
        cmd.args(targets);
        let out = ctx.run_bounded(cmd, Some(timeout))?;
        Ok(BuildAttempt {
            ok: out.success(),
            timed_out: out.timed_out,
            error_output: out.stderr,
        })
    }

    fn apply_fix(&self, ctx: &ExecCtx, patch: &Path) -> Result<()> {
        if !patch.is_file() {
            return Err(Error::msg(format!("fix patch not found: {}", patch.display())));
        }
        let mut cmd = Command::new("patch");
        cmd.arg("-d")
            .arg(&self.tree)
            .arg("-p1")
            .arg("--forward")
            .arg("--batch")
            .arg("-i")
            .arg(patch);
        ctx.run_cmd(cmd)
    }
}

/// `foo/bar.c` → `foo/bar.o` for every affected source.
pub fn object_targets(files: &AffectedFiles, source_suffix: &str, object_suffix: &str) -> Vec<String> {
    affected_paths(files)
        .into_iter()
        .map(|p| match p.strip_suffix(source_suffix) {
            Some(stem) => format!("{stem}{object_suffix}"),
            None => format!("{p}{object_suffix}"),
        })
        .collect()
}

/// Where the build drops a source file's bitcode: next to it, full name plus suffix.
pub fn bitcode_rel(source_rel: &str, bitcode_suffix: &str) -> String {
    format!("{source_rel}{bitcode_suffix}")
}

/// Copy every bitcode artifact the build left in `tree` into the same
/// relative location under `dest`.
pub fn collect_bitcode(
    tree: &Path,
    files: &AffectedFiles,
    dest: &Path,
    bitcode_suffix: &str,
) -> Result<usize> {
    let mut copied = 0usize;
    for (dir, names) in files {
        let src_dir = join_repo_rel(tree, dir)?;
        let dst_dir = join_repo_rel(dest, dir)?;
        for name in names {
            let bc = bitcode_rel(name, bitcode_suffix);
            let src = src_dir.join(&bc);
            if src.is_file() {
                copy_file(&src, &dst_dir.join(&bc))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Modified sources with no bitcode under `dest`.
pub fn missing_bitcode(modified: &[String], dest: &Path, bitcode_suffix: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for rel in modified {
        let p = join_repo_rel(dest, &bitcode_rel(rel, bitcode_suffix))?;
        if !p.is_file() {
            out.push(rel.clone());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct BitcodeJob<'a> {
    pub files: &'a AffectedFiles,
    pub modified: &'a [String],
    pub dest: &'a Path,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Modified sources that never produced bitcode.
    pub failures: Vec<String>,
    pub attempts: usize,
    pub copied: usize,
}

/// Configure the tree at its current checkout, build the affected objects and
/// harvest their bitcode into `job.dest`.
///
/// A failed attempt whose diagnostics match a known signature gets that fix
/// applied and one more build, up to `max_attempts`. Each fix is applied at
/// most once per call.
pub fn build_bitcode(
    kernel: &dyn KernelBuild,
    ctx: &ExecCtx,
    cfg: &BuildConfig,
    fixes: &FixTable,
    job: &BitcodeJob<'_>,
) -> Result<BuildReport> {
    let targets = object_targets(job.files, &cfg.source_suffix, &cfg.object_suffix);
    let mut report = BuildReport::default();
    if targets.is_empty() {
        report.failures = missing_bitcode(job.modified, job.dest, &cfg.bitcode_suffix)?;
        return Ok(report);
    }

    kernel.configure(ctx)?;

    let jobs = cfg.effective_jobs();
    let per_target = cfg.timeout_per_target_secs.max(1);
    let timeout = Duration::from_secs(per_target.saturating_mul(targets.len() as u64));
    let max_attempts = cfg.max_attempts.max(1);
    let mut tried = BTreeSet::<PathBuf>::new();

    loop {
        report.attempts += 1;
        ctx.log(&format!(
            "building {} target(s), attempt {}/{} (-j{jobs}, timeout {}s)",
            targets.len(),
            report.attempts,
            max_attempts,
            timeout.as_secs()
        ));
        let attempt = kernel.build(ctx, &targets, jobs, timeout)?;
        report.copied += collect_bitcode(kernel.tree(), job.files, job.dest, &cfg.bitcode_suffix)?;
        report.failures = missing_bitcode(job.modified, job.dest, &cfg.bitcode_suffix)?;
        if report.failures.is_empty() {
            break;
        }

        // A timed-out build's diagnostics are incomplete.
        let output = if attempt.timed_out {
            ctx.log("build timed out");
            ""
        } else {
            attempt.error_output.as_str()
        };
        for line in tail_lines(output, REPORT_TAIL_LINES) {
            ctx.log(&line);
        }
        ctx.log(&format!("missing bitcode: {}", report.failures.join(", ")));

        if report.attempts >= max_attempts {
            break;
        }
        let Some(fix) = fixes.matching(output) else {
            break;
        };
        if !tried.insert(fix.patch.clone()) {
            break;
        }
        ctx.log(&format!("known failure '{}', applying {}", fix.signature, fix.patch.display()));
        if let Err(e) = kernel.apply_fix(ctx, &fix.patch) {
            ctx.log(&format!("fix did not apply: {e}"));
            break;
        }
    }

    tracing::info!(
        attempts = report.attempts,
        copied = report.copied,
        failures = report.failures.len(),
        "bitcode build finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::sync::mpsc;

    use crate::config::FixConfig;
    use crate::exec::ChannelSink;

    fn ctx() -> ExecCtx {
        let (tx, _rx) = mpsc::channel();
        ExecCtx::new(Arc::new(ChannelSink::new(tx)))
    }

    /// Emits bitcode for `emits` on every build; once a fix is applied it
    /// emits `after_fix` as well.
    struct FakeKernel {
        tree: PathBuf,
        emits: Vec<String>,
        after_fix: Vec<String>,
        stderr: String,
        timed_out: bool,
        builds: RefCell<Vec<(Vec<String>, Duration)>>,
        fixed: RefCell<Vec<PathBuf>>,
        configured: RefCell<usize>,
    }

    impl FakeKernel {
        fn new(tree: &Path, emits: &[&str]) -> Self {
            Self {
                tree: tree.to_path_buf(),
                emits: emits.iter().map(|s| s.to_string()).collect(),
                after_fix: Vec::new(),
                stderr: String::new(),
                timed_out: false,
                builds: RefCell::new(Vec::new()),
                fixed: RefCell::new(Vec::new()),
                configured: RefCell::new(0),
            }
        }

        fn emit(&self, rel: &str) {
            let p = self.tree.join(format!("{rel}.bc"));
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"BC").unwrap();
        }
    }

    impl KernelBuild for FakeKernel {
        fn tree(&self) -> &Path {
            &self.tree
        }
        fn clean(&self, _ctx: &ExecCtx) -> Result<()> {
            Ok(())
        }
        fn configure(&self, _ctx: &ExecCtx) -> Result<()> {
            *self.configured.borrow_mut() += 1;
            Ok(())
        }
        fn build(
            &self,
            _ctx: &ExecCtx,
            targets: &[String],
            _jobs: usize,
            timeout: Duration,
        ) -> Result<BuildAttempt> {
            self.builds.borrow_mut().push((targets.to_vec(), timeout));
            for rel in &self.emits {
                self.emit(rel);
            }
            if !self.fixed.borrow().is_empty() {
                for rel in &self.after_fix {
                    self.emit(rel);
                }
            }
            Ok(BuildAttempt {
                ok: false,
                timed_out: self.timed_out,
                error_output: self.stderr.clone(),
            })
        }
        fn apply_fix(&self, _ctx: &ExecCtx, patch: &Path) -> Result<()> {
            self.fixed.borrow_mut().push(patch.to_path_buf());
            Ok(())
        }
    }

    fn files() -> AffectedFiles {
        let mut f = AffectedFiles::new();
        f.insert("net/core".into(), vec!["dev.c".into(), "sock.c".into()]);
        f
    }

    fn cfg() -> BuildConfig {
        BuildConfig {
            jobs: 2,
            timeout_per_target_secs: 10,
            ..BuildConfig::default()
        }
    }

    fn fixes() -> FixTable {
        FixTable::from_config(
            &[FixConfig {
                signature: "implicit declaration of function 'asm_volatile_goto'".into(),
                patch: "asm_volatile_goto.patch".into(),
            }],
            Path::new("/fixes"),
        )
    }

    #[test]
    fn object_targets_swap_suffix() {
        let mut f = files();
        f.insert(String::new(), vec!["top.c".into()]);
        assert_eq!(
            object_targets(&f, ".c", ".o"),
            vec!["top.o".to_string(), "net/core/dev.o".into(), "net/core/sock.o".into()]
        );
    }

    #[test]
    fn successful_build_copies_bitcode_once() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let kernel = FakeKernel::new(tree.path(), &["net/core/dev.c", "net/core/sock.c"]);
        let files = files();
        let modified = vec!["net/core/dev.c".to_string()];
        let job = BitcodeJob {
            files: &files,
            modified: &modified,
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert!(report.failures.is_empty());
        assert_eq!(report.attempts, 1);
        assert_eq!(report.copied, 2);
        assert!(dest.path().join("net/core/dev.c.bc").is_file());
        assert!(dest.path().join("net/core/sock.c.bc").is_file());

        let builds = kernel.builds.borrow();
        assert_eq!(builds[0].0, vec!["net/core/dev.o".to_string(), "net/core/sock.o".into()]);
        assert_eq!(builds[0].1, Duration::from_secs(20));
        assert_eq!(*kernel.configured.borrow(), 1);
    }

    #[test]
    fn known_signature_triggers_one_retry_with_fix() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let mut kernel = FakeKernel::new(tree.path(), &["net/core/sock.c"]);
        kernel.after_fix = vec!["net/core/dev.c".into()];
        kernel.stderr =
            "dev.c:1:1: error: implicit declaration of function 'asm_volatile_goto'\n".into();
        let files = files();
        let modified = vec!["net/core/dev.c".to_string()];
        let job = BitcodeJob {
            files: &files,
            modified: &modified,
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert!(report.failures.is_empty());
        assert_eq!(report.attempts, 2);
        assert_eq!(
            *kernel.fixed.borrow(),
            vec![PathBuf::from("/fixes/asm_volatile_goto.patch")]
        );
    }

    #[test]
    fn unknown_failure_stops_after_first_attempt() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let mut kernel = FakeKernel::new(tree.path(), &["net/core/sock.c"]);
        kernel.stderr = "dev.c:3:7: error: use of undeclared identifier 'x'\n".into();
        let files = files();
        let modified = vec!["net/core/dev.c".to_string(), "net/core/sock.c".to_string()];
        let job = BitcodeJob {
            files: &files,
            modified: &modified,
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert_eq!(report.failures, vec!["net/core/dev.c".to_string()]);
        assert_eq!(report.attempts, 1);
        assert!(kernel.fixed.borrow().is_empty());
        assert!(dest.path().join("net/core/sock.c.bc").is_file());
    }

    #[test]
    fn attempts_are_capped_even_when_signature_persists() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let mut kernel = FakeKernel::new(tree.path(), &[]);
        kernel.stderr = "error: implicit declaration of function 'asm_volatile_goto'".into();
        let files = files();
        let modified = vec!["net/core/dev.c".to_string()];
        let job = BitcodeJob {
            files: &files,
            modified: &modified,
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert!(!report.failures.is_empty());
        assert_eq!(report.attempts, 2);
        assert_eq!(kernel.builds.borrow().len(), 2);
    }

    #[test]
    fn timeout_output_is_not_matched() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let mut kernel = FakeKernel::new(tree.path(), &[]);
        kernel.timed_out = true;
        kernel.stderr = "error: implicit declaration of function 'asm_volatile_goto'".into();
        let files = files();
        let modified = vec!["net/core/dev.c".to_string()];
        let job = BitcodeJob {
            files: &files,
            modified: &modified,
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert_eq!(report.attempts, 1);
        assert!(kernel.fixed.borrow().is_empty());
    }

    #[test]
    fn nothing_to_build_skips_configure() {
        let tree = tempfile::tempdir().expect("tree");
        let dest = tempfile::tempdir().expect("dest");
        let kernel = FakeKernel::new(tree.path(), &[]);
        let files = AffectedFiles::new();
        let job = BitcodeJob {
            files: &files,
            modified: &[],
            dest: dest.path(),
        };
        let report = build_bitcode(&kernel, &ctx(), &cfg(), &fixes(), &job).expect("build");
        assert!(report.failures.is_empty());
        assert_eq!(report.attempts, 0);
        assert_eq!(*kernel.configured.borrow(), 0);
    }
}
