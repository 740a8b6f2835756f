use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use linux_patch_dataset::config::{self, BeforeBuildPolicy, DatasetConfig};
use linux_patch_dataset::dataset::{self, DatapointMaker, MakeOptions};
use linux_patch_dataset::exec::{self, ExecCtx, StdoutSink};
use linux_patch_dataset::kbuild::{KconfigPlan, MakeKernel};
use linux_patch_dataset::layout::DatasetLayout;
use linux_patch_dataset::patch::{self, HttpPatchSource, PatchSource};
use linux_patch_dataset::vcs::GitCli;
use linux_patch_dataset::{Error, Result, consolidate, history};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Configuration TOML (supports `extends`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write diagnostics to stderr as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build before/after bitcode datapoints for one commit or a list of them
    Make {
        /// Commit id of the patch
        #[arg(required_unless_present = "file")]
        commit: Option<String>,
        /// File listing commit ids, one per line
        #[arg(long, conflicts_with = "commit")]
        file: Option<PathBuf>,
        /// Kernel working copy
        #[arg(long)]
        linux_dir: Option<String>,
        /// Dataset output directory
        #[arg(long)]
        data_dir: Option<String>,
        /// Append-only failure log
        #[arg(long)]
        error_file: Option<String>,
        /// Fetch, analyze and check out, but build nothing
        #[arg(long)]
        skip_compile: bool,
        /// Reprocess commits even when a record exists
        #[arg(long)]
        rebuild_all: bool,
        /// Reprocess commits that were attempted but never recorded
        #[arg(long)]
        rebuild_fail: bool,
        /// When to build the parent commit: after-success or always
        #[arg(long, value_parser = parse_policy)]
        before_build: Option<BeforeBuildPolicy>,
        /// Fetch the kernel tree's remote before the first commit
        #[arg(long)]
        fetch: bool,
    },
    /// Copy every recorded datapoint into the curated directory
    Collect {
        #[arg(long)]
        data_dir: Option<String>,
        #[arg(long)]
        meta_dir: Option<String>,
    },
    /// List commits after a date whose message carries a marker
    Scan {
        /// Repository to walk
        #[arg(long)]
        repo: Option<String>,
        /// Cutoff day, YYYY-MM-DD (UTC)
        #[arg(long)]
        since: Option<String>,
        /// Substring to look for in commit messages
        #[arg(long)]
        marker: Option<String>,
        /// Skip fetching origin first
        #[arg(long)]
        no_fetch: bool,
        /// Also write the matching ids here, one per line
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show which files and directories a patch touches
    Analyze {
        /// Commit id to download
        #[arg(required_unless_present = "patch")]
        commit: Option<String>,
        /// Read the patch from a file instead
        #[arg(long, conflicts_with = "commit")]
        patch: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    ResolveConfig,
}

fn parse_policy(raw: &str) -> std::result::Result<BeforeBuildPolicy, String> {
    match raw {
        "after-success" => Ok(BeforeBuildPolicy::AfterSuccess),
        "always" => Ok(BeforeBuildPolicy::Always),
        other => Err(format!("unknown policy '{other}' (after-success | always)")),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_fatal() {
                println!("[-] Failed to download patch");
            }
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut cfg = load_config(args.config.as_deref())?;
    match args.cmd {
        Command::Make {
            commit,
            file,
            linux_dir,
            data_dir,
            error_file,
            skip_compile,
            rebuild_all,
            rebuild_fail,
            before_build,
            fetch,
        } => {
            if let Some(v) = linux_dir {
                cfg.paths.linux_dir = v;
            }
            if let Some(v) = data_dir {
                cfg.paths.data_dir = v;
            }
            if let Some(v) = error_file {
                cfg.paths.error_log = v;
            }
            if let Some(v) = before_build {
                cfg.build.before_build = v;
            }
            cfg.build.sync_remote |= fetch;
            let opts = MakeOptions {
                skip_compile,
                rebuild_all,
                rebuild_fail,
            };
            cmd_make(&cfg, commit, file.as_deref(), opts)
        }
        Command::Collect { data_dir, meta_dir } => {
            if let Some(v) = data_dir {
                cfg.paths.data_dir = v;
            }
            if let Some(v) = meta_dir {
                cfg.paths.meta_dir = v;
            }
            cmd_collect(&cfg)
        }
        Command::Scan {
            repo,
            since,
            marker,
            no_fetch,
            out,
        } => {
            if let Some(v) = repo {
                cfg.scan.repo = v;
            }
            if let Some(v) = since {
                cfg.scan.since = v;
            }
            if let Some(v) = marker {
                cfg.scan.marker = v;
            }
            if no_fetch {
                cfg.scan.fetch = false;
            }
            cmd_scan(&cfg, out.as_deref())
        }
        Command::Analyze { commit, patch } => cmd_analyze(&cfg, commit, patch.as_deref()),
        Command::ResolveConfig => {
            print!("{}", cfg.to_toml()?);
            Ok(())
        }
    }
}

/// Defaults, then the file, then `LPD_*` variables. Flags are applied by the caller.
fn load_config(path: Option<&Path>) -> Result<DatasetConfig> {
    let doc = match path {
        Some(p) => config::load(p)?,
        None => config::ConfigDoc::empty(),
    };
    let mut cfg = DatasetConfig::from_doc(&doc)?;
    cfg.apply_env();
    Ok(cfg)
}

fn cmd_make(
    cfg: &DatasetConfig,
    commit: Option<String>,
    file: Option<&Path>,
    opts: MakeOptions,
) -> Result<()> {
    let layout = DatasetLayout::resolve(&cfg.paths)?;
    let commits = match (file, commit) {
        (Some(f), _) => dataset::read_commit_list(f)?,
        (None, Some(c)) => vec![c.trim().to_string()],
        (None, None) => return Err(Error::msg("give a commit id or --file")),
    };

    println!("[+] DataPoint Maker");
    let source = HttpPatchSource::new(&cfg.patch)?;
    let vcs = GitCli::open(&layout.linux_dir)?;
    let kernel = MakeKernel::new(
        &layout.linux_dir,
        &cfg.toolchain,
        KconfigPlan::from_build(&cfg.build),
    );
    tracing::info!(
        cc = %cfg.toolchain.cc,
        jobs = cfg.build.effective_jobs(),
        policy = cfg.build.before_build.as_str(),
        "toolchain"
    );

    exec::interrupt::install();
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(sink);
    let maker = DatapointMaker::new(&source, &vcs, &kernel, &layout, cfg, opts);
    let summary = dataset::run_batch(&maker, &mut ctx, &commits, cfg.build.sync_remote)?;
    tracing::info!(
        complete = summary.complete,
        failed = summary.failed,
        skipped = summary.skipped,
        error_log = %maker.errors().path().display(),
        "batch finished"
    );
    Ok(())
}

fn cmd_collect(cfg: &DatasetConfig) -> Result<()> {
    let layout = DatasetLayout::resolve(&cfg.paths)?;
    let total = consolidate::consolidate(&layout.data_dir, &layout.meta_dir)?;
    println!("Total: {total}");
    Ok(())
}

fn cmd_scan(cfg: &DatasetConfig, out: Option<&Path>) -> Result<()> {
    let layout = DatasetLayout::resolve(&cfg.paths)?;
    let opts = history::ScanOptions {
        repo: layout.rooted(&cfg.scan.repo)?,
        since: history::parse_since(&cfg.scan.since)?,
        marker: cfg.scan.marker.clone(),
        fetch: cfg.scan.fetch,
    };
    let found = history::scan(&opts)?;
    for c in &found {
        println!("{}", c.line());
    }
    if let Some(p) = out {
        history::write_hashes(p, &found)?;
    }
    Ok(())
}

fn cmd_analyze(cfg: &DatasetConfig, commit: Option<String>, patch_file: Option<&Path>) -> Result<()> {
    let body = match (patch_file, commit) {
        (Some(p), _) => std::fs::read(p)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))?,
        (None, Some(c)) => {
            println!("[+] Checking patch {c}");
            HttpPatchSource::new(&cfg.patch)?.fetch(c.trim())?
        }
        (None, None) => return Err(Error::msg("give a commit id or --patch")),
    };

    let set = patch::diff::parse(&String::from_utf8_lossy(&body))?;
    let analysis = patch::diff::analyze(&set, &cfg.build.source_suffix)?;
    for f in &set.files {
        println!("[+] Modified file {} ({:?})", f.path(), f.change);
    }
    let dirs = analysis
        .modified_dirs
        .iter()
        .map(|d| if d.is_empty() { "." } else { d.as_str() })
        .collect::<Vec<_>>();
    println!("[+] Modified folders: {}", dirs.join(", "));
    println!(
        "[+] Compilable sources: {}",
        analysis.modified_sources.join(", ")
    );
    Ok(())
}
