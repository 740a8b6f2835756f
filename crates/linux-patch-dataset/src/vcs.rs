use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::exec::ExecCtx;

/// The version-control operations the pipeline relies on.
pub trait VersionControl {
    fn root(&self) -> &Path;
    fn fetch(&self, ctx: &ExecCtx) -> Result<()>;
    fn checkout(&self, ctx: &ExecCtx, rev: &str) -> Result<()>;
    fn parent_of(&self, rev: &str) -> Result<String>;
    /// Drop uncommitted edits, untracked and ignored files, and stashes.
    fn discard_all(&self, ctx: &ExecCtx) -> Result<()>;
}

/// `git` on the command line against an existing working copy.
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    pub fn open(repo: &Path) -> Result<Self> {
        if !repo.join(".git").exists() {
            return Err(Error::msg(format!(
                "kernel tree is not a git working copy: {}",
                repo.display()
            )));
        }
        Ok(Self {
            repo: repo.to_path_buf(),
        })
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo);
        // Never block on credential prompts in a batch run.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}

impl VersionControl for GitCli {
    fn root(&self) -> &Path {
        &self.repo
    }

    fn fetch(&self, ctx: &ExecCtx) -> Result<()> {
        ctx.log("fetching kernel tree updates...");
        let mut cmd = self.git();
        cmd.arg("fetch").arg("--tags").arg("--prune");
        ctx.run_cmd(cmd)
    }

    fn checkout(&self, ctx: &ExecCtx, rev: &str) -> Result<()> {
        ctx.log(&format!("checking out {rev}"));
        let mut cmd = self.git();
        cmd.arg("checkout").arg("--force").arg("--quiet").arg(rev);
        ctx.run_cmd(cmd)
    }

    fn parent_of(&self, rev: &str) -> Result<String> {
        git_rev_parse(&self.repo, &format!("{rev}^"))
    }

    fn discard_all(&self, ctx: &ExecCtx) -> Result<()> {
        let mut restore = self.git();
        restore.arg("checkout").arg("--").arg(".");
        ctx.run_cmd(restore)?;

        let mut clean = self.git();
        clean.arg("clean").arg("-xdfq");
        ctx.run_cmd(clean)?;

        let mut stash = self.git();
        stash.arg("stash").arg("clear");
        ctx.run_cmd(stash)
    }
}

fn git_rev_parse(repo: &Path, rev: &str) -> Result<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("rev-parse")
        .arg("--verify")
        .arg(format!("{rev}^{{commit}}"))
        .output()
        .map_err(|e| {
            Error::msg(format!(
                "failed to run git rev-parse in {}: {e}",
                repo.display()
            ))
        })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(Error::msg(format!(
            "git rev-parse '{}' failed in {}: {}",
            rev,
            repo.display(),
            stderr.trim()
        )));
    }
    let parsed = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if parsed.is_empty() {
        return Err(Error::msg(format!(
            "git rev-parse '{}' returned empty output in {}",
            rev,
            repo.display()
        )));
    }
    Ok(parsed)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::mpsc;

    use crate::exec::ChannelSink;

    fn ctx() -> ExecCtx {
        let (tx, _rx) = mpsc::channel();
        ExecCtx::new(Arc::new(ChannelSink::new(tx)))
    }

    fn commit_all(repo: &git2::Repository, msg: &str) -> git2::Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("Dev", "dev@example.org").unwrap();
        let parents = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect::<Vec<_>>();
        let parent_refs = parents.iter().collect::<Vec<_>>();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap()
    }

    #[test]
    fn parent_lookup_and_discard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = git2::Repository::init(tmp.path()).expect("init");
        fs::write(tmp.path().join("a.c"), "int a;\n").unwrap();
        let first = commit_all(&repo, "first");
        fs::write(tmp.path().join("a.c"), "int a = 1;\n").unwrap();
        let second = commit_all(&repo, "second");

        let git = GitCli::open(tmp.path()).expect("open");
        assert_eq!(git.parent_of(&second.to_string()).unwrap(), first.to_string());
        assert!(git.parent_of(&first.to_string()).is_err());

        fs::write(tmp.path().join("a.c"), "dirty\n").unwrap();
        fs::write(tmp.path().join("a.c.bc"), "BC").unwrap();
        let ctx = ctx();
        git.discard_all(&ctx).expect("discard");
        assert_eq!(fs::read_to_string(tmp.path().join("a.c")).unwrap(), "int a = 1;\n");
        assert!(!tmp.path().join("a.c.bc").exists());

        git.checkout(&ctx, &first.to_string()).expect("checkout");
        assert_eq!(fs::read_to_string(tmp.path().join("a.c")).unwrap(), "int a;\n");
    }

    #[test]
    fn open_requires_a_working_copy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(GitCli::open(tmp.path()).is_err());
    }
}
