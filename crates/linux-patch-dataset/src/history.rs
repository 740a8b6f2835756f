//! Candidate commits from a kernel repository's recent history.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate};
use git2::{Repository, Sort};

use crate::error::{Error, Result};
use crate::layout::write_file;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo: PathBuf,
    /// Commits at or before UTC midnight of this day end the walk.
    pub since: NaiveDate,
    pub marker: String,
    pub fetch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixCommit {
    /// Committer date in the committer's own offset.
    pub date: NaiveDate,
    pub id: String,
}

impl FixCommit {
    pub fn line(&self) -> String {
        format!("{} {}", self.date.format("%Y-%m-%d"), self.id)
    }
}

pub fn parse_since(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| Error::msg(format!("invalid date '{raw}' (expected YYYY-MM-DD): {e}")))
}

fn cutoff_secs(since: NaiveDate) -> i64 {
    since
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

fn commit_date(time: git2::Time) -> Result<NaiveDate> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)
        .ok_or_else(|| Error::msg(format!("bad commit offset {}", time.offset_minutes())))?;
    let utc = DateTime::from_timestamp(time.seconds(), 0)
        .ok_or_else(|| Error::msg(format!("bad commit time {}", time.seconds())))?;
    Ok(utc.with_timezone(&offset).date_naive())
}

pub fn fetch_origin(repo: &Repository) -> Result<()> {
    let mut origin = repo.find_remote("origin")?;
    origin.fetch(&[] as &[&str], None, None)?;
    Ok(())
}

/// Walk from HEAD newest first and collect commits whose message contains
/// the marker, stopping at the first commit not newer than the cutoff.
pub fn scan(opts: &ScanOptions) -> Result<Vec<FixCommit>> {
    let repo = Repository::open(&opts.repo).map_err(|e| {
        Error::msg(format!("failed to open repository {}: {e}", opts.repo.display()))
    })?;
    if opts.fetch {
        tracing::info!(repo = %opts.repo.display(), "fetching origin");
        fetch_origin(&repo)?;
    }

    let cutoff = cutoff_secs(opts.since);
    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;
    revwalk.set_sorting(Sort::TIME)?;

    let mut out = Vec::new();
    let mut walked = 0usize;
    for oid in revwalk {
        let commit = repo.find_commit(oid?)?;
        let time = commit.committer().when();
        if time.seconds() <= cutoff {
            break;
        }
        walked += 1;
        if commit.message_raw().is_some_and(|m| m.contains(&opts.marker)) {
            out.push(FixCommit {
                date: commit_date(time)?,
                id: commit.id().to_string(),
            });
        }
    }
    tracing::info!(walked, matched = out.len(), "history scan finished");
    Ok(out)
}

/// One hash per line, ready to feed back as a commit list.
pub fn write_hashes(path: &Path, commits: &[FixCommit]) -> Result<()> {
    let mut s = String::new();
    for c in commits {
        let _ = writeln!(s, "{}", c.id);
    }
    write_file(path, &s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn commit_at(repo: &Repository, msg: &str, secs: i64, offset_min: i32) -> git2::Oid {
        fs::write(repo.workdir().unwrap().join("f.c"), msg).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("f.c")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::new("Dev", "dev@example.org", &git2::Time::new(secs, offset_min))
            .unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents = parent.iter().collect::<Vec<_>>();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parents)
            .unwrap()
    }

    // 2022-12-31T12:00Z, 2023-01-01T00:00Z, 2023-02-01T00:00Z, 2023-03-01T00:00Z
    const OLD: i64 = 1_672_488_000;
    const MIDNIGHT: i64 = 1_672_531_200;
    const FEB: i64 = 1_675_209_600;
    const MAR: i64 = 1_677_628_800;

    #[test]
    fn collects_marked_commits_newer_than_cutoff() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = Repository::init(tmp.path()).expect("init");
        commit_at(&repo, "old fix\n\nFixes: 1234 (\"x\")", OLD, 0);
        commit_at(&repo, "boundary\n\nFixes: 5678 (\"y\")", MIDNIGHT, 0);
        let feb = commit_at(&repo, "net: fix leak\n\nFixes: 9abc (\"z\")", FEB, 0);
        commit_at(&repo, "docs: typo", MAR - 60, 0);
        let mar = commit_at(&repo, "mm: fix\n\nFixes: def0 (\"w\")", MAR, -300);

        let opts = ScanOptions {
            repo: tmp.path().to_path_buf(),
            since: parse_since("2023-01-01").unwrap(),
            marker: "Fixes:".into(),
            fetch: false,
        };
        let got = scan(&opts).expect("scan");
        let lines = got.iter().map(FixCommit::line).collect::<Vec<_>>();
        // -05:00 puts the March commit on the last day of February.
        assert_eq!(
            lines,
            vec![format!("2023-02-28 {mar}"), format!("2023-02-01 {feb}")]
        );

        let out = tmp.path().join("out/candidates.txt");
        write_hashes(&out, &got).expect("write");
        assert_eq!(fs::read_to_string(out).unwrap(), format!("{mar}\n{feb}\n"));
    }

    #[test]
    fn fetch_without_origin_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = Repository::init(tmp.path()).expect("init");
        commit_at(&repo, "init", MAR, 0);
        let opts = ScanOptions {
            repo: tmp.path().to_path_buf(),
            since: parse_since("2023-01-01").unwrap(),
            marker: "Fixes:".into(),
            fetch: true,
        };
        assert!(scan(&opts).is_err());
    }

    #[test]
    fn rejects_malformed_since() {
        assert!(parse_since("01/01/2023").is_err());
        assert_eq!(cutoff_secs(parse_since(" 2023-01-01 ").unwrap()), MIDNIGHT);
    }
}
