//! Unified diff parsing, enough of it to know which files a kernel patch touches.
//!
//! Accepts `git format-patch` mail (headers and commit message are skipped),
//! plain `git diff` output, and bare `---`/`+++` unified diffs. Hunk bodies are
//! consumed by their line counts so removed lines that happen to start with
//! `-- ` never look like file headers.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::layout::validate_repo_rel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Deleted,
    Modified,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Pre-image path, `None` for added files.
    pub source: Option<String>,
    /// Post-image path, `None` for deleted files.
    pub target: Option<String>,
    pub change: FileChange,
}

impl FileDiff {
    pub fn path(&self) -> &str {
        let p = match self.change {
            FileChange::Deleted => self.source.as_ref().or(self.target.as_ref()),
            _ => self.target.as_ref().or(self.source.as_ref()),
        };
        p.map(String::as_str).unwrap_or_default()
    }

    /// Directory of [`path`](Self::path); a rename counts only where it lands.
    pub fn dir(&self) -> &str {
        parent_dir(self.path())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub files: Vec<FileDiff>,
}

/// What the rest of the pipeline needs from a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchAnalysis {
    pub modified_dirs: BTreeSet<String>,
    /// Compilable files the patch leaves in place; each must yield bitcode.
    pub modified_sources: Vec<String>,
}

/// Path with the final segment removed; the repository root is `""`.
pub fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

pub fn analyze(set: &PatchSet, source_suffix: &str) -> Result<PatchAnalysis> {
    let mut out = PatchAnalysis::default();
    for file in &set.files {
        let dir = file.dir();
        validate_repo_rel(dir)?;
        out.modified_dirs.insert(dir.to_string());
        let path = file.path();
        if file.change != FileChange::Deleted
            && path.ends_with(source_suffix)
            && !out.modified_sources.iter().any(|p| p == path)
        {
            out.modified_sources.push(path.to_string());
        }
    }
    Ok(out)
}

#[derive(Default)]
struct Pending {
    git: bool,
    headers: bool,
    source: Option<String>,
    target: Option<String>,
    added: bool,
    deleted: bool,
    renamed: bool,
}

impl Pending {
    fn finish(self) -> Option<FileDiff> {
        if self.source.is_none() && self.target.is_none() {
            return None;
        }
        let change = if self.added || self.source.is_none() {
            FileChange::Added
        } else if self.deleted || self.target.is_none() {
            FileChange::Deleted
        } else if self.renamed || self.source != self.target {
            FileChange::Renamed
        } else {
            FileChange::Modified
        };
        Some(FileDiff {
            source: if change == FileChange::Added {
                None
            } else {
                self.source
            },
            target: if change == FileChange::Deleted {
                None
            } else {
                self.target
            },
            change,
        })
    }
}

fn git_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^diff --git "?a/(.+?)"? "?b/(.+?)"?$"#).expect("valid regex"))
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -\d+(?:,(\d+))? \+\d+(?:,(\d+))? @@").expect("valid regex")
    })
}

/// `--- a/foo.c\t2024-01-01` → `Some("foo.c")`; `/dev/null` → `None`.
fn header_path(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

pub fn parse(text: &str) -> Result<PatchSet> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files = Vec::new();
    let mut cur: Option<Pending> = None;
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];

        if line.starts_with("diff --git ") {
            if let Some(done) = cur.take().and_then(Pending::finish) {
                files.push(done);
            }
            let caps = git_header_re()
                .captures(line)
                .ok_or_else(|| Error::msg(format!("malformed diff header: {line}")))?;
            cur = Some(Pending {
                git: true,
                source: Some(caps[1].to_string()),
                target: Some(caps[2].to_string()),
                ..Pending::default()
            });
            i += 1;
            continue;
        }

        if line.starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ ")) {
            // Inside a git entry the first `---`/`+++` pair belongs to it; any
            // other pair starts a new file of a bare unified diff.
            let attach = cur.as_ref().is_some_and(|p| p.git && !p.headers);
            if !attach {
                if let Some(done) = cur.take().and_then(Pending::finish) {
                    files.push(done);
                }
            }
            let pending = cur.get_or_insert_with(Pending::default);
            pending.headers = true;
            let source = header_path(&line[4..], "a/");
            let target = header_path(&lines[i + 1][4..], "b/");
            pending.added |= source.is_none();
            pending.deleted |= target.is_none();
            if source.is_some() {
                pending.source = source;
            }
            if target.is_some() {
                pending.target = target;
            }
            i += 2;
            continue;
        }

        // Hunks only count once a file is open; commit messages may quote them.
        if let Some(caps) = cur.as_ref().and_then(|_| hunk_header_re().captures(line)) {
            let count = |m: Option<regex::Match<'_>>| -> Result<usize> {
                match m {
                    None => Ok(1),
                    Some(m) => m
                        .as_str()
                        .parse::<usize>()
                        .map_err(|e| Error::msg(format!("bad hunk count in '{line}': {e}"))),
                }
            };
            let mut old_left = count(caps.get(1))?;
            let mut new_left = count(caps.get(2))?;
            i += 1;
            while old_left > 0 || new_left > 0 {
                let Some(body) = lines.get(i) else {
                    return Err(Error::msg(format!(
                        "truncated hunk: {old_left} old / {new_left} new lines missing"
                    )));
                };
                match body.as_bytes().first() {
                    Some(b'-') => old_left = old_left.saturating_sub(1),
                    Some(b'+') => new_left = new_left.saturating_sub(1),
                    Some(b'\\') => {}
                    // Context; some mailers strip the leading space of blank lines.
                    _ => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                }
                i += 1;
            }
            continue;
        }

        if let Some(p) = cur.as_mut() {
            if line.starts_with("new file mode") {
                p.added = true;
            } else if line.starts_with("deleted file mode") {
                p.deleted = true;
            } else if let Some(from) = line
                .strip_prefix("rename from ")
                .or_else(|| line.strip_prefix("copy from "))
            {
                p.source = Some(from.to_string());
                p.renamed = true;
            } else if let Some(to) = line
                .strip_prefix("rename to ")
                .or_else(|| line.strip_prefix("copy to "))
            {
                p.target = Some(to.to_string());
                p.renamed = true;
            }
        }
        i += 1;
    }

    if let Some(done) = cur.take().and_then(Pending::finish) {
        files.push(done);
    }
    tracing::debug!(files = files.len(), "parsed patch");
    Ok(PatchSet { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT_PATCH: &str = "From 1234abcd Mon Sep 17 00:00:00 2001
From: Dev <dev@example.org>
Subject: [PATCH] net: foo: fix use-after-free

--- is not a header here
Fixes: 0123456789ab (\"net: foo: add driver\")
---
 drivers/net/bar.h | 1 +
 drivers/net/foo.c | 2 +-
 2 files changed, 2 insertions(+), 1 deletion(-)

diff --git a/drivers/net/bar.h b/drivers/net/bar.h
index 111..222 100644
--- a/drivers/net/bar.h
+++ b/drivers/net/bar.h
@@ -1,2 +1,3 @@
 #define A 1
+#define B 2
 #define C 3
diff --git a/drivers/net/foo.c b/drivers/net/foo.c
index 333..444 100644
--- a/drivers/net/foo.c
+++ b/drivers/net/foo.c
@@ -10,3 +10,3 @@ static int foo(void)
 {
--- not a header, a removed line
+	return 0;
 }
--
2.43.0
";

    #[test]
    fn parses_format_patch_mail() {
        let set = parse(FORMAT_PATCH).expect("parse");
        let paths: Vec<&str> = set.files.iter().map(FileDiff::path).collect();
        assert_eq!(paths, vec!["drivers/net/bar.h", "drivers/net/foo.c"]);
        assert!(set.files.iter().all(|f| f.change == FileChange::Modified));

        let a = analyze(&set, ".c").expect("analyze");
        assert_eq!(
            a.modified_dirs.into_iter().collect::<Vec<_>>(),
            vec!["drivers/net".to_string()]
        );
        assert_eq!(a.modified_sources, vec!["drivers/net/foo.c".to_string()]);
    }

    #[test]
    fn deleted_file_contributes_dir_but_not_source() {
        let text = "diff --git a/fs/old/gone.c b/fs/old/gone.c
deleted file mode 100644
index 555..000
--- a/fs/old/gone.c
+++ /dev/null
@@ -1,2 +0,0 @@
-int x;
-int y;
diff --git a/fs/new/made.c b/fs/new/made.c
new file mode 100644
index 000..666
--- /dev/null
+++ b/fs/new/made.c
@@ -0,0 +1 @@
+int z;
";
        let set = parse(text).expect("parse");
        assert_eq!(set.files[0].change, FileChange::Deleted);
        assert_eq!(set.files[0].path(), "fs/old/gone.c");
        assert_eq!(set.files[1].change, FileChange::Added);

        let a = analyze(&set, ".c").expect("analyze");
        assert!(a.modified_dirs.contains("fs/old"));
        assert!(a.modified_dirs.contains("fs/new"));
        assert_eq!(a.modified_sources, vec!["fs/new/made.c".to_string()]);
    }

    #[test]
    fn pure_rename_contributes_only_target_dir() {
        let text = "diff --git a/lib/a.c b/mm/a.c
similarity index 100%
rename from lib/a.c
rename to mm/a.c
";
        let set = parse(text).expect("parse");
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.files[0].change, FileChange::Renamed);
        assert_eq!(set.files[0].path(), "mm/a.c");
        let a = analyze(&set, ".c").expect("analyze");
        assert_eq!(
            a.modified_dirs.into_iter().collect::<Vec<_>>(),
            vec!["mm".to_string()]
        );
        assert_eq!(a.modified_sources, vec!["mm/a.c".to_string()]);
    }

    #[test]
    fn root_level_file_maps_to_empty_dir() {
        let text = "--- a/Makefile\t2024-01-01 00:00:00
+++ b/Makefile\t2024-01-02 00:00:00
@@ -1 +1 @@
-VERSION = 6
+VERSION = 7
--- a/init/main.c
+++ b/init/main.c
@@ -5 +5 @@
-a
+b
";
        let set = parse(text).expect("parse");
        let paths: Vec<&str> = set.files.iter().map(FileDiff::path).collect();
        assert_eq!(paths, vec!["Makefile", "init/main.c"]);
        let a = analyze(&set, ".c").expect("analyze");
        assert!(a.modified_dirs.contains(""));
        assert!(a.modified_dirs.contains("init"));
    }

    #[test]
    fn binary_change_is_kept_from_git_header() {
        let text = "diff --git a/firmware/x.bin b/firmware/x.bin
index 1..2 100644
GIT binary patch
literal 3
KcmZ?wWMBXQ0RR91
";
        let set = parse(text).expect("parse");
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.files[0].path(), "firmware/x.bin");
    }

    #[test]
    fn truncated_hunk_is_an_error() {
        let text = "--- a/x.c
+++ b/x.c
@@ -1,3 +1,3 @@
 a
";
        let err = parse(text).unwrap_err().to_string();
        assert!(err.contains("truncated hunk"), "unexpected err: {err}");
    }

    #[test]
    fn rejects_paths_escaping_the_tree() {
        let text = "--- a/../etc/passwd.c
+++ b/../etc/passwd.c
@@ -1 +1 @@
-a
+b
";
        let set = parse(text).expect("parse");
        assert!(analyze(&set, ".c").is_err());
    }

    #[test]
    fn empty_text_has_no_files() {
        assert_eq!(parse("").expect("parse"), PatchSet::default());
    }
}
