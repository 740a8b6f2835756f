//! Known toolchain incompatibilities and the source patches that work around them.
//!
//! Matching is a plain substring search over the build's error output. The
//! table is data: new entries go in `[[build.fixes]]`, not in the retry loop.

use std::path::{Path, PathBuf};

use crate::config::FixConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFailure {
    pub signature: String,
    pub patch: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct FixTable {
    entries: Vec<KnownFailure>,
}

pub fn default_fix_configs() -> Vec<FixConfig> {
    vec![
        FixConfig {
            signature: "implicit declaration of function 'asm_volatile_goto'".into(),
            patch: "asm_volatile_goto.patch".into(),
        },
        FixConfig {
            signature: "#error New address family defined, please update secclass_map".into(),
            patch: "secclass_map.patch".into(),
        },
    ]
}

impl FixTable {
    /// Relative patch paths are looked up in `fixes_dir`.
    pub fn from_config(fixes: &[FixConfig], fixes_dir: &Path) -> Self {
        let entries = fixes
            .iter()
            .filter(|f| !f.signature.is_empty())
            .map(|f| {
                let p = PathBuf::from(&f.patch);
                KnownFailure {
                    signature: f.signature.clone(),
                    patch: if p.is_absolute() { p } else { fixes_dir.join(p) },
                }
            })
            .collect();
        Self { entries }
    }

    /// First entry, in table order, whose signature occurs in `output`.
    pub fn matching(&self, output: &str) -> Option<&KnownFailure> {
        self.entries.iter().find(|e| output.contains(&e.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FixTable {
        FixTable::from_config(&default_fix_configs(), Path::new("/opt/lpd/config"))
    }

    #[test]
    fn matches_asm_volatile_goto_diagnostic() {
        let out = "arch/x86/include/asm/jump_label.h:27:2: error: implicit declaration of function 'asm_volatile_goto' [-Werror,-Wimplicit-function-declaration]";
        let t = table();
        let hit = t.matching(out).expect("match");
        assert_eq!(hit.patch, PathBuf::from("/opt/lpd/config/asm_volatile_goto.patch"));
    }

    #[test]
    fn matches_secclass_map_error() {
        let out = "security/selinux/include/classmap.h:259:2: error: #error New address family defined, please update secclass_map.";
        let t = table();
        let hit = t.matching(out).expect("match");
        assert_eq!(hit.patch, PathBuf::from("/opt/lpd/config/secclass_map.patch"));
    }

    #[test]
    fn unrelated_errors_do_not_match() {
        let t = table();
        assert!(t.matching("error: use of undeclared identifier 'foo'").is_none());
        assert!(t.matching("").is_none());
    }

    #[test]
    fn absolute_patch_paths_are_kept() {
        let t = FixTable::from_config(
            &[FixConfig {
                signature: "boom".into(),
                patch: "/srv/fixes/boom.patch".into(),
            }],
            Path::new("/ignored"),
        );
        assert_eq!(t.matching("boom").unwrap().patch, PathBuf::from("/srv/fixes/boom.patch"));
    }
}
