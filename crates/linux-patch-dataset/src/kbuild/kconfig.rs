//! Edits on a generated kernel `.config`.

use crate::error::{Error, Result};

/// Text between the first and second occurrence of `marker` (or to the end).
pub fn section_after<'a>(cfg: &'a str, marker: &str) -> Result<&'a str> {
    let Some((_, rest)) = cfg.split_once(marker) else {
        return Err(Error::msg(format!("config has no '{marker}' section")));
    };
    Ok(rest.split_once(marker).map(|(s, _)| s).unwrap_or(rest))
}

/// Everything before the first `marker`.
pub fn section_before<'a>(cfg: &'a str, marker: &str) -> Result<&'a str> {
    cfg.split_once(marker)
        .map(|(head, _)| head)
        .ok_or_else(|| Error::msg(format!("config has no '{marker}' section")))
}

/// The maximal config up to `marker`, followed by the baseline's section from
/// `marker` on. allyesconfig turns on debugging options that break or slow
/// the build; defconfig's kernel-hacking choices are kept instead.
pub fn splice_section(maximal: &str, baseline: &str, marker: &str) -> Result<String> {
    let head = section_before(maximal, marker)?;
    let tail = section_after(baseline, marker)?;
    Ok(format!("{head}{marker}{tail}"))
}

fn symbol_of(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("# ") {
        return rest.strip_suffix(" is not set");
    }
    line.split_once('=').map(|(k, _)| k)
}

/// Disable `key` and every `key_*` sub-option in place.
pub fn disable_symbol(cfg: &mut String, key: &str) {
    let child_prefix = format!("{key}_");
    let mut out = Vec::new();
    for line in cfg.lines() {
        match symbol_of(line) {
            Some(sym) if sym == key || sym.starts_with(&child_prefix) => {
                out.push(format!("# {sym} is not set"));
            }
            _ => out.push(line.to_string()),
        }
    }
    *cfg = out.join("\n");
    if !cfg.ends_with('\n') {
        cfg.push('\n');
    }
}
