use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_PATCH_URL: &str =
    "https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/patch/?id={commit}";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base = PathBuf::from(ext);
        let base = if base.is_absolute() {
            base
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(base)
        };
        out = load_value_inner(&base, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub paths: PathsConfig,
    pub patch: PatchConfig,
    pub toolchain: ToolchainConfig,
    pub build: BuildConfig,
    pub scan: ScanConfig,
}

impl DatasetConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("")?.unwrap_or_default())
    }

    /// `LPD_CC` and `LPD_LINUX_DIR` win over the file but lose to flags.
    pub fn apply_env(&mut self) {
        if let Some(cc) = env_nonempty("LPD_CC") {
            self.toolchain.cc = cc;
        }
        if let Some(dir) = env_nonempty("LPD_LINUX_DIR") {
            self.paths.linux_dir = dir;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::msg(format!("toml encode error: {e}")))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: String,
    pub linux_dir: String,
    pub data_dir: String,
    pub meta_dir: String,
    pub error_log: String,
    pub fixes_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: ".".into(),
            linux_dir: "linux".into(),
            data_dir: "data".into(),
            meta_dir: "meta".into(),
            error_log: "err.log".into(),
            fixes_dir: "config".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    pub url_template: String,
    pub file_name: String,
    pub timeout_secs: u64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_PATCH_URL.into(),
            file_name: "patch.diff".into(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub cc: String,
    pub make: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let cc = std::env::var("HOME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .map(|h| {
                Path::new(&h)
                    .join("llvm-project/build/bin/clang")
                    .display()
                    .to_string()
            })
            .unwrap_or_else(|| "clang".into());
        Self {
            cc,
            make: "make".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeforeBuildPolicy {
    /// Build the parent only when every modified source compiled at the child.
    #[default]
    AfterSuccess,
    /// Always build both sides and log both failure sets.
    Always,
}

impl BeforeBuildPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            BeforeBuildPolicy::AfterSuccess => "after-success",
            BeforeBuildPolicy::Always => "always",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixConfig {
    pub signature: String,
    pub patch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub jobs: usize,
    pub timeout_per_target_secs: u64,
    pub kernel_hacking_marker: String,
    pub disabled_symbols: Vec<String>,
    pub normalize_target: String,
    pub source_suffix: String,
    pub object_suffix: String,
    pub bitcode_suffix: String,
    pub before_build: BeforeBuildPolicy,
    pub max_attempts: usize,
    pub sync_remote: bool,
    pub fixes: Vec<FixConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            timeout_per_target_secs: 300,
            kernel_hacking_marker: "# Kernel hacking".into(),
            disabled_symbols: vec!["CONFIG_DTC".into(), "CONFIG_OF".into()],
            normalize_target: "olddefconfig".into(),
            source_suffix: ".c".into(),
            object_suffix: ".o".into(),
            bitcode_suffix: ".bc".into(),
            before_build: BeforeBuildPolicy::AfterSuccess,
            max_attempts: 2,
            sync_remote: false,
            fixes: crate::kbuild::fixes::default_fix_configs(),
        }
    }
}

impl BuildConfig {
    /// Parallelism handed to make: never more than half the CPUs; `0` means the cap.
    pub fn effective_jobs(&self) -> usize {
        let cap = (num_cpus::get() / 2).max(1);
        match self.jobs {
            0 => cap,
            n => n.min(cap),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub repo: String,
    pub marker: String,
    pub since: String,
    pub fetch: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            repo: "linux-next".into(),
            marker: "Fixes:".into(),
            since: "2023-01-01".into(),
            fetch: true,
        }
    }
}
