use std::time::Duration;

use crate::config::PatchConfig;
use crate::error::{Error, Result};
use crate::layout::expand_commit_template;

/// Where patches come from. Bodies are raw bytes; kernel mail is not always UTF-8.
pub trait PatchSource {
    /// Any failure here is fatal for the run: without the patch nothing
    /// downstream is meaningful.
    fn fetch(&self, commit: &str) -> Result<Vec<u8>>;
}

pub struct HttpPatchSource {
    client: reqwest::blocking::Client,
    url_template: String,
}

impl HttpPatchSource {
    pub fn new(cfg: &PatchConfig) -> Result<Self> {
        if !cfg.url_template.contains("{commit}") {
            return Err(Error::msg(format!(
                "patch.url_template '{}' has no {{commit}} placeholder",
                cfg.url_template
            )));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url_template: cfg.url_template.clone(),
        })
    }

    pub fn url_for(&self, commit: &str) -> String {
        expand_commit_template(&self.url_template, commit)
    }
}

impl PatchSource for HttpPatchSource {
    fn fetch(&self, commit: &str) -> Result<Vec<u8>> {
        let url = self.url_for(commit);
        tracing::debug!(%url, "downloading patch");
        let res = self.client.get(&url).send().map_err(|e| {
            Error::patch_unavailable(format!("failed to download patch {commit}: {e}"))
        })?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(Error::patch_unavailable(format!(
                "failed to download patch {commit}: HTTP {}",
                res.status()
            )));
        }
        let body = res.bytes().map_err(|e| {
            Error::patch_unavailable(format!("failed to read patch body for {commit}: {e}"))
        })?;
        Ok(body.to_vec())
    }
}
