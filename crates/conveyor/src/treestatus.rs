//! Tree status service client.
//!
//! Each repository corresponds to a named tree whose open/closed state is
//! managed externally. A tree is open for landing when its status is
//! `open` or `approval required`; a tree the service does not know about
//! is assumed open.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;

/// Statuses under which landing may proceed.
pub const OPEN_STATUSES: &[&str] = &["open", "approval required"];

/// The tree-status contract the worker and API depend on.
pub trait TreeStatus {
    fn is_open(&self, tree: &str) -> Result<bool>;
    fn healthy(&self) -> Result<()>;
}

/// HTTP client for the tree status service.
#[derive(Debug)]
pub struct TreeStatusClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl TreeStatusClient {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create tree status HTTP client")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl TreeStatus for TreeStatusClient {
    fn is_open(&self, tree: &str) -> Result<bool> {
        if tree.is_empty() {
            bail!("tree must be a non-empty string");
        }

        let url = format!("{}/trees/{tree}", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("tree status request failed for {tree}"))?;

        let status = response.status();
        // Missing trees are open by convention.
        if status.as_u16() == 404 || status.as_u16() == 400 {
            return Ok(true);
        }
        if !status.is_success() {
            bail!("tree status returned {status} for {tree}");
        }

        let body: Value = response
            .json()
            .with_context(|| format!("tree status returned non-JSON for {tree}"))?;
        let state = body
            .pointer("/result/status")
            .and_then(Value::as_str)
            .with_context(|| format!("tree status response for {tree} missing result.status"))?;

        Ok(OPEN_STATUSES.contains(&state))
    }

    fn healthy(&self) -> Result<()> {
        let url = format!("{}/trees", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .context("tree status ping failed")?;
        if !response.status().is_success() {
            bail!("tree status ping returned {}", response.status());
        }
        Ok(())
    }
}
