//! Bug tracker client and the post-landing uplift bug updates.
//!
//! After an uplift lands, every bug referenced by the pushed commits gets
//! its milestone status flag set to `fixed` (unless `leave-open` says
//! otherwise) and any `[checkin-needed-*]` whiteboard token removed.
//! Updates retry with a linear backoff; the push has already happened, so
//! giving up only means a human finishes the bookkeeping.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_retry::{RetryStrategyConfig, retry_with};

use crate::commit_message::parse_bugs;

pub const BUG_UPDATE_RETRIES: u32 = 3;

/// A bug as returned by the tracker's REST API. Status flags such as
/// `cf_status_firefox140` vary by product, so unknown fields are kept in
/// `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bug {
    pub id: i64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub whiteboard: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A bug update payload: `{"ids": [...], "<field>": <value>, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugUpdate {
    pub ids: Vec<i64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// The bug tracker contract.
pub trait BugTracker {
    fn get_bugs(&self, ids: &[i64]) -> Result<Vec<Bug>>;
    fn update_bug(&self, update: &BugUpdate) -> Result<()>;
    fn healthy(&self) -> Result<()>;
}

/// HTTP client for the tracker's REST API.
#[derive(Debug)]
pub struct BugTrackerClient {
    url: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl BugTrackerClient {
    pub fn new(url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create bug tracker HTTP client")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }
}

impl BugTracker for BugTrackerClient {
    fn get_bugs(&self, ids: &[i64]) -> Result<Vec<Bug>> {
        let ids = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/rest/bug", self.url);
        let response = self
            .client
            .get(&url)
            .query(&[("id", ids.as_str())])
            .header("X-Bugzilla-API-Key", &self.api_key)
            .send()
            .context("bug fetch request failed")?;
        if !response.status().is_success() {
            bail!("bug fetch returned {}", response.status());
        }

        #[derive(Deserialize)]
        struct Bugs {
            bugs: Vec<Bug>,
        }
        let body: Bugs = response.json().context("bug fetch returned non-JSON")?;
        Ok(body.bugs)
    }

    fn update_bug(&self, update: &BugUpdate) -> Result<()> {
        if update.ids.is_empty() {
            bail!("bug update requires at least one bug id");
        }
        let url = format!("{}/rest/bug/{}", self.url, update.ids[0]);
        let response = self
            .client
            .put(&url)
            .header("X-Bugzilla-API-Key", &self.api_key)
            .json(update)
            .send()
            .context("bug update request failed")?;
        if !response.status().is_success() {
            bail!("bug update returned {}", response.status());
        }
        Ok(())
    }

    fn healthy(&self) -> Result<()> {
        let url = format!("{}/rest/version", self.url);
        let response = self.client.get(&url).send().context("bug tracker ping failed")?;
        if !response.status().is_success() {
            bail!("bug tracker ping returned {}", response.status());
        }
        Ok(())
    }
}

/// Parse the milestone major version out of a checkout's `milestone.txt`
/// (last non-empty line, e.g. `140.0a1` -> 140).
pub fn parse_milestone(content: &str) -> Result<u32> {
    let line = content
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .context("milestone file has no version line")?;
    let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .with_context(|| format!("milestone line {line:?} has no leading version number"))
}

/// Build the update for one bug, or `None` when there is nothing to change.
pub fn create_uplift_bug_update_payload(
    bug: &Bug,
    repo_name: &str,
    milestone: u32,
    flag_template: Option<&str>,
) -> Option<BugUpdate> {
    let mut fields = BTreeMap::new();

    let flag = flag_template
        .unwrap_or("cf_status_firefox{milestone}")
        .replace("{milestone}", &milestone.to_string());
    // Only flip the status flag when the bug actually carries it and is
    // not intentionally kept open.
    if !bug.keywords.iter().any(|k| k == "leave-open") && bug.extra.contains_key(&flag) {
        fields.insert(flag, Value::String("fixed".to_string()));
    }

    let checkin_token = format!("[checkin-needed-{repo_name}]");
    if bug.whiteboard.contains(&checkin_token) {
        fields.insert(
            "whiteboard".to_string(),
            Value::String(bug.whiteboard.replace(&checkin_token, "")),
        );
    }

    if fields.is_empty() {
        return None;
    }
    Some(BugUpdate {
        ids: vec![bug.id],
        fields,
    })
}

/// Update every bug referenced by the landed changeset titles.
pub fn update_bugs_for_uplift(
    tracker: &dyn BugTracker,
    changeset_titles: &[String],
    repo_name: &str,
    milestone: u32,
    flag_template: Option<&str>,
) -> Result<()> {
    let retry = RetryStrategyConfig::linear(BUG_UPDATE_RETRIES, Duration::from_secs(1));
    update_bugs_with_retry(tracker, changeset_titles, repo_name, milestone, flag_template, &retry)
}

fn update_bugs_with_retry(
    tracker: &dyn BugTracker,
    changeset_titles: &[String],
    repo_name: &str,
    milestone: u32,
    flag_template: Option<&str>,
    retry: &RetryStrategyConfig,
) -> Result<()> {
    let mut bug_ids: Vec<i64> = Vec::new();
    for title in changeset_titles {
        for bug in parse_bugs(title) {
            if !bug_ids.contains(&bug) {
                bug_ids.push(bug);
            }
        }
    }
    if bug_ids.is_empty() {
        return Ok(());
    }

    for bug in tracker.get_bugs(&bug_ids)? {
        let Some(update) = create_uplift_bug_update_payload(&bug, repo_name, milestone, flag_template)
        else {
            continue;
        };
        retry_with(retry, |_attempt| tracker.update_bug(&update))?;
    }
    Ok(())
}
