//! The code-review service contract.
//!
//! The core only ever talks to the review service through the
//! [`ReviewService`] trait; [`ConduitClient`] is the HTTP implementation
//! of that contract. Tests substitute an in-memory fake.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};

use crate::types::{DiffId, Phid, RevisionId};

/// Status of a revision in the review service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionStatus {
    Accepted,
    NeedsReview,
    NeedsRevision,
    ChangesPlanned,
    Draft,
    Abandoned,
    Published,
}

impl RevisionStatus {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "accepted" => RevisionStatus::Accepted,
            "needs-review" => RevisionStatus::NeedsReview,
            "needs-revision" => RevisionStatus::NeedsRevision,
            "changes-planned" => RevisionStatus::ChangesPlanned,
            "draft" => RevisionStatus::Draft,
            "abandoned" => RevisionStatus::Abandoned,
            _ => RevisionStatus::Published,
        }
    }

    /// Closed revisions cannot land and are walked through when looking
    /// for stack roots.
    pub fn closed(self) -> bool {
        matches!(self, RevisionStatus::Abandoned | RevisionStatus::Published)
    }

    pub fn output_name(self) -> &'static str {
        match self {
            RevisionStatus::Accepted => "Accepted",
            RevisionStatus::NeedsReview => "Needs Review",
            RevisionStatus::NeedsRevision => "Needs Revision",
            RevisionStatus::ChangesPlanned => "Changes Planned",
            RevisionStatus::Draft => "Draft",
            RevisionStatus::Abandoned => "Abandoned",
            RevisionStatus::Published => "Closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewerStatus {
    Accepted,
    Added,
    Blocking,
    Commented,
    Rejected,
    Resigned,
}

impl ReviewerStatus {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "accepted" => ReviewerStatus::Accepted,
            "blocking" => ReviewerStatus::Blocking,
            "commented" => ReviewerStatus::Commented,
            "rejected" => ReviewerStatus::Rejected,
            "resigned" => ReviewerStatus::Resigned,
            _ => ReviewerStatus::Added,
        }
    }

    /// Whether this review state is intended to prevent landings.
    pub fn blocks_landing(self) -> bool {
        matches!(self, ReviewerStatus::Blocking | ReviewerStatus::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct Reviewer {
    pub phid: Phid,
    pub status: ReviewerStatus,
    /// The diff the reviewer's current state applies to.
    pub diff_phid: Option<Phid>,
}

impl Reviewer {
    /// An accept given on an earlier diff does not carry forward.
    pub fn accepted_current_diff(&self, current_diff: &Phid) -> bool {
        self.status == ReviewerStatus::Accepted
            && self.diff_phid.as_ref() == Some(current_diff)
    }
}

/// The view of a revision the landing pipeline needs.
#[derive(Debug, Clone)]
pub struct Revision {
    pub id: RevisionId,
    pub phid: Phid,
    pub title: String,
    pub summary: String,
    pub bug_id: Option<i64>,
    pub status: RevisionStatus,
    pub repository_phid: Option<Phid>,
    /// The revision's current diff. A request naming an older diff is stale.
    pub diff_phid: Phid,
    pub author_phid: Phid,
    pub projects: Vec<Phid>,
    pub reviewers: Vec<Reviewer>,
    /// Content of the uplift request form, when one was submitted.
    pub uplift_request: Option<String>,
    /// Unix seconds of the revision's last modification; used as the
    /// author date on generated patches.
    pub date_modified: i64,
}

#[derive(Debug, Clone)]
pub struct DiffCommit {
    pub identifier: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Diff {
    pub id: DiffId,
    pub phid: Phid,
    pub revision_phid: Phid,
    pub base_commit_hash: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub commits: Vec<DiffCommit>,
}

#[derive(Debug, Clone)]
pub struct Repository {
    pub phid: Phid,
    pub short_name: String,
}

/// Batched revision/diff/repository data for one stack.
#[derive(Debug, Clone, Default)]
pub struct StackData {
    pub revisions: BTreeMap<Phid, Revision>,
    pub diffs: BTreeMap<Phid, Diff>,
    pub repositories: BTreeMap<Phid, Repository>,
}

impl StackData {
    pub fn revision_by_id(&self, id: RevisionId) -> Option<&Revision> {
        self.revisions.values().find(|r| r.id == id)
    }

    pub fn diff_for(&self, revision: &Revision) -> Option<&Diff> {
        self.diffs.get(&revision.diff_phid)
    }
}

/// Pick the author recorded on a diff, falling back to the first commit's
/// author metadata.
pub fn select_diff_author(diff: &Diff) -> (Option<String>, Option<String>) {
    if diff.author_name.is_some() || diff.author_email.is_some() {
        return (diff.author_name.clone(), diff.author_email.clone());
    }
    match diff.commits.first() {
        Some(commit) => (commit.author_name.clone(), commit.author_email.clone()),
        None => (None, None),
    }
}

/// Everything the landing pipeline asks of the review service.
pub trait ReviewService {
    /// Resolve a revision id to its PHID, or `None` when it does not exist
    /// or permissions withhold it.
    fn find_revision(&self, id: RevisionId) -> Result<Option<Phid>>;

    /// All `(child, parent)` revision edges touching any of `phids`.
    fn related_edges(&self, phids: &[Phid]) -> Result<Vec<(Phid, Phid)>>;

    /// Batched data for the given revisions, their current diffs and their
    /// repositories.
    fn stack_data(&self, phids: &[Phid]) -> Result<StackData>;

    fn raw_diff(&self, diff_id: DiffId) -> Result<String>;

    /// Display names for users and projects (reviewer identities).
    fn actor_names(&self, phids: &[Phid]) -> Result<BTreeMap<Phid, String>>;

    fn has_unresolved_comments(&self, revision: RevisionId) -> Result<bool>;

    /// PHID of the project with the given slug, if it exists.
    fn project_phid(&self, slug: &str) -> Result<Option<Phid>>;

    /// Remove a project tag from a revision. Best-effort post-submission
    /// side effect.
    fn remove_project_tag(&self, revision: &Phid, project: &Phid) -> Result<()>;

    /// Ask the review service to re-scan a repository so landed revisions
    /// close quickly.
    fn trigger_repo_update(&self, identifier: &str) -> Result<()>;

    fn healthy(&self) -> Result<()>;
}

/// HTTP implementation of [`ReviewService`] against a conduit-style API.
#[derive(Debug)]
pub struct ConduitClient {
    base_url: String,
    api_token: String,
    client: reqwest::blocking::Client,
}

impl ConduitClient {
    pub fn new(base_url: &str, api_token: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create review service HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call(&self, method: &str, mut params: Value) -> Result<Value> {
        params["api.token"] = Value::String(self.api_token.clone());

        let url = format!("{}/api/{method}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .with_context(|| format!("review service request failed: {method}"))?;

        let body: Value = response
            .json()
            .with_context(|| format!("review service returned non-JSON for {method}"))?;

        if let Some(code) = body.get("error_code").and_then(Value::as_str) {
            let info = body
                .get("error_info")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("review service error from {method}: {code}: {info}");
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("review service response for {method} missing result"))
    }
}

impl ReviewService for ConduitClient {
    fn find_revision(&self, id: RevisionId) -> Result<Option<Phid>> {
        let result = self.call(
            "differential.revision.search",
            json!({"constraints": {"ids": [id.0]}}),
        )?;
        let data = expect_array(&result, "data")?;
        Ok(data
            .first()
            .and_then(|r| r.get("phid"))
            .and_then(Value::as_str)
            .map(|phid| Phid(phid.to_string())))
    }

    fn related_edges(&self, phids: &[Phid]) -> Result<Vec<(Phid, Phid)>> {
        let result = self.call(
            "edge.search",
            json!({
                "types": ["revision.parent", "revision.child"],
                "sourcePHIDs": phids.iter().map(|p| p.0.clone()).collect::<Vec<_>>(),
                "limit": 10_000,
            }),
        )?;
        let data = expect_array(&result, "data")?;

        let mut edges = Vec::new();
        for edge in data {
            let source = expect_str(edge, "sourcePHID")?;
            let destination = expect_str(edge, "destinationPHID")?;
            // Only child→parent edges are needed to represent the DAG.
            match expect_str(edge, "edgeType")? {
                "revision.parent" => edges.push((
                    Phid(source.to_string()),
                    Phid(destination.to_string()),
                )),
                "revision.child" => edges.push((
                    Phid(destination.to_string()),
                    Phid(source.to_string()),
                )),
                _ => {}
            }
        }
        Ok(edges)
    }

    fn stack_data(&self, phids: &[Phid]) -> Result<StackData> {
        if phids.is_empty() {
            return Ok(StackData::default());
        }

        let revs = self.call(
            "differential.revision.search",
            json!({
                "constraints": {"phids": phids.iter().map(|p| p.0.clone()).collect::<Vec<_>>()},
                "attachments": {"reviewers": true, "projects": true},
                "limit": phids.len(),
            }),
        )?;

        let mut data = StackData::default();
        for raw in expect_array(&revs, "data")? {
            let revision = parse_revision(raw)?;
            data.revisions.insert(revision.phid.clone(), revision);
        }

        let diff_phids: Vec<String> = data
            .revisions
            .values()
            .map(|r| r.diff_phid.0.clone())
            .collect();
        let diffs = self.call(
            "differential.diff.search",
            json!({
                "constraints": {"phids": diff_phids},
                "attachments": {"commits": true},
                "limit": data.revisions.len(),
            }),
        )?;
        for raw in expect_array(&diffs, "data")? {
            let diff = parse_diff(raw)?;
            data.diffs.insert(diff.phid.clone(), diff);
        }

        let repo_phids: Vec<String> = data
            .revisions
            .values()
            .filter_map(|r| r.repository_phid.as_ref())
            .map(|p| p.0.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if !repo_phids.is_empty() {
            let repos = self.call(
                "diffusion.repository.search",
                json!({"constraints": {"phids": repo_phids.clone()}, "limit": repo_phids.len()}),
            )?;
            for raw in expect_array(&repos, "data")? {
                let phid = Phid(expect_str(raw, "phid")?.to_string());
                let short_name = raw
                    .pointer("/fields/shortName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                data.repositories
                    .insert(phid.clone(), Repository { phid, short_name });
            }
        }

        Ok(data)
    }

    fn raw_diff(&self, diff_id: DiffId) -> Result<String> {
        let result = self.call("differential.getrawdiff", json!({"diffID": diff_id}))?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("raw diff response was not a string"))
    }

    fn actor_names(&self, phids: &[Phid]) -> Result<BTreeMap<Phid, String>> {
        if phids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let result = self.call(
            "phid.query",
            json!({"phids": phids.iter().map(|p| p.0.clone()).collect::<Vec<_>>()}),
        )?;
        let mut names = BTreeMap::new();
        if let Some(map) = result.as_object() {
            for (phid, info) in map {
                if let Some(name) = info.get("name").and_then(Value::as_str) {
                    names.insert(Phid(phid.clone()), name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn has_unresolved_comments(&self, revision: RevisionId) -> Result<bool> {
        let result = self.call(
            "transaction.search",
            json!({"objectIdentifier": revision.to_string()}),
        )?;
        let data = expect_array(&result, "data")?;
        Ok(data.iter().any(|txn| {
            txn.get("type").and_then(Value::as_str) == Some("inline")
                && txn.pointer("/fields/isDone").and_then(Value::as_bool) == Some(false)
        }))
    }

    fn project_phid(&self, slug: &str) -> Result<Option<Phid>> {
        let result = self.call(
            "project.search",
            json!({"constraints": {"slugs": [slug]}}),
        )?;
        let data = expect_array(&result, "data")?;
        Ok(data
            .first()
            .and_then(|p| p.get("phid"))
            .and_then(Value::as_str)
            .map(|phid| Phid(phid.to_string())))
    }

    fn remove_project_tag(&self, revision: &Phid, project: &Phid) -> Result<()> {
        self.call(
            "differential.revision.edit",
            json!({
                "objectIdentifier": revision.0,
                "transactions": [{"type": "projects.remove", "value": [project.0]}],
            }),
        )?;
        Ok(())
    }

    fn trigger_repo_update(&self, identifier: &str) -> Result<()> {
        self.call("diffusion.looksoon", json!({"repositories": [identifier]}))?;
        Ok(())
    }

    fn healthy(&self) -> Result<()> {
        self.call("conduit.ping", json!({}))?;
        Ok(())
    }
}

fn expect_array<'a>(value: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("review service response missing {key} array"))
}

fn expect_str<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("review service response missing {key}"))
}

fn parse_revision(raw: &Value) -> Result<Revision> {
    let id = raw
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("revision missing id"))?;
    let phid = Phid(expect_str(raw, "phid")?.to_string());

    let fields = raw
        .get("fields")
        .ok_or_else(|| anyhow!("revision missing fields"))?;
    let status = fields
        .pointer("/status/value")
        .and_then(Value::as_str)
        .map(RevisionStatus::from_wire)
        .ok_or_else(|| anyhow!("revision {phid} missing status"))?;

    let bug_id = fields
        .get("bugzilla.bug-id")
        .and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        });

    let reviewers = raw
        .pointer("/attachments/reviewers/reviewers")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|r| {
                    Some(Reviewer {
                        phid: Phid(r.get("reviewerPHID")?.as_str()?.to_string()),
                        status: ReviewerStatus::from_wire(
                            r.get("status").and_then(Value::as_str).unwrap_or("added"),
                        ),
                        diff_phid: r
                            .get("diffPHID")
                            .and_then(Value::as_str)
                            .map(|p| Phid(p.to_string())),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let projects = raw
        .pointer("/attachments/projects/projectPHIDs")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(|p| Phid(p.to_string()))
                .collect()
        })
        .unwrap_or_default();

    Ok(Revision {
        id: RevisionId(id),
        phid,
        title: fields
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        summary: fields
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        bug_id,
        status,
        repository_phid: fields
            .get("repositoryPHID")
            .and_then(Value::as_str)
            .map(|p| Phid(p.to_string())),
        diff_phid: Phid(
            fields
                .get("diffPHID")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("revision missing diffPHID"))?
                .to_string(),
        ),
        author_phid: Phid(
            fields
                .get("authorPHID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        projects,
        reviewers,
        uplift_request: fields
            .get("uplift.request")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        date_modified: fields
            .get("dateModified")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
    })
}

fn parse_diff(raw: &Value) -> Result<Diff> {
    let id = raw
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("diff missing id"))?;
    let phid = Phid(expect_str(raw, "phid")?.to_string());
    let fields = raw.get("fields").cloned().unwrap_or_default();

    let base_commit_hash = fields
        .get("refs")
        .and_then(Value::as_array)
        .and_then(|refs| {
            refs.iter()
                .find(|r| r.get("type").and_then(Value::as_str) == Some("base"))
        })
        .and_then(|r| r.get("identifier"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let commits = raw
        .pointer("/attachments/commits/commits")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|c| {
                    Some(DiffCommit {
                        identifier: c.get("identifier")?.as_str()?.to_string(),
                        author_name: c
                            .pointer("/author/name")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                        author_email: c
                            .pointer("/author/email")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Diff {
        id,
        phid,
        revision_phid: Phid(
            fields
                .get("revisionPHID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        base_commit_hash,
        author_name: fields
            .pointer("/authorName")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        author_email: fields
            .pointer("/authorEmail")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        commits,
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Response, Server};

    use super::*;

    fn with_server<F>(handler: F) -> (String, thread::JoinHandle<()>)
    where
        F: FnOnce(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let req = server.recv().expect("request");
            handler(req);
        });
        (addr, handle)
    }

    #[test]
    fn find_revision_returns_phid() {
        let (addr, handle) = with_server(|mut req| {
            assert_eq!(req.url(), "/api/differential.revision.search");
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("read");
            assert!(body.contains("api.token"));
            let response = json!({"result": {"data": [{"id": 1, "phid": "PHID-DREV-1"}]}});
            req.respond(Response::from_string(response.to_string()))
                .expect("respond");
        });

        let client = ConduitClient::new(&addr, "api-key").expect("client");
        let phid = client.find_revision(RevisionId(1)).expect("call");
        assert_eq!(phid, Some(Phid("PHID-DREV-1".to_string())));
        handle.join().expect("join");
    }

    #[test]
    fn missing_revision_is_none() {
        let (addr, handle) = with_server(|req| {
            let response = json!({"result": {"data": []}});
            req.respond(Response::from_string(response.to_string()))
                .expect("respond");
        });

        let client = ConduitClient::new(&addr, "api-key").expect("client");
        assert_eq!(client.find_revision(RevisionId(99)).expect("call"), None);
        handle.join().expect("join");
    }

    #[test]
    fn conduit_errors_are_surfaced() {
        let (addr, handle) = with_server(|req| {
            let response =
                json!({"result": null, "error_code": "ERR-INVALID", "error_info": "bad token"});
            req.respond(Response::from_string(response.to_string()))
                .expect("respond");
        });

        let client = ConduitClient::new(&addr, "api-key").expect("client");
        let err = client.find_revision(RevisionId(1)).expect_err("must fail");
        assert!(format!("{err:#}").contains("ERR-INVALID"));
        handle.join().expect("join");
    }

    #[test]
    fn raw_diff_returns_string_body() {
        let (addr, handle) = with_server(|req| {
            let response = json!({"result": "diff --git a/x b/x\n"});
            req.respond(Response::from_string(response.to_string()))
                .expect("respond");
        });

        let client = ConduitClient::new(&addr, "api-key").expect("client");
        assert_eq!(client.raw_diff(42).expect("call"), "diff --git a/x b/x\n");
        handle.join().expect("join");
    }

    #[test]
    fn parse_revision_extracts_the_core_fields() {
        let raw = json!({
            "id": 7,
            "phid": "PHID-DREV-7",
            "fields": {
                "title": "Fix the frobnicator",
                "summary": "Longer text",
                "status": {"value": "accepted"},
                "repositoryPHID": "PHID-REPO-central",
                "diffPHID": "PHID-DIFF-70",
                "authorPHID": "PHID-USER-1",
                "bugzilla.bug-id": "1234567",
            },
            "attachments": {
                "reviewers": {"reviewers": [
                    {"reviewerPHID": "PHID-USER-2", "status": "accepted", "diffPHID": "PHID-DIFF-70"},
                    {"reviewerPHID": "PHID-USER-3", "status": "rejected"},
                ]},
                "projects": {"projectPHIDs": ["PHID-PROJ-secure"]},
            },
        });
        let revision = parse_revision(&raw).expect("parse");
        assert_eq!(revision.id, RevisionId(7));
        assert_eq!(revision.status, RevisionStatus::Accepted);
        assert_eq!(revision.bug_id, Some(1234567));
        assert_eq!(revision.reviewers.len(), 2);
        assert!(revision.reviewers[1].status.blocks_landing());
        assert_eq!(revision.projects, vec![Phid("PHID-PROJ-secure".to_string())]);
    }

    #[test]
    fn parse_diff_reads_base_ref_and_commit_authors() {
        let raw = json!({
            "id": 70,
            "phid": "PHID-DIFF-70",
            "fields": {
                "revisionPHID": "PHID-DREV-7",
                "refs": [{"type": "base", "identifier": "abcdef012345"}],
            },
            "attachments": {"commits": {"commits": [
                {"identifier": "deadbeef", "author": {"name": "Joe", "email": "joe@example.com"}},
            ]}},
        });
        let diff = parse_diff(&raw).expect("parse");
        assert_eq!(diff.id, 70);
        assert_eq!(diff.base_commit_hash.as_deref(), Some("abcdef012345"));
        let (name, email) = select_diff_author(&diff);
        assert_eq!(name.as_deref(), Some("Joe"));
        assert_eq!(email.as_deref(), Some("joe@example.com"));
    }

    #[test]
    fn reviewer_accept_on_older_diff_is_not_current() {
        let reviewer = Reviewer {
            phid: Phid("PHID-USER-2".to_string()),
            status: ReviewerStatus::Accepted,
            diff_phid: Some(Phid("PHID-DIFF-old".to_string())),
        };
        assert!(!reviewer.accepted_current_diff(&Phid("PHID-DIFF-new".to_string())));
        assert!(reviewer.accepted_current_diff(&Phid("PHID-DIFF-old".to_string())));
    }
}
