use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Integer identifier of a revision in the review service, rendered as
/// `D<int>` on every wire surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(pub i64);

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid revision identifier: {0:?}")]
pub struct InvalidRevisionId(pub String);

impl FromStr for RevisionId {
    type Err = InvalidRevisionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('D').unwrap_or(s);
        let id: i64 = digits
            .parse()
            .map_err(|_| InvalidRevisionId(s.to_string()))?;
        if id <= 0 {
            return Err(InvalidRevisionId(s.to_string()));
        }
        Ok(RevisionId(id))
    }
}

impl Serialize for RevisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) if n > 0 => Ok(RevisionId(n)),
            Raw::Number(n) => Err(serde::de::Error::custom(InvalidRevisionId(n.to_string()))),
        }
    }
}

/// Opaque object identifier used by the review service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Phid(pub String);

impl fmt::Display for Phid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type DiffId = i64;

/// Status of a landing job. Stored as the string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Deferred,
    Failed,
    Landed,
    Cancelled,
}

impl JobStatus {
    /// Statuses that keep a stack busy: another landing over the same
    /// revisions must not be submitted while one of these exists.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::InProgress | JobStatus::Deferred
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Landed | JobStatus::Cancelled
        )
    }

    /// Claim ordering rank. An interrupted IN_PROGRESS job must be resumed
    /// before anything else in the queue.
    pub fn claim_rank(self) -> u8 {
        match self {
            JobStatus::InProgress => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Deferred => "DEFERRED",
            JobStatus::Failed => "FAILED",
            JobStatus::Landed => "LANDED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// An action applied to a landing job. The payload carries the fields the
/// target state requires, so an action cannot be constructed without them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    Land { commit_id: String },
    Fail { message: String },
    Defer { message: String },
    Cancel,
}

impl JobAction {
    pub fn target(&self) -> JobStatus {
        match self {
            JobAction::Land { .. } => JobStatus::Landed,
            JobAction::Fail { .. } => JobStatus::Failed,
            JobAction::Defer { .. } => JobStatus::Deferred,
            JobAction::Cancel => JobStatus::Cancelled,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobAction::Land { .. } => "LAND",
            JobAction::Fail { .. } => "FAIL",
            JobAction::Defer { .. } => "DEFER",
            JobAction::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("action {action} is not allowed from status {from}")]
    NotAllowed { from: JobStatus, action: &'static str },
}

/// One entry of a requested landing path, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingPathSpec {
    pub revision_id: RevisionId,
    pub diff_id: DiffId,
}

/// One revision of a job's landing path, in application order, together
/// with the name of its patch artefact in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRevision {
    pub revision_id: RevisionId,
    pub diff_id: DiffId,
    pub patch_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPath {
    pub path: String,
    pub changeset_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedHunks {
    pub path: String,
    pub content: Option<String>,
}

/// Structured merge-conflict payload recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBreakdown {
    pub revision_id: RevisionId,
    pub failed_paths: Vec<FailedPath>,
    pub reject_paths: std::collections::BTreeMap<String, RejectedHunks>,
}

/// A changeset hash rewritten by autoformatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashReplacement {
    pub old: String,
    pub new: String,
}

/// Persistent state of one landing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingJob {
    pub id: i64,
    pub status: JobStatus,
    /// Verified email of the user who requested the landing.
    pub requester_email: String,
    pub repository_name: String,
    pub repository_url: String,
    /// Commit the landing should be applied on top of, when pushing onto a
    /// known base (e.g. try). `None` means the remote head.
    #[serde(default)]
    pub target_commit_hash: Option<String>,
    /// Ordered landing path; parent revisions first.
    pub landing_path: Vec<JobRevision>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_breakdown: Option<ErrorBreakdown>,
    #[serde(default)]
    pub landed_commit_id: Option<String>,
    #[serde(default)]
    pub formatted_replacements: Option<Vec<HashReplacement>>,
}

impl LandingJob {
    pub fn revision_ids(&self) -> Vec<RevisionId> {
        self.landing_path.iter().map(|r| r.revision_id).collect()
    }

    /// The branch head's revision, i.e. the last entry of the landing path.
    pub fn head_revision(&self) -> Option<RevisionId> {
        self.landing_path.last().map(|r| r.revision_id)
    }

    /// Apply `action`, updating the status and the fields the action
    /// requires. Transitions outside the allowed set are rejected.
    pub fn transition(&mut self, action: JobAction, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let allowed = match &action {
            JobAction::Land { .. } | JobAction::Fail { .. } | JobAction::Defer { .. } => {
                self.status == JobStatus::InProgress
            }
            JobAction::Cancel => {
                matches!(self.status, JobStatus::Submitted | JobStatus::Deferred)
            }
        };
        if !allowed {
            return Err(TransitionError::NotAllowed {
                from: self.status,
                action: action.name(),
            });
        }

        self.status = action.target();
        match action {
            JobAction::Land { commit_id } => self.landed_commit_id = Some(commit_id),
            JobAction::Fail { message } | JobAction::Defer { message } => {
                self.error = Some(message);
            }
            JobAction::Cancel => {}
        }
        self.updated_at = now;
        Ok(())
    }

    /// Flip a queued or deferred job to IN_PROGRESS for processing.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !matches!(self.status, JobStatus::Submitted | JobStatus::Deferred) {
            return Err(TransitionError::NotAllowed {
                from: self.status,
                action: "CLAIM",
            });
        }
        self.status = JobStatus::InProgress;
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        // Failed and cancelled jobs lead with the error; landed jobs lead
        // with the commit they produced.
        let details = if matches!(self.status, JobStatus::Failed | JobStatus::Cancelled) {
            self.error.clone().or_else(|| self.landed_commit_id.clone())
        } else {
            self.landed_commit_id.clone().or_else(|| self.error.clone())
        };

        JobSummary {
            id: self.id,
            status: self.status,
            landing_path: self
                .landing_path
                .iter()
                .map(|r| LandingPathSpec {
                    revision_id: r.revision_id,
                    diff_id: r.diff_id,
                })
                .collect(),
            requester_email: self.requester_email.clone(),
            tree: self.repository_name.clone(),
            repository_url: self.repository_url.clone(),
            details,
            error_breakdown: self.error_breakdown.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The JSON shape jobs take on the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: i64,
    pub status: JobStatus,
    pub landing_path: Vec<LandingPathSpec>,
    pub requester_email: String,
    pub tree: String,
    pub repository_url: String,
    pub details: Option<String>,
    pub error_breakdown: Option<ErrorBreakdown>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The access group that gates landing to a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGroup {
    /// Group members with currently valid access.
    pub active_group: String,
    /// Group members, including those whose access has expired.
    pub membership_group: String,
    pub display_name: String,
}

/// Static configuration of one landable repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Short name; also the tree name in the tree-status service. May be
    /// omitted in config files where the map key carries the name.
    #[serde(default)]
    pub name: String,
    pub url: String,
    pub pull_path: String,
    pub push_path: String,
    #[serde(default)]
    pub push_bookmark: Option<String>,
    #[serde(default)]
    pub force_push: bool,
    /// Uplift trees: landing requires release-management approval and
    /// triggers post-landing bug updates.
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub autoformat_enabled: bool,
    /// Command invoked in the checkout to reformat the applied stack.
    #[serde(default)]
    pub autoformat_command: Vec<String>,
    pub access_group: AccessGroup,
    /// Feed consulted for the soft code freeze warning.
    #[serde(default)]
    pub product_details_url: Option<String>,
    /// e.g. `cf_status_firefox{milestone}`.
    #[serde(default)]
    pub milestone_tracking_flag_template: Option<String>,
    /// Identifier the review service knows this repository by, for the
    /// post-landing repo-update trigger.
    #[serde(default)]
    pub review_repo_identifier: Option<String>,
    /// Whether revisions on this repository must carry a testing-policy tag.
    #[serde(default)]
    pub testing_policy_enforced: bool,
}

/// A verified identity attached to an incoming request. Authentication
/// itself happens upstream of this crate.
#[derive(Debug, Clone, Default)]
pub struct UserIdentity {
    pub email: Option<String>,
    pub groups: BTreeSet<String>,
}

impl UserIdentity {
    pub fn new(email: &str, groups: &[&str]) -> Self {
        Self {
            email: Some(email.to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}
