//! The landability assessment.
//!
//! A requested landing is evaluated in two phases: blockers, any one of
//! which rejects the request outright, and warnings, which the submitter
//! must acknowledge by echoing back a confirmation token derived from the
//! exact warning set they were shown. If the warnings change between
//! dry-run and submission the old token stops matching and the submitter
//! has to look again.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::queue::JobStore;
use crate::review::{Diff, Repository, Revision, ReviewService, RevisionStatus, StackData,
    select_diff_author};
use crate::types::{DiffId, Phid, RepoConfig, RevisionId, UserIdentity};

/// Seconds west of UTC for the code-freeze calendar (Pacific offset).
const CODE_FREEZE_OFFSET_SECONDS: i32 = -8 * 3600;

/// One warning instance attached to a specific revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub id: u32,
    pub display: &'static str,
    pub revision_id: RevisionId,
    pub details: Value,
    /// Articulated warnings carry structured detail the UI renders
    /// directly instead of a plain sentence.
    pub articulated: bool,
}

/// The result of assessing a landing request.
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub blocker: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Why a submission was rejected at the acknowledgement gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    Blocked,
    UnacknowledgedWarnings,
    AcknowledgedWarningsChanged,
}

impl Assessment {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocker: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    /// Token over the canonicalised warning list; `None` when empty.
    pub fn confirmation_token(warnings: &[Warning]) -> Option<String> {
        if warnings.is_empty() {
            return None;
        }

        let mut canonical: Vec<(u32, String, Value)> = warnings
            .iter()
            .map(|w| (w.id, w.revision_id.to_string(), w.details.clone()))
            .collect();
        canonical.sort_by(|a, b| {
            (a.0, &a.1, a.2.to_string()).cmp(&(b.0, &b.1, b.2.to_string()))
        });

        let serialized = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Some(hex::encode(hasher.finalize()))
    }

    pub fn token(&self) -> Option<String> {
        Self::confirmation_token(&self.warnings)
    }

    /// Apply the submission gate: blocked requests are rejected, and
    /// warnings must be acknowledged with the current token.
    pub fn gate(&self, confirmation_token: Option<&str>) -> Result<(), GateRejection> {
        if self.blocker.is_some() {
            return Err(GateRejection::Blocked);
        }
        let current = self.token();
        if current.as_deref() == confirmation_token {
            return Ok(());
        }
        if confirmation_token.is_none() {
            Err(GateRejection::UnacknowledgedWarnings)
        } else {
            Err(GateRejection::AcknowledgedWarningsChanged)
        }
    }

    pub fn to_response(&self) -> AssessmentResponse {
        let mut buckets: Vec<WarningBucket> = Vec::new();
        for warning in &self.warnings {
            let instance = WarningInstance {
                revision_id: warning.revision_id,
                details: warning.details.clone(),
                articulated: warning.articulated,
            };
            match buckets.iter_mut().find(|b| b.id == warning.id) {
                Some(bucket) => bucket.instances.push(instance),
                None => buckets.push(WarningBucket {
                    id: warning.id,
                    display: warning.display.to_string(),
                    articulated: warning.articulated,
                    instances: vec![instance],
                }),
            }
        }

        AssessmentResponse {
            blocker: self.blocker.clone(),
            warnings: buckets,
            confirmation_token: self.token(),
        }
    }
}

/// The wire shape of an assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentResponse {
    pub blocker: Option<String>,
    pub warnings: Vec<WarningBucket>,
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningBucket {
    pub id: u32,
    pub display: String,
    pub articulated: bool,
    pub instances: Vec<WarningInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningInstance {
    pub revision_id: RevisionId,
    pub details: Value,
    pub articulated: bool,
}

// ---------------------------------------------------------------------------
// Blockers

/// Check everything that can block a landing outright. The first failing
/// check wins.
pub fn check_landing_blockers(
    user: &UserIdentity,
    requested_path: &[(Phid, DiffId)],
    stack: &StackData,
    landable_paths: &[Vec<Phid>],
    landing_repo: &RepoConfig,
    jobs: &JobStore,
) -> Result<Assessment> {
    if user.email.is_none() {
        return Ok(Assessment::blocked(
            "You do not have a verified email address.",
        ));
    }

    // The requested path must be a prefix of some landable path.
    let revision_path: Vec<&Phid> = requested_path.iter().map(|(phid, _)| phid).collect();
    let is_prefix = landable_paths.iter().any(|path| {
        path.len() >= revision_path.len()
            && path
                .iter()
                .zip(&revision_path)
                .all(|(a, b)| a == *b)
    });
    if !is_prefix {
        return Ok(Assessment::blocked(
            "The requested set of revisions are not landable.",
        ));
    }

    // Every requested diff must still be its revision's current diff.
    for (phid, diff_id) in requested_path {
        let Some(revision) = stack.revisions.get(phid) else {
            return Ok(Assessment::blocked(
                "The requested set of revisions are not landable.",
            ));
        };
        let current = stack.diff_for(revision).map(|d| d.id);
        if current != Some(*diff_id) {
            return Ok(Assessment::blocked("A requested diff is not the latest."));
        }
    }

    // One landing at a time per stack, over the whole connected component.
    let stack_revision_ids: Vec<RevisionId> =
        stack.revisions.values().map(|r| r.id).collect();
    if jobs
        .active_job_for_revisions(&stack_revision_ids)
        .context("failed to query active landing jobs")?
        .is_some()
    {
        return Ok(Assessment::blocked(
            "A landing for revisions in this stack is already in progress.",
        ));
    }

    if let Some(reason) = user_access_blocker(user, landing_repo) {
        return Ok(Assessment::blocked(reason));
    }

    Ok(Assessment::default())
}

/// Permission check against the repository's access group.
fn user_access_blocker(user: &UserIdentity, repo: &RepoConfig) -> Option<String> {
    let group = &repo.access_group;
    if user.is_in_group(&group.active_group) {
        return None;
    }
    if user.is_in_group(&group.membership_group) {
        return Some(format!("Your {} has expired.", group.display_name));
    }
    Some(format!(
        "You have insufficient permissions to land. {} is required.",
        group.display_name
    ))
}

// ---------------------------------------------------------------------------
// Per-revision blocker checks, injected into the landable-path calculation.

pub fn check_author_planned_changes(
    revision: &Revision,
    _diff: &Diff,
    _repo: Option<&Repository>,
) -> Option<String> {
    (revision.status == RevisionStatus::ChangesPlanned)
        .then(|| "The author has indicated they are planning changes to this revision.".to_string())
}

pub fn check_diff_author_is_known(
    _revision: &Revision,
    diff: &Diff,
    _repo: Option<&Repository>,
) -> Option<String> {
    let (name, email) = select_diff_author(diff);
    if name.is_some() && email.is_some() {
        return None;
    }
    Some("Diff does not have proper author information in the review service.".to_string())
}

/// Block revisions tagged with a data-classification project.
pub fn check_data_classification<'a>(
    classification_project: Option<&'a Phid>,
) -> impl Fn(&Revision, &Diff, Option<&Repository>) -> Option<String> + 'a {
    move |revision, _diff, _repo| {
        let project = classification_project?;
        revision.projects.contains(project).then(|| {
            "Revision makes changes to data classification and requires review.".to_string()
        })
    }
}

/// On approval-required repositories the release-managers group must have
/// accepted the revision.
pub fn check_uplift_approval<'a>(
    relman_group: &'a Phid,
    repos: &'a BTreeMap<Phid, RepoConfig>,
) -> impl Fn(&Revision, &Diff, Option<&Repository>) -> Option<String> + 'a {
    move |revision, _diff, repo| {
        let repo_config = repo.and_then(|r| repos.get(&r.phid))?;
        if !repo_config.approval_required {
            return None;
        }
        let approved = revision.reviewers.iter().any(|reviewer| {
            reviewer.phid == *relman_group && reviewer.accepted_current_diff(&revision.diff_phid)
        });
        (!approved).then(|| {
            "The release-managers group did not accept this revision for uplift.".to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Warnings

/// Active warning records attached to a diff by external tooling. The
/// landing core only reads them.
pub trait DiffWarningSource {
    fn active_warnings(&self, revision: RevisionId, diff: DiffId) -> Result<Vec<Value>>;
}

/// Source used when no diff-warning system is wired up.
pub struct NoDiffWarnings;

impl DiffWarningSource for NoDiffWarnings {
    fn active_warnings(&self, _revision: RevisionId, _diff: DiffId) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Outcome of consulting the repository's product-details feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductDetails {
    NotConfigured,
    /// The feed was configured but could not be fetched or parsed.
    Unavailable,
    Dates {
        next_softfreeze: NaiveDate,
        next_merge: NaiveDate,
    },
}

/// Fetch and parse the product-details feed for a repository.
pub fn fetch_product_details(repo: &RepoConfig) -> ProductDetails {
    let Some(url) = &repo.product_details_url else {
        return ProductDetails::NotConfigured;
    };

    let fetched = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .ok()
        .and_then(|client| client.get(url).send().ok())
        .and_then(|response| response.json::<Value>().ok());
    let Some(body) = fetched else {
        return ProductDetails::Unavailable;
    };

    parse_product_details(&body)
}

pub fn parse_product_details(body: &Value) -> ProductDetails {
    let date = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    };
    match (date("NEXT_SOFTFREEZE_DATE"), date("NEXT_MERGE_DATE")) {
        (Some(next_softfreeze), Some(next_merge)) => ProductDetails::Dates {
            next_softfreeze,
            next_merge,
        },
        // Feeds without freeze keys simply do not participate.
        _ => ProductDetails::NotConfigured,
    }
}

/// Everything the warning checks need to look at.
pub struct WarningContext<'a> {
    pub jobs: &'a JobStore,
    pub review: &'a dyn ReviewService,
    pub repo: &'a RepoConfig,
    pub secure_project: Option<&'a Phid>,
    pub testing_tag_projects: &'a [Phid],
    pub diff_warnings: &'a dyn DiffWarningSource,
    pub product_details: ProductDetails,
    pub now: DateTime<Utc>,
}

struct WarningCheck {
    id: u32,
    display: &'static str,
    articulated: bool,
    check: fn(&WarningContext, &Revision, &Diff) -> Result<Option<Value>>,
}

const WARNING_CHECKS: &[WarningCheck] = &[
    WarningCheck {
        id: 0,
        display: "Has a review intended to block landing.",
        articulated: false,
        check: warning_blocking_reviews,
    },
    WarningCheck {
        id: 1,
        display: "Has previously landed.",
        articulated: false,
        check: warning_previously_landed,
    },
    WarningCheck {
        id: 2,
        display: "Is not Accepted.",
        articulated: false,
        check: warning_not_accepted,
    },
    WarningCheck {
        id: 3,
        display: "No reviewer has accepted the current diff.",
        articulated: false,
        check: warning_reviews_not_current,
    },
    WarningCheck {
        id: 4,
        display: "Is a secure revision and should follow the Security Bug Approval Process.",
        articulated: false,
        check: warning_revision_secure,
    },
    WarningCheck {
        id: 5,
        display: "Revision is missing a Testing Policy Project Tag.",
        articulated: false,
        check: warning_missing_testing_tag,
    },
    WarningCheck {
        id: 6,
        display: "Revision has a diff warning.",
        articulated: true,
        check: warning_diff_warnings,
    },
    WarningCheck {
        id: 7,
        display: "Revision is marked as WIP.",
        articulated: false,
        check: warning_wip_title,
    },
    WarningCheck {
        id: 8,
        display: "Repository is under a soft code freeze.",
        articulated: true,
        check: warning_code_freeze,
    },
    WarningCheck {
        id: 9,
        display: "Revision has unresolved comments.",
        articulated: false,
        check: warning_unresolved_comments,
    },
];

/// Run every warning check over the requested revisions.
pub fn check_landing_warnings(
    ctx: &WarningContext<'_>,
    to_land: &[(&Revision, &Diff)],
) -> Result<Vec<Warning>> {
    let mut warnings = Vec::new();
    for (revision, diff) in to_land {
        for check in WARNING_CHECKS {
            if let Some(details) = (check.check)(ctx, revision, diff)? {
                warnings.push(Warning {
                    id: check.id,
                    display: check.display,
                    revision_id: revision.id,
                    details,
                    articulated: check.articulated,
                });
            }
        }
    }
    Ok(warnings)
}

fn warning_blocking_reviews(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    let blocking: Vec<Phid> = revision
        .reviewers
        .iter()
        .filter(|r| r.status.blocks_landing())
        .map(|r| r.phid.clone())
        .collect();
    if blocking.is_empty() {
        return Ok(None);
    }

    let names = ctx.review.actor_names(&blocking)?;
    let mut handles: Vec<String> = blocking
        .iter()
        .map(|phid| format!("@{}", names.get(phid).cloned().unwrap_or_else(|| phid.to_string())))
        .collect();
    handles.sort();

    let message = if handles.len() > 1 {
        format!(
            "Reviews from {}, and {} are in a state which is intended to prevent landings.",
            handles[..handles.len() - 1].join(", "),
            handles[handles.len() - 1],
        )
    } else {
        format!(
            "The review from {} is in a state which is intended to prevent landings.",
            handles[0]
        )
    };
    Ok(Some(Value::String(message)))
}

fn warning_previously_landed(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    diff: &Diff,
) -> Result<Option<Value>> {
    let Some(job) = ctx
        .jobs
        .last_landed_job_for_revision(revision.id)
        .context("failed to query landed jobs")?
    else {
        return Ok(None);
    };

    let Some(landed) = job
        .landing_path
        .iter()
        .find(|entry| entry.revision_id == revision.id)
    else {
        return Ok(None);
    };

    let same = landed.diff_id == diff.id;
    let only_revision = job.landing_path.len() == 1;
    let message = format!(
        "Already landed with {} diff ({}), pushed {} {}.",
        if same { "the same" } else { "an older" },
        landed.diff_id,
        if only_revision { "as" } else { "with new tip" },
        job.landed_commit_id.as_deref().unwrap_or("unknown"),
    );
    Ok(Some(Value::String(message)))
}

fn warning_not_accepted(
    _ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    if revision.status == RevisionStatus::Accepted {
        return Ok(None);
    }
    Ok(Some(Value::String(revision.status.output_name().to_string())))
}

fn warning_reviews_not_current(
    _ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    let current = revision
        .reviewers
        .iter()
        .any(|r| r.accepted_current_diff(&revision.diff_phid));
    if current {
        return Ok(None);
    }
    Ok(Some(Value::String(
        "Has no accepted review on the current diff.".to_string(),
    )))
}

fn warning_revision_secure(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    let Some(secure) = ctx.secure_project else {
        return Ok(None);
    };
    if !revision.projects.contains(secure) {
        return Ok(None);
    }
    Ok(Some(Value::String(
        "This revision is tied to a secure bug. Ensure that you are following the \
         Security Bug Approval Process guidelines before landing this changeset."
            .to_string(),
    )))
}

fn warning_missing_testing_tag(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    if !ctx.repo.testing_policy_enforced || ctx.testing_tag_projects.is_empty() {
        return Ok(None);
    }
    let tagged = ctx
        .testing_tag_projects
        .iter()
        .any(|tag| revision.projects.contains(tag));
    if tagged {
        return Ok(None);
    }
    Ok(Some(Value::String(
        "This revision does not specify a testing tag. Please add one before landing."
            .to_string(),
    )))
}

fn warning_diff_warnings(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    diff: &Diff,
) -> Result<Option<Value>> {
    let warnings = ctx.diff_warnings.active_warnings(revision.id, diff.id)?;
    if warnings.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Array(warnings)))
}

fn warning_wip_title(
    _ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    if !revision.title.to_lowercase().starts_with("wip:") {
        return Ok(None);
    }
    Ok(Some(Value::String(
        "This revision is marked as a WIP. Please remove `WIP:` before landing.".to_string(),
    )))
}

fn warning_code_freeze(
    ctx: &WarningContext<'_>,
    _revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    match &ctx.product_details {
        ProductDetails::NotConfigured => Ok(None),
        ProductDetails::Unavailable => Ok(Some(json!([
            {"message": "Could not retrieve repository's code freeze status."}
        ]))),
        ProductDetails::Dates {
            next_softfreeze,
            next_merge,
        } => {
            let offset = FixedOffset::east_opt(CODE_FREEZE_OFFSET_SECONDS)
                .context("invalid code freeze offset")?;
            let today = ctx.now.with_timezone(&offset).date_naive();
            if *next_softfreeze <= today && today <= *next_merge {
                Ok(Some(json!([{
                    "message": format!(
                        "Repository is under a soft code freeze (ends {next_merge})."
                    )
                }])))
            } else {
                Ok(None)
            }
        }
    }
}

fn warning_unresolved_comments(
    ctx: &WarningContext<'_>,
    revision: &Revision,
    _diff: &Diff,
) -> Result<Option<Value>> {
    if !ctx.review.has_unresolved_comments(revision.id)? {
        return Ok(None);
    }
    Ok(Some(Value::String(
        "Revision has unresolved comments.".to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::review::ReviewerStatus;
    use crate::testutil::{self, FakeReview};

    fn warning(id: u32, revision: i64, details: &str) -> Warning {
        Warning {
            id,
            display: "test",
            revision_id: RevisionId(revision),
            details: Value::String(details.to_string()),
            articulated: false,
        }
    }

    #[test]
    fn token_is_permutation_invariant() {
        let a = warning(0, 1, "x");
        let b = warning(2, 1, "y");
        let c = warning(1, 2, "z");
        let forward = Assessment::confirmation_token(&[a.clone(), b.clone(), c.clone()]);
        let backward = Assessment::confirmation_token(&[c, b, a]);
        assert_eq!(forward, backward);
        assert!(forward.is_some());
    }

    #[test]
    fn token_differs_for_different_warnings() {
        let one = Assessment::confirmation_token(&[warning(0, 1, "x")]);
        let other = Assessment::confirmation_token(&[warning(0, 1, "y")]);
        assert_ne!(one, other);
    }

    #[test]
    fn empty_warning_list_has_no_token() {
        assert_eq!(Assessment::confirmation_token(&[]), None);
    }

    #[test]
    fn gate_rejects_blocked_and_unacknowledged() {
        let blocked = Assessment::blocked("nope");
        assert_eq!(blocked.gate(None), Err(GateRejection::Blocked));

        let with_warning = Assessment {
            blocker: None,
            warnings: vec![warning(0, 1, "x")],
        };
        assert_eq!(
            with_warning.gate(None),
            Err(GateRejection::UnacknowledgedWarnings)
        );
        assert_eq!(
            with_warning.gate(Some("stale-token")),
            Err(GateRejection::AcknowledgedWarningsChanged)
        );
        let token = with_warning.token().expect("token");
        assert_eq!(with_warning.gate(Some(token.as_str())), Ok(()));

        let clean = Assessment::default();
        assert_eq!(clean.gate(None), Ok(()));
    }

    #[test]
    fn response_buckets_warnings_by_id() {
        let assessment = Assessment {
            blocker: None,
            warnings: vec![warning(0, 1, "a"), warning(0, 2, "b"), warning(7, 1, "c")],
        };
        let response = assessment.to_response();
        assert_eq!(response.warnings.len(), 2);
        assert_eq!(response.warnings[0].instances.len(), 2);
        assert_eq!(response.confirmation_token, assessment.token());
    }

    fn context_fixture<'a>(
        jobs: &'a JobStore,
        review: &'a FakeReview,
        repo: &'a RepoConfig,
    ) -> WarningContext<'a> {
        WarningContext {
            jobs,
            review,
            repo,
            secure_project: None,
            testing_tag_projects: &[],
            diff_warnings: &NoDiffWarnings,
            product_details: ProductDetails::NotConfigured,
            now: Utc::now(),
        }
    }

    #[test]
    fn accepted_revision_with_current_review_has_no_warnings() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let data = testutil::stack_data(vec![testutil::revision(
            1,
            "central",
            RevisionStatus::Accepted,
        )]);
        let review = FakeReview::new(data.clone(), vec![]);
        let repo = testutil::repo_config("central");
        let ctx = context_fixture(&jobs, &review, &repo);

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn blocking_review_produces_w0() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let mut revision = testutil::revision(1, "central", RevisionStatus::Accepted);
        revision.reviewers.push(crate::review::Reviewer {
            phid: Phid("PHID-USER-carol".to_string()),
            status: ReviewerStatus::Rejected,
            diff_phid: None,
        });
        let data = testutil::stack_data(vec![revision]);
        let review = FakeReview::new(data.clone(), vec![]);
        let repo = testutil::repo_config("central");
        let ctx = context_fixture(&jobs, &review, &repo);

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, 0);
        assert!(
            warnings[0]
                .details
                .as_str()
                .expect("string")
                .contains("@carol")
        );
    }

    #[test]
    fn not_accepted_status_produces_w2_and_w3() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let mut revision = testutil::revision(1, "central", RevisionStatus::NeedsReview);
        revision.reviewers.clear();
        let data = testutil::stack_data(vec![revision]);
        let review = FakeReview::new(data.clone(), vec![]);
        let repo = testutil::repo_config("central");
        let ctx = context_fixture(&jobs, &review, &repo);

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        let ids: Vec<u32> = warnings.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(warnings[0].details, Value::String("Needs Review".to_string()));
    }

    #[test]
    fn secure_and_wip_and_unresolved_warnings_fire() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let secure = Phid("PHID-PROJ-secure".to_string());
        let mut revision = testutil::revision(1, "central", RevisionStatus::Accepted);
        revision.title = "WIP: do not land yet".to_string();
        revision.projects.push(secure.clone());
        let data = testutil::stack_data(vec![revision]);
        let mut review = FakeReview::new(data.clone(), vec![]);
        review.unresolved.insert(RevisionId(1));
        let repo = testutil::repo_config("central");
        let mut ctx = context_fixture(&jobs, &review, &repo);
        ctx.secure_project = Some(&secure);

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        let ids: Vec<u32> = warnings.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![4, 7, 9]);
    }

    #[test]
    fn code_freeze_window_produces_w8() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let data = testutil::stack_data(vec![testutil::revision(
            1,
            "central",
            RevisionStatus::Accepted,
        )]);
        let review = FakeReview::new(data.clone(), vec![]);
        let repo = testutil::repo_config("central");
        let mut ctx = context_fixture(&jobs, &review, &repo);
        let today = ctx.now.date_naive();
        ctx.product_details = ProductDetails::Dates {
            next_softfreeze: today - chrono::Duration::days(1),
            next_merge: today + chrono::Duration::days(7),
        };

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, 8);
        assert!(warnings[0].articulated);
    }

    #[test]
    fn freeze_outside_window_is_silent() {
        let td = tempdir().expect("tempdir");
        let jobs = JobStore::open(td.path()).expect("store");
        let data = testutil::stack_data(vec![testutil::revision(
            1,
            "central",
            RevisionStatus::Accepted,
        )]);
        let review = FakeReview::new(data.clone(), vec![]);
        let repo = testutil::repo_config("central");
        let mut ctx = context_fixture(&jobs, &review, &repo);
        let today = ctx.now.date_naive();
        ctx.product_details = ProductDetails::Dates {
            next_softfreeze: today + chrono::Duration::days(3),
            next_merge: today + chrono::Duration::days(10),
        };

        let revision = data.revision_by_id(RevisionId(1)).expect("revision");
        let diff = data.diff_for(revision).expect("diff");
        let warnings = check_landing_warnings(&ctx, &[(revision, diff)]).expect("warnings");
        assert!(warnings.is_empty());
    }

    #[test]
    fn product_details_parsing() {
        let body = json!({
            "NEXT_SOFTFREEZE_DATE": "2026-08-10",
            "NEXT_MERGE_DATE": "2026-08-24",
        });
        match parse_product_details(&body) {
            ProductDetails::Dates {
                next_softfreeze,
                next_merge,
            } => {
                assert_eq!(next_softfreeze.to_string(), "2026-08-10");
                assert_eq!(next_merge.to_string(), "2026-08-24");
            }
            other => panic!("expected dates, got {other:?}"),
        }

        assert_eq!(
            parse_product_details(&json!({"LATEST_FIREFOX_VERSION": "140.0"})),
            ProductDetails::NotConfigured
        );
    }

    #[test]
    fn author_planned_changes_blocks() {
        let revision = testutil::revision(1, "central", RevisionStatus::ChangesPlanned);
        let diff = testutil::diff(&revision);
        assert!(check_author_planned_changes(&revision, &diff, None).is_some());

        let accepted = testutil::revision(2, "central", RevisionStatus::Accepted);
        let diff = testutil::diff(&accepted);
        assert!(check_author_planned_changes(&accepted, &diff, None).is_none());
    }

    #[test]
    fn unknown_diff_author_blocks() {
        let revision = testutil::revision(1, "central", RevisionStatus::Accepted);
        let mut diff = testutil::diff(&revision);
        diff.author_name = None;
        diff.author_email = None;
        diff.commits.clear();
        assert!(check_diff_author_is_known(&revision, &diff, None).is_some());
    }
}
