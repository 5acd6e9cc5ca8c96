//! The public request surface.
//!
//! These functions are the contract behind the HTTP layer: validate a
//! landing request, assess it, and on submission run the critical section
//! that uploads patches and inserts the job. HTTP routing itself lives
//! outside this crate; [`ApiError::status`] carries the status code each
//! failure maps to.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use thiserror::Error;

use conveyor_patch::build_export_patch;

use crate::assessment::{
    Assessment, AssessmentResponse, DiffWarningSource, GateRejection, NoDiffWarnings,
    WarningContext, check_author_planned_changes, check_data_classification,
    check_diff_author_is_known, check_landing_blockers, check_landing_warnings,
    check_uplift_approval, fetch_product_details,
};
use crate::blobstore::{StorageBackend, patch_name};
use crate::commit_message::format_commit_message;
use crate::queue::{CancelOutcome, JobStore, NewJob};
use crate::review::{Diff, Revision, ReviewService, StackData, select_diff_author};
use crate::secapproval::SecApprovalStore;
use crate::stacks::{BlockerCheck, build_stack_graph, calculate_landable_subgraphs};
use crate::types::{
    DiffId, JobRevision, JobSummary, LandingPathSpec, Phid, RepoConfig, RevisionId, UserIdentity,
};

/// The long-lived collaborators behind the request surface. Explicitly
/// constructed and torn down by the embedding process; no globals.
pub struct AppContext {
    pub review: Box<dyn ReviewService>,
    pub jobs: JobStore,
    pub patches: Box<dyn StorageBackend>,
    pub secapproval: Box<dyn SecApprovalStore>,
    pub diff_warnings: Box<dyn DiffWarningSource>,
    pub repos: BTreeMap<String, RepoConfig>,
    /// Base URL of the review service, for revision links in commit
    /// messages.
    pub review_base_url: String,
    pub relman_group: Option<Phid>,
    pub secure_project: Option<Phid>,
    pub testing_tag_projects: Vec<Phid>,
    pub data_classification_project: Option<Phid>,
    pub checkin_project: Option<Phid>,
}

impl AppContext {
    /// Probe every collaborator; returns one entry per subsystem.
    pub fn healthy(&self) -> Vec<(&'static str, Result<()>)> {
        vec![
            ("review", self.review.healthy()),
            ("blobstore", self.patches.healthy()),
        ]
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{title}: {detail}")]
    Validation { title: String, detail: String },
    #[error("landing is blocked")]
    Blocked {
        rejection: GateRejection,
        assessment: AssessmentResponse,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl ApiError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation { .. } | ApiError::Blocked { .. } => 400,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Upstream(_) => 502,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Upstream(format!("{err:#}"))
    }
}

/// A fully assessed request, ready for submission.
struct AssessedRequest {
    assessment: Assessment,
    /// `(revision, diff)` pairs in landing order.
    to_land: Vec<(Revision, Diff)>,
    landing_repo: RepoConfig,
    stack: StackData,
}

/// `POST /transplants/dryrun` — assess without mutating anything.
pub fn dryrun(
    ctx: &AppContext,
    user: &UserIdentity,
    landing_path: &[LandingPathSpec],
) -> Result<AssessmentResponse, ApiError> {
    let assessed = assess(ctx, user, landing_path)?;
    Ok(assessed.assessment.to_response())
}

/// `POST /transplants` — assess, gate on acknowledgement, and submit.
pub fn submit(
    ctx: &AppContext,
    user: &UserIdentity,
    landing_path: &[LandingPathSpec],
    confirmation_token: Option<&str>,
) -> Result<i64, ApiError> {
    let assessed = assess(ctx, user, landing_path)?;
    if let Err(rejection) = assessed.assessment.gate(confirmation_token) {
        return Err(ApiError::Blocked {
            rejection,
            assessment: assessed.assessment.to_response(),
        });
    }

    let requester_email = user
        .email
        .clone()
        .ok_or_else(|| ApiError::Forbidden("a verified email address is required".to_string()))?;

    // Build the patch for every entry of the path before entering the
    // critical section; only the uploads and the insert happen under the
    // queue lock.
    let mut patches = Vec::new();
    for (revision, diff) in &assessed.to_land {
        patches.push(build_patch(ctx, &assessed.landing_repo, revision, diff)?);
    }

    let stack_revision_ids: Vec<RevisionId> =
        assessed.stack.revisions.values().map(|r| r.id).collect();

    let job = {
        let guard = ctx.jobs.lock_queue().map_err(ApiError::from)?;

        // Re-check under the lock: another submitter may have won the
        // race since the assessment ran.
        if ctx
            .jobs
            .active_job_for_revisions(&stack_revision_ids)
            .map_err(ApiError::from)?
            .is_some()
        {
            let blocked = Assessment::blocked(
                "A landing for revisions in this stack is already in progress.",
            );
            return Err(ApiError::Blocked {
                rejection: GateRejection::Blocked,
                assessment: blocked.to_response(),
            });
        }

        let job_id = ctx.jobs.reserve_job_id(&guard).map_err(ApiError::from)?;

        let mut path_entries = Vec::new();
        for ((revision, diff), patch) in assessed.to_land.iter().zip(&patches) {
            let name = patch_name(job_id, revision.id, diff.id);
            ctx.patches
                .put(&name, patch)
                .context("failed to upload patch")
                .map_err(ApiError::from)?;
            path_entries.push(JobRevision {
                revision_id: revision.id,
                diff_id: diff.id,
                patch_name: name,
            });
        }

        ctx.jobs
            .create_job_with_id(
                &guard,
                job_id,
                NewJob {
                    requester_email,
                    repository_name: assessed.landing_repo.name.clone(),
                    repository_url: assessed.landing_repo.url.clone(),
                    target_commit_hash: None,
                    landing_path: path_entries,
                    priority: 0,
                },
            )
            .map_err(ApiError::from)?
    };

    // Post-commit, best-effort: drop the checkin tag from revisions that
    // carried it. The landing is queued either way.
    if let Some(checkin) = &ctx.checkin_project {
        for (revision, _) in &assessed.to_land {
            if revision.projects.contains(checkin) {
                let _ = ctx.review.remove_project_tag(&revision.phid, checkin);
            }
        }
    }

    Ok(job.id)
}

/// `GET /transplants?stack_revision_id=` — jobs intersecting the stack.
pub fn list_jobs(ctx: &AppContext, stack_revision: RevisionId) -> Result<Vec<JobSummary>, ApiError> {
    let seed = ctx
        .review
        .find_revision(stack_revision)
        .map_err(ApiError::from)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "revision {stack_revision} does not exist or you lack permission to see it"
            ))
        })?;

    let (nodes, _edges) = build_stack_graph(ctx.review.as_ref(), &seed).map_err(ApiError::from)?;
    let stack = ctx
        .review
        .stack_data(&nodes.into_iter().collect::<Vec<_>>())
        .map_err(ApiError::from)?;
    let revision_ids: Vec<RevisionId> = stack.revisions.values().map(|r| r.id).collect();

    let jobs = ctx
        .jobs
        .jobs_for_revisions(&revision_ids)
        .map_err(ApiError::from)?;
    Ok(jobs.iter().map(|job| job.summary()).collect())
}

/// `PUT /landing_jobs/{id}` with status CANCELLED.
pub fn cancel(ctx: &AppContext, user: &UserIdentity, job_id: i64) -> Result<i64, ApiError> {
    let email = user
        .email
        .as_deref()
        .ok_or_else(|| ApiError::Forbidden("a verified email address is required".to_string()))?;

    match ctx.jobs.cancel(job_id, email).map_err(ApiError::from)? {
        CancelOutcome::Cancelled => Ok(job_id),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!(
            "a landing job with ID {job_id} was not found"
        ))),
        CancelOutcome::NotOwner => Err(ApiError::Forbidden(format!(
            "user not authorized to update landing job {job_id}"
        ))),
        CancelOutcome::NotCancellable(status) => Err(ApiError::Validation {
            title: "Landing job could not be cancelled.".to_string(),
            detail: format!("Landing job status ({status}) does not allow cancelling."),
        }),
    }
}

fn assess(
    ctx: &AppContext,
    user: &UserIdentity,
    landing_path: &[LandingPathSpec],
) -> Result<AssessedRequest, ApiError> {
    if landing_path.is_empty() {
        return Err(ApiError::Validation {
            title: "Landing Path Required".to_string(),
            detail: "A non-empty landing_path is required.".to_string(),
        });
    }

    // Any revision of the path finds the same stack; the middle one keeps
    // graph expansion balanced.
    let middle = landing_path[landing_path.len() / 2].revision_id;
    let seed = ctx
        .review
        .find_revision(middle)
        .map_err(ApiError::from)?
        .ok_or_else(|| {
            ApiError::NotFound(
                "the stack does not exist or you lack permission to see it".to_string(),
            )
        })?;

    let (nodes, edges) = build_stack_graph(ctx.review.as_ref(), &seed).map_err(ApiError::from)?;
    let stack = ctx
        .review
        .stack_data(&nodes.into_iter().collect::<Vec<_>>())
        .map_err(ApiError::from)?;

    // Convert the requested `(D<int>, diff)` path to PHIDs.
    let mut requested: Vec<(Phid, DiffId)> = Vec::new();
    for entry in landing_path {
        let Some(revision) = stack.revision_by_id(entry.revision_id) else {
            return Err(ApiError::Validation {
                title: "Landing Path Invalid".to_string(),
                detail: format!("revision {} is not part of the stack", entry.revision_id),
            });
        };
        requested.push((revision.phid.clone(), entry.diff_id));
    }

    // Repositories of the stack that this instance can land to.
    let mut landable_repo_configs: BTreeMap<Phid, RepoConfig> = BTreeMap::new();
    for repository in stack.repositories.values() {
        if let Some(config) = ctx.repos.get(&repository.short_name) {
            landable_repo_configs.insert(repository.phid.clone(), config.clone());
        }
    }
    let landable_repo_phids = landable_repo_configs.keys().cloned().collect();

    let classification = check_data_classification(ctx.data_classification_project.as_ref());
    let mut checks: Vec<&BlockerCheck> = vec![
        &check_author_planned_changes,
        &check_diff_author_is_known,
        &classification,
    ];
    let uplift;
    if let Some(relman) = &ctx.relman_group {
        uplift = check_uplift_approval(relman, &landable_repo_configs);
        checks.push(&uplift);
    }

    let (landable_paths, _blocked) =
        calculate_landable_subgraphs(&stack, &edges, &landable_repo_phids, &checks);

    // The whole path shares one repository, so resolving the first entry
    // is enough.
    let landing_repo = requested
        .first()
        .and_then(|(phid, _)| stack.revisions.get(phid))
        .and_then(|revision| revision.repository_phid.as_ref())
        .and_then(|repo| landable_repo_configs.get(repo))
        .cloned();
    let Some(landing_repo) = landing_repo else {
        return Ok(AssessedRequest {
            assessment: Assessment::blocked("The requested set of revisions are not landable."),
            to_land: Vec::new(),
            landing_repo: placeholder_repo(),
            stack,
        });
    };

    let assessment = check_landing_blockers(
        user,
        &requested,
        &stack,
        &landable_paths,
        &landing_repo,
        &ctx.jobs,
    )
    .map_err(ApiError::from)?;
    if assessment.blocker.is_some() {
        return Ok(AssessedRequest {
            assessment,
            to_land: Vec::new(),
            landing_repo,
            stack,
        });
    }

    let mut to_land: Vec<(Revision, Diff)> = Vec::new();
    for (phid, _) in &requested {
        let revision = stack
            .revisions
            .get(phid)
            .cloned()
            .ok_or_else(|| ApiError::Upstream("stack data lost a revision".to_string()))?;
        let diff = stack
            .diff_for(&revision)
            .cloned()
            .ok_or_else(|| ApiError::Upstream("stack data lost a diff".to_string()))?;
        to_land.push((revision, diff));
    }

    let warning_ctx = WarningContext {
        jobs: &ctx.jobs,
        review: ctx.review.as_ref(),
        repo: &landing_repo,
        secure_project: ctx.secure_project.as_ref(),
        testing_tag_projects: &ctx.testing_tag_projects,
        diff_warnings: ctx.diff_warnings.as_ref(),
        product_details: fetch_product_details(&landing_repo),
        now: chrono::Utc::now(),
    };
    let pairs: Vec<(&Revision, &Diff)> = to_land.iter().map(|(r, d)| (r, d)).collect();
    let warnings = check_landing_warnings(&warning_ctx, &pairs).map_err(ApiError::from)?;

    Ok(AssessedRequest {
        assessment: Assessment {
            blocker: None,
            warnings,
        },
        to_land,
        landing_repo,
        stack,
    })
}

/// Build the export-format patch for one revision of the path.
fn build_patch(
    ctx: &AppContext,
    landing_repo: &RepoConfig,
    revision: &Revision,
    diff: &Diff,
) -> Result<Vec<u8>, ApiError> {
    // Secure revisions land with their sanitised message when the
    // sec-approval process produced one.
    let sanitized = ctx
        .secapproval
        .sanitized_message(revision.id)
        .map_err(ApiError::from)?;
    let (title, summary) = match &sanitized {
        Some(message) => (message.title.clone(), message.summary.clone()),
        None => (revision.title.clone(), revision.summary.clone()),
    };

    let accepted_phids: Vec<Phid> = revision
        .reviewers
        .iter()
        .filter(|r| r.accepted_current_diff(&revision.diff_phid))
        .map(|r| r.phid.clone())
        .collect();
    let names = ctx
        .review
        .actor_names(&accepted_phids)
        .map_err(ApiError::from)?;

    let mut reviewers: Vec<String> = Vec::new();
    let mut approvals: Vec<String> = Vec::new();
    for phid in &accepted_phids {
        let name = names.get(phid).cloned().unwrap_or_else(|| phid.to_string());
        // On uplift trees the release-managers acceptance is recorded as
        // an approval, not a review.
        if landing_repo.approval_required && Some(phid) == ctx.relman_group.as_ref() {
            approvals.push(name);
        } else {
            reviewers.push(name);
        }
    }

    let revision_url = format!(
        "{}/{}",
        ctx.review_base_url.trim_end_matches('/'),
        revision.id
    );
    let (_, commit_message) = format_commit_message(
        &title,
        revision.bug_id,
        &reviewers,
        &approvals,
        &summary,
        &revision_url,
        &[],
    );

    let (author_name, author_email) = select_diff_author(diff);
    let raw_diff = ctx.review.raw_diff(diff.id).map_err(ApiError::from)?;

    Ok(build_export_patch(
        raw_diff.as_bytes(),
        author_name.as_deref().unwrap_or_default(),
        author_email.as_deref().unwrap_or_default(),
        &commit_message,
        &revision.date_modified.to_string(),
    ))
}

fn placeholder_repo() -> RepoConfig {
    RepoConfig {
        name: String::new(),
        url: String::new(),
        pull_path: String::new(),
        push_path: String::new(),
        push_bookmark: None,
        force_push: false,
        approval_required: false,
        autoformat_enabled: false,
        autoformat_command: Vec::new(),
        access_group: crate::types::AccessGroup {
            active_group: String::new(),
            membership_group: String::new(),
            display_name: String::new(),
        },
        product_details_url: None,
        milestone_tracking_flag_template: None,
        review_repo_identifier: None,
        testing_policy_enforced: false,
    }
}

/// Convenience used by HTTP layers: a no-op diff-warning source.
pub fn no_diff_warnings() -> Box<dyn DiffWarningSource> {
    Box::new(NoDiffWarnings)
}
