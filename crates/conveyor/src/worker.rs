//! The landing worker.
//!
//! A single cooperative loop per process: refresh the set of open trees,
//! claim the next queued job for one of them, run it against the
//! repository's worktree, and transition its status. Every failure mode
//! maps to either a terminal FAIL or a transient DEFER; nothing that
//! happens inside a job may take the loop down.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::blobstore::StorageBackend;
use crate::bugs::{self, BugTracker};
use crate::commit_message::parse_bugs;
use crate::config::{ConfigKey, ConfigStore};
use crate::notify::Notifier;
use crate::queue::{ClaimedJob, DEFAULT_GRACE_SECONDS, JobStore};
use crate::review::ReviewService;
use crate::treestatus::TreeStatus;
use crate::types::{ErrorBreakdown, FailedPath, JobAction, RejectedHunks, RepoConfig};
use crate::worktree::{HgWorktree, PushScope, RejectedFile, WorktreeError};

/// Progress reporting for long-running entry points. The CLI wires this
/// to stderr; tests collect messages.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Collaborators and configuration handed to a worker at startup.
pub struct WorkerHarness {
    pub repos: BTreeMap<String, RepoConfig>,
    /// One clone directory per repository, exclusively owned by this
    /// worker process.
    pub clone_paths: BTreeMap<String, PathBuf>,
    pub jobs: JobStore,
    pub patches: Box<dyn StorageBackend>,
    pub treestatus: Box<dyn TreeStatus>,
    pub review: Option<Box<dyn ReviewService>>,
    pub bug_tracker: Option<Box<dyn BugTracker>>,
    pub notifier: Notifier,
    pub config: ConfigStore,
    pub sleep_seconds: u64,
}

/// Outcome of processing one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Finished,
    Retrying,
}

pub struct LandingWorker {
    harness: WorkerHarness,
    enabled_repos: BTreeSet<String>,
    last_job_finished: Option<bool>,
}

impl LandingWorker {
    pub fn new(harness: WorkerHarness) -> Self {
        Self {
            harness,
            enabled_repos: BTreeSet::new(),
            last_job_finished: None,
        }
    }

    /// Run the event loop until the stop key is set, or `max_loops`
    /// iterations for bounded runs.
    pub fn start(&mut self, max_loops: Option<u64>, reporter: &mut dyn Reporter) -> Result<()> {
        if self.stopped() {
            reporter.warn("stop key is set; worker will not start");
            return Ok(());
        }

        self.refresh_enabled_repos(reporter);

        let mut loops = 0;
        while !self.stopped() {
            if let Some(max) = max_loops
                && loops >= max
            {
                break;
            }
            while self.paused() && !self.stopped() {
                reporter.info("worker is paused");
                self.throttle();
            }
            if let Err(err) = self.tick(reporter) {
                // A broken iteration must not take the loop down.
                reporter.error(&format!("worker iteration failed: {err:#}"));
            }
            loops += 1;
        }

        reporter.info(&format!("worker exited after {loops} iterations"));
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.harness
            .config
            .get_bool(ConfigKey::LandingWorkerStopped, false)
    }

    fn paused(&self) -> bool {
        self.harness
            .config
            .get_bool(ConfigKey::LandingWorkerPaused, false)
    }

    fn throttle(&self) {
        let seconds = self
            .harness
            .config
            .get_u64(ConfigKey::WorkerThrottleSeconds, self.harness.sleep_seconds);
        std::thread::sleep(Duration::from_secs(seconds));
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(
            self.harness
                .config
                .get_u64(ConfigKey::DefaultGraceSeconds, DEFAULT_GRACE_SECONDS),
        )
    }

    /// Recompute the set of repositories whose trees are open. A tree
    /// whose status cannot be read is treated as closed for this round.
    pub fn refresh_enabled_repos(&mut self, reporter: &mut dyn Reporter) {
        let mut enabled = BTreeSet::new();
        for name in self.harness.repos.keys() {
            match self.harness.treestatus.is_open(name) {
                Ok(true) => {
                    enabled.insert(name.clone());
                }
                Ok(false) => {}
                Err(err) => {
                    reporter.warn(&format!("could not read tree status for {name}: {err:#}"));
                }
            }
        }
        reporter.info(&format!(
            "{} enabled repos: {:?}",
            enabled.len(),
            enabled.iter().collect::<Vec<_>>()
        ));
        self.enabled_repos = enabled;
    }

    fn tick(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        // Closed trees may have reopened since the last refresh.
        if self.enabled_repos.len() != self.harness.repos.len() {
            self.refresh_enabled_repos(reporter);
        }

        if self.last_job_finished == Some(false) {
            reporter.info("last job did not complete, sleeping");
            self.throttle();
            self.refresh_enabled_repos(reporter);
        }

        let Some(mut claimed) = self
            .harness
            .jobs
            .next_job_for_update(&self.enabled_repos, self.grace())?
        else {
            self.throttle();
            return Ok(());
        };

        reporter.info(&format!("starting landing job {}", claimed.job().id));
        let started = Instant::now();
        let outcome = self.process_job(&mut claimed, reporter);
        // The duration is recorded however the job ended.
        claimed.update(|job| job.duration_seconds = started.elapsed().as_secs())?;

        match outcome {
            Ok(tick) => {
                self.last_job_finished = Some(tick == Tick::Finished);
                reporter.info(&format!("finished processing landing job {}", claimed.job().id));
                Ok(())
            }
            Err(err) => {
                self.last_job_finished = Some(false);
                Err(err)
            }
        }
    }

    fn process_job(
        &self,
        claimed: &mut ClaimedJob,
        reporter: &mut dyn Reporter,
    ) -> Result<Tick> {
        claimed.begin()?;

        let repo = self
            .harness
            .repos
            .get(&claimed.job().repository_name)
            .cloned()
            .with_context(|| {
                format!("no repository configured for {}", claimed.job().repository_name)
            })?;

        // The tree may have closed between the refresh and the claim.
        if !self.harness.treestatus.is_open(&repo.name).unwrap_or(false) {
            claimed.transition(JobAction::Defer {
                message: format!("Tree {} is closed - retrying later.", repo.name),
            })?;
            return Ok(Tick::Retrying);
        }

        let clone_path = self
            .harness
            .clone_paths
            .get(&repo.name)
            .with_context(|| format!("no clone path configured for {}", repo.name))?;
        let worktree = HgWorktree::new(clone_path);
        let scope = worktree.for_push(&claimed.job().requester_email);

        self.run_job(claimed, &repo, &scope, reporter)
    }

    fn run_job(
        &self,
        claimed: &mut ClaimedJob,
        repo: &RepoConfig,
        scope: &PushScope<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<Tick> {
        if let Err(err) = scope.update_repo(&repo.pull_path, claimed.job().target_commit_hash.as_deref())
        {
            let message = format!(
                "Unexpected error while fetching repo from {}.\n{err}",
                repo.pull_path
            );
            claimed.transition(JobAction::Fail { message })?;
            self.notify_landing_failure(claimed, reporter);
            return Ok(Tick::Finished);
        }

        for entry in claimed.job().landing_path.clone() {
            let patch = match self.harness.patches.get(&entry.patch_name) {
                Ok(patch) => patch,
                Err(err) => {
                    // The blob store being unreachable is transient; the
                    // patches are still there for the next attempt.
                    claimed.transition(JobAction::Defer {
                        message: format!(
                            "Could not fetch patch {} - retrying later.\n{err:#}",
                            entry.patch_name
                        ),
                    })?;
                    return Ok(Tick::Retrying);
                }
            };

            match scope.apply_patch(&patch) {
                Ok(()) => {}
                Err(WorktreeError::PatchConflict { rejects }) => {
                    let breakdown =
                        self.build_error_breakdown(scope, repo, entry.revision_id.0, &rejects);
                    claimed.update(|job| job.error_breakdown = Some(breakdown))?;
                    let message = format!(
                        "Problem while applying patch in revision {}:\n\nrejected hunks in {}",
                        entry.revision_id,
                        rejects
                            .iter()
                            .map(|r| r.path.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                    claimed.transition(JobAction::Fail { message })?;
                    self.notify_landing_failure(claimed, reporter);
                    return Ok(Tick::Finished);
                }
                Err(err @ (WorktreeError::NoDiffStartLine | WorktreeError::MalformedPatch(_))) => {
                    let message = format!(
                        "Landing encountered a malformed patch, please try again. \
                         If this error persists please file a bug.\n{err}"
                    );
                    claimed.transition(JobAction::Fail { message })?;
                    self.notify_landing_failure(claimed, reporter);
                    return Ok(Tick::Finished);
                }
                Err(err) => {
                    let message = format!(
                        "Aborting, could not apply patch for revision {}.\n{err}",
                        entry.revision_id
                    );
                    claimed.transition(JobAction::Fail { message })?;
                    self.notify_landing_failure(claimed, reporter);
                    return Ok(Tick::Finished);
                }
            }
        }

        let titles = scope.stack_titles().unwrap_or_default();
        let bug_ids: Vec<String> = {
            let mut seen = Vec::new();
            for title in &titles {
                for bug in parse_bugs(title) {
                    let bug = bug.to_string();
                    if !seen.contains(&bug) {
                        seen.push(bug);
                    }
                }
            }
            seen
        };

        if repo.autoformat_enabled {
            match scope.format_stack(titles.len(), &bug_ids, &repo.autoformat_command) {
                Ok(replacements) => {
                    if !replacements.is_empty() {
                        claimed.update(|job| job.formatted_replacements = Some(replacements))?;
                    }
                }
                Err(WorktreeError::Autoformat { stderr }) => {
                    // Formatter failures are treated as transient: the
                    // tree state that produced them usually moves.
                    claimed.transition(JobAction::Defer {
                        message: format!(
                            "Autoformatting failed; the job will be retried.\n\n{stderr}"
                        ),
                    })?;
                    return Ok(Tick::Retrying);
                }
                Err(err) => {
                    claimed.transition(JobAction::Fail {
                        message: format!("Unexpected error while autoformatting.\n{err}"),
                    })?;
                    self.notify_landing_failure(claimed, reporter);
                    return Ok(Tick::Finished);
                }
            }
        }

        let commit_id = match scope.tip_hash() {
            Ok(commit_id) => commit_id,
            Err(err) => {
                claimed.transition(JobAction::Fail {
                    message: format!("Could not read the landed changeset hash.\n{err}"),
                })?;
                self.notify_landing_failure(claimed, reporter);
                return Ok(Tick::Finished);
            }
        };

        match scope.push(
            &repo.push_path,
            repo.push_bookmark.as_deref(),
            repo.force_push,
        ) {
            Ok(()) => {}
            Err(
                err @ (WorktreeError::TreeClosed(_)
                | WorktreeError::TreeApprovalRequired(_)
                | WorktreeError::LostPushRace(_)),
            ) => {
                claimed.transition(JobAction::Defer {
                    message: format!(
                        "Temporary error ({err}) encountered while pushing to {}",
                        repo.push_path
                    ),
                })?;
                return Ok(Tick::Retrying);
            }
            Err(err) => {
                claimed.transition(JobAction::Fail {
                    message: format!("Unexpected error while pushing to {}.\n{err}", repo.push_path),
                })?;
                self.notify_landing_failure(claimed, reporter);
                return Ok(Tick::Finished);
            }
        }

        // Uplift bookkeeping happens before the scope drops so the
        // milestone file can still be read from the checkout.
        if repo.approval_required {
            self.update_uplift_bugs(claimed, repo, scope, &titles, reporter);
        }

        claimed.transition(JobAction::Land { commit_id })?;

        // Nudge the review service so the landed revisions close quickly.
        if let (Some(review), Some(identifier)) =
            (&self.harness.review, &repo.review_repo_identifier)
            && let Err(err) = review.trigger_repo_update(identifier)
        {
            reporter.warn(&format!("failed to trigger repo update: {err:#}"));
        }

        Ok(Tick::Finished)
    }

    fn update_uplift_bugs(
        &self,
        claimed: &ClaimedJob,
        repo: &RepoConfig,
        scope: &PushScope<'_>,
        titles: &[String],
        reporter: &mut dyn Reporter,
    ) {
        let Some(tracker) = &self.harness.bug_tracker else {
            return;
        };

        let result = scope
            .read_checkout_file("config/milestone.txt")
            .map_err(anyhow::Error::from)
            .and_then(|content| bugs::parse_milestone(&content))
            .and_then(|milestone| {
                bugs::update_bugs_for_uplift(
                    tracker.as_ref(),
                    titles,
                    &repo.name,
                    milestone,
                    repo.milestone_tracking_flag_template.as_deref(),
                )
            });

        if let Err(err) = result {
            // The push already happened; let the requester finish the bug
            // bookkeeping by hand.
            reporter.warn(&format!("failed to update bugs after uplift: {err:#}"));
            let message = format!("Failed to update the bug tracker after landing: {err:#}");
            if let Err(notify_err) = self
                .harness
                .notifier
                .notify_bug_update_failure(claimed.job(), &message)
            {
                reporter.warn(&format!("failed to send bug-update notification: {notify_err:#}"));
            }
        }
    }

    fn build_error_breakdown(
        &self,
        scope: &PushScope<'_>,
        repo: &RepoConfig,
        revision_id: i64,
        rejects: &[RejectedFile],
    ) -> ErrorBreakdown {
        let mut failed_paths = Vec::new();
        let mut reject_paths = BTreeMap::new();

        for reject in rejects {
            let path = reject
                .path
                .strip_suffix(".rej")
                .unwrap_or(&reject.path)
                .to_string();
            let changeset_id = scope.last_commit_touching(&path).unwrap_or_default();
            failed_paths.push(FailedPath {
                url: format!("{}/file/{changeset_id}/{path}", repo.pull_path),
                path: path.clone(),
                changeset_id,
            });
            reject_paths.insert(
                path,
                RejectedHunks {
                    path: reject.path.clone(),
                    content: reject.content.clone(),
                },
            );
        }

        ErrorBreakdown {
            revision_id: crate::types::RevisionId(revision_id),
            failed_paths,
            reject_paths,
        }
    }

    fn notify_landing_failure(&self, claimed: &ClaimedJob, reporter: &mut dyn Reporter) {
        if let Err(err) = self.harness.notifier.notify_landing_failure(claimed.job()) {
            reporter.warn(&format!("failed to send landing-failure notification: {err:#}"));
        }
    }
}

/// Reporter that collects messages; used by tests and available to
/// embedders that post-process output.
#[derive(Debug, Default)]
pub struct BufferReporter {
    pub messages: Vec<String>,
}

impl Reporter for BufferReporter {
    fn info(&mut self, msg: &str) {
        self.messages.push(format!("[info] {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.messages.push(format!("[warn] {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.messages.push(format!("[error] {msg}"));
    }
}
