//! The landing job store.
//!
//! Jobs are JSON rows in a store directory, written atomically. Two locks
//! coordinate access between processes:
//!
//! - `locks/queue.lock` is the table-level lock. Submitters hold it for
//!   the whole critical section (re-check "already in progress", insert);
//!   the worker holds it only while scanning for the next claimable job.
//! - `locks/job-<id>.lock` is the row-level lock. The worker holds it for
//!   the full duration of processing a job, so a concurrent worker cannot
//!   claim the same row and a concurrent cancel loses the race cleanly.
//!
//! Claim ordering is `(IN_PROGRESS first, priority DESC, created_at ASC)`
//! so a crashed worker resumes its interrupted job before anything else.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::events::{self, JobEvent, JobEventKind};
use crate::lock::LockFile;
use crate::types::{JobAction, JobRevision, JobStatus, LandingJob, RevisionId};

/// Default age a job must reach before the worker will claim it.
pub const DEFAULT_GRACE_SECONDS: u64 = 120;

/// How long a queue lock may sit before another process steals it.
const QUEUE_LOCK_STALE: Duration = Duration::from_secs(300);

/// Parameters for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub requester_email: String,
    pub repository_name: String,
    pub repository_url: String,
    pub target_commit_hash: Option<String>,
    /// Ordered landing path; the order is preserved on the stored row.
    pub landing_path: Vec<JobRevision>,
    pub priority: i64,
}

/// Token proving the table-level lock is held.
#[derive(Debug)]
pub struct QueueGuard {
    _lock: LockFile,
}

/// A job claimed for processing. Holds the row-level lock until dropped.
#[derive(Debug)]
pub struct ClaimedJob {
    store: JobStore,
    job: LandingJob,
    _lock: LockFile,
}

/// Outcome of a cancellation request.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    NotOwner,
    NotCancellable(JobStatus),
}

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("jobs"))
            .with_context(|| format!("failed to create job dir under {}", root.display()))?;
        fs::create_dir_all(root.join("locks"))
            .with_context(|| format!("failed to create lock dir under {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the table-level lock. Submission critical sections and claim
    /// scans run under this.
    pub fn lock_queue(&self) -> Result<QueueGuard> {
        let lock = LockFile::acquire_with_timeout(&self.queue_lock_path(), QUEUE_LOCK_STALE)
            .context("failed to acquire queue lock")?;
        Ok(QueueGuard { _lock: lock })
    }

    /// Reserve the next job id. Requires the queue lock; patch artefact
    /// names embed the id, so submission reserves it before uploading.
    pub fn reserve_job_id(&self, _guard: &QueueGuard) -> Result<i64> {
        self.allocate_id()
    }

    /// Insert a new SUBMITTED job. Requires the queue lock.
    pub fn create_job(&self, guard: &QueueGuard, new: NewJob) -> Result<LandingJob> {
        let id = self.reserve_job_id(guard)?;
        self.create_job_with_id(guard, id, new)
    }

    /// Insert a new SUBMITTED job under a previously reserved id.
    pub fn create_job_with_id(
        &self,
        _guard: &QueueGuard,
        id: i64,
        new: NewJob,
    ) -> Result<LandingJob> {
        let now = Utc::now();
        let job = LandingJob {
            id,
            status: JobStatus::Submitted,
            requester_email: new.requester_email,
            repository_name: new.repository_name.clone(),
            repository_url: new.repository_url,
            target_commit_hash: new.target_commit_hash,
            landing_path: new.landing_path,
            priority: new.priority,
            attempts: 0,
            duration_seconds: 0,
            created_at: now,
            updated_at: now,
            error: None,
            error_breakdown: None,
            landed_commit_id: None,
            formatted_replacements: None,
        };
        self.write_job(&job)?;
        self.record_event(JobEvent::new(
            job.id,
            JobEventKind::Submitted {
                repository: new.repository_name,
            },
        ));
        Ok(job)
    }

    /// Overwrite a stored row as-is. Requires the queue lock; used by
    /// admin tooling and test fixtures, never by the worker path.
    pub fn put_job(&self, _guard: &QueueGuard, job: &LandingJob) -> Result<()> {
        self.write_job(job)
    }

    pub fn job(&self, id: i64) -> Result<Option<LandingJob>> {
        let path = self.job_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_job(&path)?))
    }

    /// Every stored job, ordered by id.
    pub fn all_jobs(&self) -> Result<Vec<LandingJob>> {
        let mut jobs = Vec::new();
        let dir = self.root.join("jobs");
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read job dir {}", dir.display()))?
        {
            let path = entry.context("failed to read job dir entry")?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                jobs.push(read_job(&path)?);
            }
        }
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    /// All jobs whose landing path intersects `revisions`.
    pub fn jobs_for_revisions(&self, revisions: &[RevisionId]) -> Result<Vec<LandingJob>> {
        let wanted: BTreeSet<RevisionId> = revisions.iter().copied().collect();
        Ok(self
            .all_jobs()?
            .into_iter()
            .filter(|job| job.revision_ids().iter().any(|r| wanted.contains(r)))
            .collect())
    }

    /// The first job in an active status over any of `revisions`, if any.
    pub fn active_job_for_revisions(
        &self,
        revisions: &[RevisionId],
    ) -> Result<Option<LandingJob>> {
        Ok(self
            .jobs_for_revisions(revisions)?
            .into_iter()
            .find(|job| job.status.is_active()))
    }

    /// The most recently updated LANDED job containing `revision`, for the
    /// previously-landed warning.
    pub fn last_landed_job_for_revision(
        &self,
        revision: RevisionId,
    ) -> Result<Option<LandingJob>> {
        let mut landed: Vec<LandingJob> = self
            .jobs_for_revisions(&[revision])?
            .into_iter()
            .filter(|job| job.status == JobStatus::Landed)
            .collect();
        landed.sort_by_key(|job| (job.updated_at, job.id));
        Ok(landed.pop())
    }

    /// Claim the top queued job for one of `repositories`, locking its row.
    ///
    /// Jobs younger than `grace` are left alone so a submitter can still
    /// cancel a freshly created job before the worker picks it up. Rows
    /// whose lock is already held, or that left an active status while we
    /// were scanning (a concurrent cancel won the race), are skipped.
    pub fn next_job_for_update(
        &self,
        repositories: &BTreeSet<String>,
        grace: Duration,
    ) -> Result<Option<ClaimedJob>> {
        let _guard = self.lock_queue()?;

        let cutoff = Utc::now() - chrono::Duration::seconds(grace.as_secs() as i64);
        let mut candidates: Vec<LandingJob> = self
            .all_jobs()?
            .into_iter()
            .filter(|job| {
                job.status.is_active()
                    && repositories.contains(&job.repository_name)
                    && job.created_at < cutoff
            })
            .collect();
        candidates.sort_by_key(|job| {
            (
                job.status.claim_rank(),
                std::cmp::Reverse(job.priority),
                job.created_at,
                job.id,
            )
        });

        for candidate in candidates {
            let Some(lock) = LockFile::try_acquire(&self.job_lock_path(candidate.id))? else {
                continue;
            };
            // Re-read under the row lock; the row may have changed between
            // the scan and the lock acquisition.
            let Some(job) = self.job(candidate.id)? else {
                continue;
            };
            if !job.status.is_active() {
                continue;
            }
            return Ok(Some(ClaimedJob {
                store: self.clone(),
                job,
                _lock: lock,
            }));
        }

        Ok(None)
    }

    /// Cancel a job on behalf of `requester_email`.
    pub fn cancel(&self, id: i64, requester_email: &str) -> Result<CancelOutcome> {
        let _guard = self.lock_queue()?;

        let Some(job) = self.job(id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.requester_email != requester_email {
            return Ok(CancelOutcome::NotOwner);
        }

        // If the worker holds the row lock it won the race; the job is
        // effectively in progress whatever the row still says.
        let Some(_lock) = LockFile::try_acquire(&self.job_lock_path(id))? else {
            return Ok(CancelOutcome::NotCancellable(job.status));
        };

        let Some(mut job) = self.job(id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.transition(JobAction::Cancel, Utc::now()).is_err() {
            return Ok(CancelOutcome::NotCancellable(job.status));
        }
        self.write_job(&job)?;
        self.record_event(JobEvent::new(
            id,
            JobEventKind::Transitioned {
                action: "CANCEL".to_string(),
                status: JobStatus::Cancelled,
            },
        ));
        Ok(CancelOutcome::Cancelled)
    }

    fn allocate_id(&self) -> Result<i64> {
        let path = self.root.join("next_id");
        let next = match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse::<i64>().unwrap_or(0) + 1,
            Err(_) => 1,
        };
        fs::write(&path, next.to_string())
            .with_context(|| format!("failed to write id counter {}", path.display()))?;
        Ok(next)
    }

    fn write_job(&self, job: &LandingJob) -> Result<()> {
        atomic_write_json(&self.job_path(job.id), job)
    }

    fn record_event(&self, event: JobEvent) {
        // The event log is an audit aid; failing to append must never fail
        // the operation that produced the event.
        let _ = events::append_event(&events::events_path(&self.root), &event);
    }

    fn job_path(&self, id: i64) -> PathBuf {
        self.root.join("jobs").join(format!("job-{id:06}.json"))
    }

    fn job_lock_path(&self, id: i64) -> PathBuf {
        self.root.join("locks").join(format!("job-{id}.lock"))
    }

    fn queue_lock_path(&self) -> PathBuf {
        self.root.join("locks").join("queue.lock")
    }
}

impl ClaimedJob {
    pub fn job(&self) -> &LandingJob {
        &self.job
    }

    /// Flip the claimed row to IN_PROGRESS and bump the attempt counter.
    pub fn begin(&mut self) -> Result<()> {
        self.job
            .begin(Utc::now())
            .context("claimed job cannot begin processing")?;
        self.store.write_job(&self.job)?;
        self.store.record_event(JobEvent::new(
            self.job.id,
            JobEventKind::Claimed {
                attempt: self.job.attempts,
            },
        ));
        Ok(())
    }

    /// Apply a state-machine action and persist the row.
    pub fn transition(&mut self, action: JobAction) -> Result<()> {
        let name = action.name();
        self.job
            .transition(action, Utc::now())
            .with_context(|| format!("invalid transition on job {}", self.job.id))?;
        self.store.write_job(&self.job)?;
        self.store.record_event(JobEvent::new(
            self.job.id,
            JobEventKind::Transitioned {
                action: name.to_string(),
                status: self.job.status,
            },
        ));
        Ok(())
    }

    /// Mutate non-status fields (duration, breakdown, replacements) and
    /// persist the row.
    pub fn update<F: FnOnce(&mut LandingJob)>(&mut self, mutate: F) -> Result<()> {
        mutate(&mut self.job);
        self.job.updated_at = Utc::now();
        self.store.write_job(&self.job)
    }
}

fn read_job(path: &Path) -> Result<LandingJob> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read job file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse job JSON {}", path.display()))
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    // Make the rename durable across a crash.
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn new_job(repo: &str, revision: i64) -> NewJob {
        NewJob {
            requester_email: "joe@example.com".to_string(),
            repository_name: repo.to_string(),
            repository_url: format!("https://hg.example.com/{repo}"),
            target_commit_hash: None,
            landing_path: vec![JobRevision {
                revision_id: RevisionId(revision),
                diff_id: revision * 10,
                patch_name: format!("L0_D{revision}_{}.patch", revision * 10),
            }],
            priority: 0,
        }
    }

    fn age_job(store: &JobStore, id: i64, seconds: i64) {
        let guard = store.lock_queue().expect("lock");
        let mut job = store.job(id).expect("read").expect("exists");
        job.created_at = Utc::now() - chrono::Duration::seconds(seconds);
        store.put_job(&guard, &job).expect("put");
    }

    fn repos(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn create_assigns_monotonic_ids() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let first = store.create_job(&guard, new_job("central", 1)).expect("create");
        let second = store.create_job(&guard, new_job("central", 2)).expect("create");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.status, JobStatus::Submitted);
    }

    #[test]
    fn claim_respects_grace_window() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);

        let claimed = store
            .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
            .expect("claim");
        assert!(claimed.is_none(), "fresh jobs must not be claimed");

        age_job(&store, job.id, 120);
        let claimed = store
            .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
            .expect("claim");
        assert_eq!(claimed.expect("claimed").job().id, job.id);
    }

    #[test]
    fn claim_filters_by_repository() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("beta", 1)).expect("create");
        drop(guard);
        age_job(&store, job.id, 300);

        assert!(
            store
                .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
                .expect("claim")
                .is_none()
        );
        assert!(
            store
                .next_job_for_update(&repos(&["beta", "central"]), Duration::from_secs(60))
                .expect("claim")
                .is_some()
        );
    }

    #[test]
    fn claim_prefers_in_progress_then_priority_then_age() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let old = store.create_job(&guard, new_job("central", 1)).expect("create");
        let urgent = store.create_job(&guard, new_job("central", 2)).expect("create");
        let resumed = store.create_job(&guard, new_job("central", 3)).expect("create");

        let mut urgent_row = store.job(urgent.id).expect("read").expect("exists");
        urgent_row.priority = 10;
        store.put_job(&guard, &urgent_row).expect("put");

        let mut resumed_row = store.job(resumed.id).expect("read").expect("exists");
        resumed_row.status = JobStatus::InProgress;
        store.put_job(&guard, &resumed_row).expect("put");
        drop(guard);

        for id in [old.id, urgent.id, resumed.id] {
            age_job(&store, id, 600);
        }
        // Make `old` strictly older than `urgent`.
        age_job(&store, old.id, 900);

        let repos = repos(&["central"]);
        let first = store
            .next_job_for_update(&repos, Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        assert_eq!(first.job().id, resumed.id, "IN_PROGRESS resumes first");

        let second = store
            .next_job_for_update(&repos, Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        assert_eq!(second.job().id, urgent.id, "priority beats age");

        let third = store
            .next_job_for_update(&repos, Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        assert_eq!(third.job().id, old.id);

        // All rows locked now; nothing left to claim.
        assert!(
            store
                .next_job_for_update(&repos, Duration::from_secs(60))
                .expect("claim")
                .is_none()
        );
    }

    #[test]
    fn claimed_job_locks_out_other_claims_until_dropped() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);
        age_job(&store, job.id, 300);

        let repos = repos(&["central"]);
        let claimed = store
            .next_job_for_update(&repos, Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        assert!(
            store
                .next_job_for_update(&repos, Duration::from_secs(60))
                .expect("claim")
                .is_none()
        );
        drop(claimed);
        assert!(
            store
                .next_job_for_update(&repos, Duration::from_secs(60))
                .expect("claim")
                .is_some()
        );
    }

    #[test]
    fn transitions_persist_to_disk() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);
        age_job(&store, job.id, 300);

        let mut claimed = store
            .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        claimed.begin().expect("begin");
        claimed
            .transition(JobAction::Land {
                commit_id: "f".repeat(40),
            })
            .expect("land");
        drop(claimed);

        let row = store.job(job.id).expect("read").expect("exists");
        assert_eq!(row.status, JobStatus::Landed);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.landed_commit_id.as_deref(), Some("f".repeat(40).as_str()));
    }

    #[test]
    fn cancel_requires_ownership() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);

        assert_eq!(
            store.cancel(job.id, "mallory@example.com").expect("cancel"),
            CancelOutcome::NotOwner
        );
        assert_eq!(
            store.cancel(job.id, "joe@example.com").expect("cancel"),
            CancelOutcome::Cancelled
        );
        let row = store.job(job.id).expect("read").expect("exists");
        assert_eq!(row.status, JobStatus::Cancelled);
    }

    #[test]
    fn cancel_loses_the_race_against_a_claimed_job() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);
        age_job(&store, job.id, 300);

        let _claimed = store
            .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
            .expect("claim")
            .expect("job");
        assert_eq!(
            store.cancel(job.id, "joe@example.com").expect("cancel"),
            CancelOutcome::NotCancellable(JobStatus::Submitted)
        );
    }

    #[test]
    fn cancelled_jobs_are_skipped_by_the_claim_scan() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");
        drop(guard);
        age_job(&store, job.id, 300);

        assert_eq!(
            store.cancel(job.id, "joe@example.com").expect("cancel"),
            CancelOutcome::Cancelled
        );
        assert!(
            store
                .next_job_for_update(&repos(&["central"]), Duration::from_secs(60))
                .expect("claim")
                .is_none()
        );
    }

    #[test]
    fn jobs_for_revisions_intersects_paths() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        store.create_job(&guard, new_job("central", 1)).expect("create");
        store.create_job(&guard, new_job("central", 2)).expect("create");
        drop(guard);

        let hits = store
            .jobs_for_revisions(&[RevisionId(2), RevisionId(9)])
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].revision_ids(), vec![RevisionId(2)]);
    }

    #[test]
    fn active_job_lookup_sees_submitted_and_deferred() {
        let td = tempdir().expect("tempdir");
        let store = JobStore::open(td.path()).expect("open");
        let guard = store.lock_queue().expect("lock");
        let job = store.create_job(&guard, new_job("central", 1)).expect("create");

        assert!(
            store
                .active_job_for_revisions(&[RevisionId(1)])
                .expect("query")
                .is_some()
        );

        let mut row = store.job(job.id).expect("read").expect("exists");
        row.status = JobStatus::Landed;
        store.put_job(&guard, &row).expect("put");
        assert!(
            store
                .active_job_for_revisions(&[RevisionId(1)])
                .expect("query")
                .is_none()
        );
    }
}
