//! Shared fixtures for the crate's tests: canned stack data and an
//! in-memory review service.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::review::{
    Diff, DiffCommit, Repository, Reviewer, ReviewerStatus, Revision, RevisionStatus,
    ReviewService, StackData,
};
use crate::types::{AccessGroup, DiffId, Phid, RepoConfig, RevisionId};

pub fn phid(id: i64) -> Phid {
    Phid(format!("PHID-DREV-{id}"))
}

pub fn repo_phid(name: &str) -> Phid {
    Phid(format!("PHID-REPO-{name}"))
}

pub fn diff_phid(id: i64) -> Phid {
    Phid(format!("PHID-DIFF-{id}"))
}

pub fn accepted_reviewer(user: i64, diff: DiffId) -> Reviewer {
    Reviewer {
        phid: Phid(format!("PHID-USER-{user}")),
        status: ReviewerStatus::Accepted,
        diff_phid: Some(diff_phid(diff)),
    }
}

pub fn revision(id: i64, repo: &str, status: RevisionStatus) -> Revision {
    Revision {
        id: RevisionId(id),
        phid: phid(id),
        title: format!("Fix thing {id}"),
        summary: format!("Summary for {id}"),
        bug_id: None,
        status,
        repository_phid: Some(repo_phid(repo)),
        diff_phid: diff_phid(id * 10),
        author_phid: Phid("PHID-USER-author".to_string()),
        projects: Vec::new(),
        reviewers: vec![accepted_reviewer(2, id * 10)],
        uplift_request: None,
        date_modified: 1_700_000_000,
    }
}

pub fn diff(revision: &Revision) -> Diff {
    Diff {
        id: revision.id.0 * 10,
        phid: revision.diff_phid.clone(),
        revision_phid: revision.phid.clone(),
        base_commit_hash: Some("abcdef123456".to_string()),
        author_name: Some("Joe Tester".to_string()),
        author_email: Some("joe@example.com".to_string()),
        commits: vec![DiffCommit {
            identifier: "deadbeef".to_string(),
            author_name: Some("Joe Tester".to_string()),
            author_email: Some("joe@example.com".to_string()),
        }],
    }
}

pub fn stack_data(revisions: Vec<Revision>) -> StackData {
    let mut data = StackData::default();
    for r in revisions {
        data.diffs.insert(r.diff_phid.clone(), diff(&r));
        if let Some(repo) = &r.repository_phid {
            data.repositories.insert(
                repo.clone(),
                Repository {
                    phid: repo.clone(),
                    short_name: repo.0.trim_start_matches("PHID-REPO-").to_string(),
                },
            );
        }
        data.revisions.insert(r.phid.clone(), r);
    }
    data
}

pub fn repo_config(name: &str) -> RepoConfig {
    RepoConfig {
        name: name.to_string(),
        url: format!("https://hg.example.com/{name}"),
        pull_path: format!("https://hg.example.com/{name}"),
        push_path: format!("ssh://hg.example.com/{name}"),
        push_bookmark: None,
        force_push: false,
        approval_required: false,
        autoformat_enabled: false,
        autoformat_command: Vec::new(),
        access_group: AccessGroup {
            active_group: format!("active_scm_{name}"),
            membership_group: format!("all_scm_{name}"),
            display_name: "Level 3 Commit Access".to_string(),
        },
        product_details_url: None,
        milestone_tracking_flag_template: None,
        review_repo_identifier: None,
        testing_policy_enforced: false,
    }
}

/// In-memory [`ReviewService`] backed by canned stack data.
pub struct FakeReview {
    pub data: StackData,
    pub edges: Vec<(Phid, Phid)>,
    pub names: BTreeMap<Phid, String>,
    pub unresolved: BTreeSet<RevisionId>,
    pub raw_diffs: BTreeMap<DiffId, String>,
    pub removed_tags: RefCell<Vec<(Phid, Phid)>>,
    pub repo_updates: RefCell<Vec<String>>,
}

impl FakeReview {
    pub fn new(data: StackData, edges: Vec<(Phid, Phid)>) -> Self {
        Self {
            data,
            edges,
            names: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            raw_diffs: BTreeMap::new(),
            removed_tags: RefCell::new(Vec::new()),
            repo_updates: RefCell::new(Vec::new()),
        }
    }
}

impl ReviewService for FakeReview {
    fn find_revision(&self, id: RevisionId) -> Result<Option<Phid>> {
        Ok(self.data.revision_by_id(id).map(|r| r.phid.clone()))
    }

    fn related_edges(&self, phids: &[Phid]) -> Result<Vec<(Phid, Phid)>> {
        Ok(self
            .edges
            .iter()
            .filter(|(child, parent)| phids.contains(child) || phids.contains(parent))
            .cloned()
            .collect())
    }

    fn stack_data(&self, phids: &[Phid]) -> Result<StackData> {
        let mut data = StackData::default();
        for phid in phids {
            if let Some(revision) = self.data.revisions.get(phid) {
                data.revisions.insert(phid.clone(), revision.clone());
                if let Some(diff) = self.data.diffs.get(&revision.diff_phid) {
                    data.diffs.insert(diff.phid.clone(), diff.clone());
                }
                if let Some(repo) = &revision.repository_phid
                    && let Some(repository) = self.data.repositories.get(repo)
                {
                    data.repositories.insert(repo.clone(), repository.clone());
                }
            }
        }
        Ok(data)
    }

    fn raw_diff(&self, diff_id: DiffId) -> Result<String> {
        Ok(self
            .raw_diffs
            .get(&diff_id)
            .cloned()
            .unwrap_or_else(|| default_raw_diff(diff_id)))
    }

    fn actor_names(&self, phids: &[Phid]) -> Result<BTreeMap<Phid, String>> {
        Ok(phids
            .iter()
            .map(|p| {
                let name = self
                    .names
                    .get(p)
                    .cloned()
                    .unwrap_or_else(|| p.0.trim_start_matches("PHID-USER-").to_string());
                (p.clone(), name)
            })
            .collect())
    }

    fn has_unresolved_comments(&self, revision: RevisionId) -> Result<bool> {
        Ok(self.unresolved.contains(&revision))
    }

    fn project_phid(&self, slug: &str) -> Result<Option<Phid>> {
        Ok(Some(Phid(format!("PHID-PROJ-{slug}"))))
    }

    fn remove_project_tag(&self, revision: &Phid, project: &Phid) -> Result<()> {
        self.removed_tags
            .borrow_mut()
            .push((revision.clone(), project.clone()));
        Ok(())
    }

    fn trigger_repo_update(&self, identifier: &str) -> Result<()> {
        self.repo_updates.borrow_mut().push(identifier.to_string());
        Ok(())
    }

    fn healthy(&self) -> Result<()> {
        Ok(())
    }
}

/// Tree status fake with a shared, mutable state map. Trees not present
/// in the map are open, matching the real service's 404 semantics.
#[derive(Clone, Default)]
pub struct FakeTreeStatus {
    states: Arc<Mutex<BTreeMap<String, String>>>,
}

impl FakeTreeStatus {
    pub fn set(&self, tree: &str, status: &str) {
        self.states
            .lock()
            .expect("tree status lock")
            .insert(tree.to_string(), status.to_string());
    }
}

impl crate::treestatus::TreeStatus for FakeTreeStatus {
    fn is_open(&self, tree: &str) -> Result<bool> {
        let states = self.states.lock().expect("tree status lock");
        Ok(states
            .get(tree)
            .map(|status| crate::treestatus::OPEN_STATUSES.contains(&status.as_str()))
            .unwrap_or(true))
    }

    fn healthy(&self) -> Result<()> {
        Ok(())
    }
}

pub fn default_raw_diff(diff_id: DiffId) -> String {
    format!(
        "diff --git a/file{diff_id}.txt b/file{diff_id}.txt\n\
         --- a/file{diff_id}.txt\n\
         +++ b/file{diff_id}.txt\n\
         @@ -1 +1 @@\n\
         -old\n\
         +new {diff_id}\n"
    )
}
