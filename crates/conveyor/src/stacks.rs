//! Stack graphs and the landable-path calculation.
//!
//! A stack is the connected component of revisions reachable from a seed
//! revision over parent/child edges. [`calculate_landable_subgraphs`]
//! decides which paths through that graph may land and why every other
//! revision is blocked.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::review::{Diff, Repository, Revision, ReviewService, StackData};
use crate::types::Phid;

/// A per-revision check injected into the landable calculation. Returns a
/// blocking reason, or `None` when the revision passes. Checks must only
/// look at the single revision, never at the graph structure.
pub type BlockerCheck<'a> = dyn Fn(&Revision, &Diff, Option<&Repository>) -> Option<String> + 'a;

/// Expand the stack containing `seed` to closure by repeatedly asking the
/// review service for edges touching the known frontier.
///
/// Returns `(nodes, edges)` where edges are `(child, parent)` pairs.
pub fn build_stack_graph(
    review: &dyn ReviewService,
    seed: &Phid,
) -> Result<(BTreeSet<Phid>, BTreeSet<(Phid, Phid)>)> {
    let mut nodes: BTreeSet<Phid> = BTreeSet::new();
    let mut edges: BTreeSet<(Phid, Phid)> = BTreeSet::new();
    let mut frontier: BTreeSet<Phid> = BTreeSet::from([seed.clone()]);

    while !frontier.is_empty() {
        nodes.extend(frontier.iter().cloned());
        let found = review.related_edges(&nodes.iter().cloned().collect::<Vec<_>>())?;

        let mut new_frontier = BTreeSet::new();
        for (child, parent) in found {
            if !nodes.contains(&child) {
                new_frontier.insert(child.clone());
            }
            if !nodes.contains(&parent) {
                new_frontier.insert(parent.clone());
            }
            edges.insert((child, parent));
        }
        frontier = new_frontier;
    }

    Ok((nodes, edges))
}

/// Adjacency lists over a stack graph.
pub struct RevisionStack {
    pub nodes: BTreeSet<Phid>,
    pub children: BTreeMap<Phid, BTreeSet<Phid>>,
    pub parents: BTreeMap<Phid, BTreeSet<Phid>>,
}

impl RevisionStack {
    pub fn new(nodes: BTreeSet<Phid>, edges: &BTreeSet<(Phid, Phid)>) -> Self {
        let mut children: BTreeMap<Phid, BTreeSet<Phid>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        let mut parents: BTreeMap<Phid, BTreeSet<Phid>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for (child, parent) in edges {
            if nodes.contains(child) && nodes.contains(parent) {
                children.entry(parent.clone()).or_default().insert(child.clone());
                parents.entry(child.clone()).or_default().insert(parent.clone());
            }
        }
        Self {
            nodes,
            children,
            parents,
        }
    }

    fn children_of(&self, phid: &Phid) -> impl Iterator<Item = &Phid> {
        self.children.get(phid).into_iter().flatten()
    }

    fn parents_of(&self, phid: &Phid) -> impl Iterator<Item = &Phid> {
        self.parents.get(phid).into_iter().flatten()
    }
}

/// Compute `(landable_paths, blocked)` for a stack.
///
/// Every revision of the graph ends up either on some landable path or in
/// the blocked map with a human-readable reason. Children at a fork are
/// visited in ascending revision-id order so the result is deterministic.
pub fn calculate_landable_subgraphs(
    data: &StackData,
    edges: &BTreeSet<(Phid, Phid)>,
    landable_repos: &BTreeSet<Phid>,
    other_checks: &[&BlockerCheck],
) -> (Vec<Vec<Phid>>, BTreeMap<Phid, String>) {
    let mut blocked: BTreeMap<Phid, String> = BTreeMap::new();
    // First reason wins.
    fn block(blocked: &mut BTreeMap<Phid, String>, node: &Phid, reason: String) {
        blocked.entry(node.clone()).or_insert(reason);
    }

    // Unsupported or unset repositories block outright.
    for (phid, revision) in &data.revisions {
        match &revision.repository_phid {
            None => block(
                &mut blocked,
                phid,
                "Revision's repository is unset. Specify a target repository in the review service."
                    .to_string(),
            ),
            Some(repo) if !landable_repos.contains(repo) => {
                block(&mut blocked, phid, "Repository is not supported.".to_string());
            }
            Some(_) => {}
        }
    }

    for (phid, revision) in &data.revisions {
        if revision.status.closed() {
            block(&mut blocked, phid, "Revision is closed.".to_string());
        }
    }

    let stack = RevisionStack::new(data.revisions.keys().cloned().collect(), edges);
    let closed = |phid: &Phid| {
        data.revisions
            .get(phid)
            .map(|r| r.status.closed())
            .unwrap_or(true)
    };

    // True roots of the DAG.
    let mut roots: BTreeSet<Phid> = stack
        .nodes
        .iter()
        .filter(|n| stack.parents_of(n).next().is_none())
        .cloned()
        .collect();

    // Roots may be closed; walk through them to the first open revisions.
    let mut to_process: Vec<Phid> = roots.iter().cloned().collect();
    roots = BTreeSet::new();
    while let Some(phid) = to_process.pop() {
        if !closed(&phid) {
            roots.insert(phid);
            continue;
        }
        to_process.extend(stack.children_of(&phid).cloned());
    }

    // Promotion through closed ancestors can yield a "root" that descends
    // from another; those must not start their own paths.
    let mut to_process: Vec<Phid> = roots
        .iter()
        .flat_map(|root| stack.children_of(root).cloned())
        .collect();
    while let Some(phid) = to_process.pop() {
        roots.remove(&phid);
        to_process.extend(stack.children_of(&phid).cloned());
    }

    roots.retain(|phid| !blocked.contains_key(phid));

    // Paths may only start at unblocked roots.
    let mut open_roots = BTreeSet::new();
    for root in roots {
        match blocked_by(&root, data, &stack, &blocked, other_checks) {
            None => {
                open_roots.insert(root);
            }
            Some(reason) => block(&mut blocked, &root, reason),
        }
    }

    // Walk from the unblocked roots, extending paths through unblocked
    // open children. A path ends where no valid child remains.
    let mut landable: BTreeSet<Phid> = open_roots.clone();
    let mut paths: Vec<Vec<Phid>> = Vec::new();
    let mut to_process: Vec<Vec<Phid>> = sorted_by_revision_id(data, open_roots)
        .into_iter()
        .map(|root| vec![root])
        .collect();
    while let Some(path) = to_process.pop() {
        let Some(tail) = path.last().cloned() else {
            continue;
        };
        let mut valid_children = Vec::new();
        for child in sorted_by_revision_id(data, stack.children_of(&tail).cloned().collect()) {
            if closed(&child) {
                continue;
            }
            match blocked_by(&child, data, &stack, &blocked, other_checks) {
                None => {
                    valid_children.push(child.clone());
                    landable.insert(child);
                }
                Some(reason) => block(&mut blocked, &child, reason),
            }
        }

        if valid_children.is_empty() {
            paths.push(path);
        } else {
            for child in valid_children {
                let mut extended = path.clone();
                extended.push(child);
                to_process.push(extended);
            }
        }
    }

    // Descendants never reached by a landable walk.
    for phid in stack.nodes.difference(&landable) {
        if !blocked.contains_key(phid) {
            blocked.insert(
                phid.clone(),
                "Has an open ancestor revision that is blocked.".to_string(),
            );
        }
    }

    paths.sort();
    (paths, blocked)
}

fn blocked_by(
    phid: &Phid,
    data: &StackData,
    stack: &RevisionStack,
    blocked: &BTreeMap<Phid, String>,
    other_checks: &[&BlockerCheck],
) -> Option<String> {
    if let Some(reason) = blocked.get(phid) {
        return Some(reason.clone());
    }

    let revision = data.revisions.get(phid)?;
    let closed = |p: &Phid| {
        data.revisions
            .get(p)
            .map(|r| r.status.closed())
            .unwrap_or(true)
    };

    let open_parents: Vec<&Phid> = stack.parents_of(phid).filter(|p| !closed(p)).collect();
    if open_parents.len() > 1 {
        return Some("Depends on multiple open parents.".to_string());
    }

    for parent in &open_parents {
        if blocked.contains_key(*parent) {
            let parent_id = data.revisions.get(*parent).map(|r| r.id.to_string());
            return Some(format!(
                "Depends on {} which is open and blocked.",
                parent_id.unwrap_or_else(|| (*parent).to_string())
            ));
        }
    }

    if let Some(parent) = open_parents.first()
        && let Some(parent_revision) = data.revisions.get(*parent)
        && parent_revision.repository_phid != revision.repository_phid
    {
        return Some(format!(
            "Depends on {} which is open and has a different repository.",
            parent_revision.id
        ));
    }

    let diff = data.diff_for(revision)?;
    let repo = revision
        .repository_phid
        .as_ref()
        .and_then(|phid| data.repositories.get(phid));
    for check in other_checks {
        if let Some(reason) = check(revision, diff, repo) {
            return Some(reason);
        }
    }

    None
}

fn sorted_by_revision_id(data: &StackData, phids: BTreeSet<Phid>) -> Vec<Phid> {
    let mut phids: Vec<Phid> = phids.into_iter().collect();
    phids.sort_by_key(|phid| data.revisions.get(phid).map(|r| r.id.0).unwrap_or(i64::MAX));
    phids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{DiffCommit, RevisionStatus};
    use crate::types::{DiffId, RevisionId};

    fn revision(id: i64, repo: &str, status: RevisionStatus) -> Revision {
        Revision {
            id: RevisionId(id),
            phid: Phid(format!("PHID-DREV-{id}")),
            title: format!("revision {id}"),
            summary: String::new(),
            bug_id: None,
            status,
            repository_phid: Some(Phid(format!("PHID-REPO-{repo}"))),
            diff_phid: Phid(format!("PHID-DIFF-{id}")),
            author_phid: Phid("PHID-USER-author".to_string()),
            projects: Vec::new(),
            reviewers: Vec::new(),
            uplift_request: None,
            date_modified: 1_700_000_000,
        }
    }

    fn diff(id: DiffId, revision: i64) -> Diff {
        Diff {
            id,
            phid: Phid(format!("PHID-DIFF-{revision}")),
            revision_phid: Phid(format!("PHID-DREV-{revision}")),
            base_commit_hash: None,
            author_name: Some("Joe".to_string()),
            author_email: Some("joe@example.com".to_string()),
            commits: vec![DiffCommit {
                identifier: "deadbeef".to_string(),
                author_name: None,
                author_email: None,
            }],
        }
    }

    fn stack_data(revisions: Vec<Revision>) -> StackData {
        let mut data = StackData::default();
        for r in revisions {
            data.diffs.insert(r.diff_phid.clone(), diff(r.id.0 * 10, r.id.0));
            for repo in &r.repository_phid {
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

    fn phid(id: i64) -> Phid {
        Phid(format!("PHID-DREV-{id}"))
    }

    fn edge(child: i64, parent: i64) -> (Phid, Phid) {
        (phid(child), phid(parent))
    }

    fn central() -> BTreeSet<Phid> {
        BTreeSet::from([Phid("PHID-REPO-central".to_string())])
    }

    #[test]
    fn linear_stack_lands_as_one_path() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(2, "central", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(2, 1)]);
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[]);
        assert_eq!(paths, vec![vec![phid(1), phid(2)]]);
        assert!(blocked.is_empty());
    }

    #[test]
    fn closed_root_is_walked_through() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Published),
            revision(2, "central", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(2, 1)]);
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[]);
        assert_eq!(paths, vec![vec![phid(2)]]);
        assert_eq!(blocked.get(&phid(1)).map(String::as_str), Some("Revision is closed."));
    }

    #[test]
    fn unsupported_repository_blocks_the_whole_chain() {
        let data = stack_data(vec![
            revision(1, "weird", RevisionStatus::Accepted),
            revision(2, "weird", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(2, 1)]);
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[]);
        assert!(paths.is_empty());
        assert_eq!(
            blocked.get(&phid(1)).map(String::as_str),
            Some("Repository is not supported.")
        );
        // The child never gets reached by a landable walk.
        assert!(blocked.contains_key(&phid(2)));
    }

    #[test]
    fn multiple_open_parents_block_the_merge_point() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(2, "central", RevisionStatus::Accepted),
            revision(3, "central", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(3, 1), edge(3, 2)]);
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[]);
        assert_eq!(paths, vec![vec![phid(1)], vec![phid(2)]]);
        assert_eq!(
            blocked.get(&phid(3)).map(String::as_str),
            Some("Depends on multiple open parents.")
        );
    }

    #[test]
    fn cross_repository_parent_blocks_the_child() {
        let mut revisions = vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(2, "beta", RevisionStatus::Accepted),
        ];
        revisions[1].repository_phid = Some(Phid("PHID-REPO-beta".to_string()));
        let data = stack_data(revisions);
        let edges = BTreeSet::from([edge(2, 1)]);
        let landable = BTreeSet::from([
            Phid("PHID-REPO-central".to_string()),
            Phid("PHID-REPO-beta".to_string()),
        ]);
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &landable, &[]);
        assert_eq!(paths, vec![vec![phid(1)]]);
        assert_eq!(
            blocked.get(&phid(2)).map(String::as_str),
            Some("Depends on D1 which is open and has a different repository.")
        );
    }

    #[test]
    fn fork_children_are_visited_in_ascending_id_order() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(5, "central", RevisionStatus::Accepted),
            revision(3, "central", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(5, 1), edge(3, 1)]);
        let (paths, _) = calculate_landable_subgraphs(&data, &edges, &central(), &[]);
        assert_eq!(
            paths,
            vec![vec![phid(1), phid(3)], vec![phid(1), phid(5)]]
        );
    }

    #[test]
    fn injected_check_blocks_and_descendants_inherit() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(2, "central", RevisionStatus::Accepted),
        ]);
        let edges = BTreeSet::from([edge(2, 1)]);
        let check: &BlockerCheck = &|revision, _diff, _repo| {
            (revision.id == RevisionId(1)).then(|| "The author planned changes.".to_string())
        };
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[check]);
        assert!(paths.is_empty());
        assert_eq!(
            blocked.get(&phid(1)).map(String::as_str),
            Some("The author planned changes.")
        );
        assert_eq!(
            blocked.get(&phid(2)).map(String::as_str),
            Some("Has an open ancestor revision that is blocked.")
        );
    }

    #[test]
    fn blocked_open_parent_reason_names_the_parent() {
        let data = stack_data(vec![
            revision(1, "central", RevisionStatus::Accepted),
            revision(2, "central", RevisionStatus::Accepted),
            revision(3, "central", RevisionStatus::Accepted),
        ]);
        // 1 <- 2 <- 3 with a check blocking 2.
        let edges = BTreeSet::from([edge(2, 1), edge(3, 2)]);
        let check: &BlockerCheck = &|revision, _diff, _repo| {
            (revision.id == RevisionId(2)).then(|| "blocked by check".to_string())
        };
        let (paths, blocked) = calculate_landable_subgraphs(&data, &edges, &central(), &[check]);
        assert_eq!(paths, vec![vec![phid(1)]]);
        assert_eq!(
            blocked.get(&phid(3)).map(String::as_str),
            Some("Has an open ancestor revision that is blocked.")
        );
    }
}
