//! The on-disk clone of one upstream repository.
//!
//! A worktree is acquired for exclusive push use with [`HgWorktree::for_push`];
//! the returned scope cleans the checkout on entry and again on every exit
//! path, applies patches, runs autoformatters and pushes. VCS failures are
//! mapped to structured errors the worker branches on.
//!
//! The VCS binary is resolved through `CONVEYOR_HG_BIN` so tests can
//! substitute a scripted fake.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use conveyor_patch::{Dialect, ParsedPatch, PatchError};

use crate::process::{self, CommandOutput};
use crate::types::HashReplacement;

/// Environment variable carrying the requester's identity to the upstream
/// push, so server-side hooks can attribute the landing.
pub const REQUEST_USER_ENV: &str = "CONVEYOR_REQUEST_USER";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

static PATCH_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A `.rej` file produced by a failed hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFile {
    /// Path of the reject file, relative to the checkout root.
    pub path: String,
    pub content: Option<String>,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("tree is closed")]
    TreeClosed(String),
    #[error("tree requires approval")]
    TreeApprovalRequired(String),
    #[error("lost push race")]
    LostPushRace(String),
    #[error("push failed: {0}")]
    PushError(String),
    #[error("patch conflict; rejects in {}", .rejects.iter().map(|r| r.path.as_str()).collect::<Vec<_>>().join(", "))]
    PatchConflict { rejects: Vec<RejectedFile> },
    #[error("patch does not carry a diff start line")]
    NoDiffStartLine,
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    #[error("autoformat failed")]
    Autoformat { stderr: String },
    #[error("failed to update repository: {0}")]
    Update(String),
    #[error("command timed out: {0}")]
    Timeout(String),
    #[error("command failed: {0}: {1}")]
    Command(String, String),
}

impl From<PatchError> for WorktreeError {
    fn from(err: PatchError) -> Self {
        WorktreeError::MalformedPatch(err.to_string())
    }
}

fn hg_program() -> String {
    env::var("CONVEYOR_HG_BIN").unwrap_or_else(|_| "hg".to_string())
}

/// Wrapper around one clone directory. Operations that mutate the
/// checkout are only reachable through a [`PushScope`].
#[derive(Debug)]
pub struct HgWorktree {
    path: PathBuf,
    timeout: Duration,
}

impl HgWorktree {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(path: &Path, timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the worktree for push use on behalf of `requester_email`.
    ///
    /// The checkout is cleaned before the scope is handed out and again
    /// when it drops, whatever happened in between.
    pub fn for_push(&self, requester_email: &str) -> PushScope<'_> {
        let scope = PushScope {
            tree: self,
            requester: requester_email.to_string(),
        };
        scope.clean();
        scope
    }
}

/// Exclusive push session over a worktree.
#[derive(Debug)]
pub struct PushScope<'a> {
    tree: &'a HgWorktree,
    requester: String,
}

impl Drop for PushScope<'_> {
    fn drop(&mut self) {
        // Cleanup never raises; a broken checkout is repaired on the next
        // acquisition.
        self.clean();
    }
}

impl PushScope<'_> {
    fn hg(&self, args: &[&str]) -> Result<CommandOutput, WorktreeError> {
        let program = hg_program();
        let command = format!("{program} {}", args.join(" "));
        let output = process::run_with_timeout(
            &program,
            args,
            &self.tree.path,
            &[(REQUEST_USER_ENV, self.requester.as_str())],
            self.tree.timeout,
        )
        .map_err(|err| WorktreeError::Command(command.clone(), format!("{err:#}")))?;

        if output.timed_out {
            return Err(WorktreeError::Timeout(command));
        }
        Ok(output)
    }

    fn hg_ok(&self, args: &[&str]) -> Result<CommandOutput, WorktreeError> {
        let output = self.hg(args)?;
        if !output.success() {
            return Err(WorktreeError::Command(
                format!("hg {}", args.join(" ")),
                output.combined(),
            ));
        }
        Ok(output)
    }

    /// Best-effort cleanup: revert, purge untracked files, strip any
    /// non-public commits.
    pub fn clean(&self) {
        let _ = self.hg(&["--quiet", "revert", "--no-backup", "--all"]);
        let _ = self.hg(&["purge", "--all"]);
        let _ = self.hg(&["strip", "--no-backup", "-r", "not public()"]);
    }

    /// Fetch from `pull_path` and update the working copy to
    /// `target_commit`, or to the remote head when no target is given.
    pub fn update_repo(
        &self,
        pull_path: &str,
        target_commit: Option<&str>,
    ) -> Result<(), WorktreeError> {
        self.clean();

        self.hg_ok(&["pull", pull_path])
            .map_err(|err| WorktreeError::Update(err.to_string()))?;

        let target = match target_commit {
            Some(target) => target.to_string(),
            None => self.remote_head(pull_path)?,
        };

        self.hg_ok(&["update", "--clean", "-r", &target])
            .map_err(|err| WorktreeError::Update(err.to_string()))?;
        Ok(())
    }

    fn remote_head(&self, pull_path: &str) -> Result<String, WorktreeError> {
        let output = self
            .hg_ok(&["identify", pull_path, "-r", "default"])
            .map_err(|err| WorktreeError::Update(err.to_string()))?;
        // Output may carry a bookmark or branch name after the hash.
        let head = output
            .stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if head.len() != 12 {
            return Err(WorktreeError::Update(format!(
                "unexpected identify output: {:?}",
                output.stdout
            )));
        }
        Ok(head)
    }

    /// Apply one patch: import its diff and commit with the parsed author
    /// and date.
    pub fn apply_patch(&self, patch_bytes: &[u8]) -> Result<(), WorktreeError> {
        let patch = ParsedPatch::parse(patch_bytes)?;

        // The export dialect must carry the explicit marker; it is what
        // keeps diff content out of the commit message.
        if patch.dialect == Dialect::HgExport && patch.diff_start_line.is_none() {
            return Err(WorktreeError::NoDiffStartLine);
        }

        let diff_file = self.write_temp_diff(&patch.diff)?;
        let import = self.hg(&["import", "--no-commit", &diff_file.to_string_lossy()]);
        let outcome = match import {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(self.classify_import_failure(&output)),
            Err(err) => Err(err),
        };
        let _ = fs::remove_file(&diff_file);
        outcome?;

        let user = format!("{} <{}>", patch.author_name, patch.author_email);
        let date = format!("{} 0", patch.timestamp);
        self.hg_ok(&[
            "commit",
            "-m",
            &patch.commit_message,
            "-u",
            &user,
            "-d",
            &date,
        ])?;
        Ok(())
    }

    fn classify_import_failure(&self, output: &CommandOutput) -> WorktreeError {
        let combined = output.combined();

        let reject_paths = extract_reject_paths(&combined);
        if !reject_paths.is_empty() {
            let rejects = reject_paths
                .into_iter()
                .map(|path| {
                    let content = fs::read_to_string(self.tree.path.join(&path)).ok();
                    RejectedFile { path, content }
                })
                .collect();
            return WorktreeError::PatchConflict { rejects };
        }

        let lowered = combined.to_lowercase();
        if lowered.contains("malformed patch")
            || lowered.contains("bad hunk")
            || lowered.contains("unexpected hunk")
        {
            return WorktreeError::MalformedPatch(combined);
        }

        WorktreeError::Command("hg import".to_string(), combined)
    }

    /// Run the configured autoformatter over the applied stack. Returns
    /// the changeset hashes it rewrote, empty when nothing changed.
    pub fn format_stack(
        &self,
        count: usize,
        bug_ids: &[String],
        command: &[String],
    ) -> Result<Vec<HashReplacement>, WorktreeError> {
        if command.is_empty() {
            return Ok(Vec::new());
        }

        let before = self.draft_hashes()?;

        let program = &command[0];
        let args: Vec<&str> = command[1..].iter().map(String::as_str).collect();
        let bug_ids = bug_ids.join(",");
        let count = count.to_string();
        let output = process::run_with_timeout(
            program,
            &args,
            &self.tree.path,
            &[
                (REQUEST_USER_ENV, self.requester.as_str()),
                ("CONVEYOR_FORMAT_COUNT", count.as_str()),
                ("CONVEYOR_BUG_IDS", bug_ids.as_str()),
            ],
            self.tree.timeout,
        )
        .map_err(|err| WorktreeError::Autoformat {
            stderr: format!("{err:#}"),
        })?;
        if !output.success() {
            return Err(WorktreeError::Autoformat {
                stderr: output.stderr,
            });
        }

        let after = self.draft_hashes()?;
        if before == after {
            return Ok(Vec::new());
        }
        Ok(before
            .into_iter()
            .zip(after)
            .filter(|(old, new)| old != new)
            .map(|(old, new)| HashReplacement { old, new })
            .collect())
    }

    fn draft_hashes(&self) -> Result<Vec<String>, WorktreeError> {
        let output = self.hg_ok(&["log", "-r", "not public()", "-T", "{node}\n"])?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// First lines of the draft changesets about to be pushed.
    pub fn stack_titles(&self) -> Result<Vec<String>, WorktreeError> {
        let output = self.hg_ok(&["log", "-r", "not public()", "-T", "{desc|firstline}\n"])?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Hash of the current checkout parent (the tip after applying).
    pub fn tip_hash(&self) -> Result<String, WorktreeError> {
        let output = self.hg_ok(&["log", "-r", ".", "-T", "{node}"])?;
        Ok(output.stdout.trim().to_string())
    }

    /// The most recent commit touching `path` on the current branch.
    pub fn last_commit_touching(&self, path: &str) -> Result<String, WorktreeError> {
        let output = self.hg_ok(&["log", "--template", "{node}", "-l", "1", path])?;
        Ok(output.stdout.trim().to_string())
    }

    /// Push the applied stack to `push_path`.
    pub fn push(
        &self,
        push_path: &str,
        bookmark: Option<&str>,
        force: bool,
    ) -> Result<(), WorktreeError> {
        let result = match bookmark {
            Some(bookmark) => {
                self.hg_ok(&["bookmark", bookmark])?;
                let mut args = vec!["push", "-B", bookmark, push_path];
                if force {
                    args.insert(1, "-f");
                }
                self.hg(&args)
            }
            None => {
                let mut args = vec!["push", "-r", "tip", push_path];
                if force {
                    args.insert(1, "-f");
                }
                self.hg(&args)
            }
        }?;

        if result.success() {
            return Ok(());
        }
        Err(classify_push_failure(&result.combined()))
    }

    /// Read a tracked file from the current checkout.
    pub fn read_checkout_file(&self, path: &str) -> Result<String, WorktreeError> {
        let output = self.hg_ok(&["cat", "-r", ".", path])?;
        Ok(output.stdout)
    }

    fn write_temp_diff(&self, diff: &[u8]) -> Result<PathBuf, WorktreeError> {
        let counter = PATCH_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = env::temp_dir().join(format!(
            "conveyor-{}-{counter}.diff",
            std::process::id()
        ));
        fs::write(&path, diff).map_err(|err| {
            WorktreeError::Command("write patch file".to_string(), err.to_string())
        })?;
        Ok(path)
    }
}

/// Map push output to the structured error the worker branches on.
fn classify_push_failure(output: &str) -> WorktreeError {
    let lowered = output.to_lowercase();
    if lowered.contains("is closed!") || lowered.contains("tree is closed") {
        WorktreeError::TreeClosed(output.to_string())
    } else if lowered.contains("approval required") {
        WorktreeError::TreeApprovalRequired(output.to_string())
    } else if lowered.contains("push creates new remote head") || lowered.contains("push race") {
        WorktreeError::LostPushRace(output.to_string())
    } else {
        WorktreeError::PushError(output.to_string())
    }
}

/// Collect reject-file paths out of import output lines such as
/// `1 out of 2 hunks FAILED -- saving rejects to file path/to/file.c.rej`.
fn extract_reject_paths(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in output.lines() {
        if let Some(index) = line.find("saving rejects to file ") {
            let path = line[index + "saving rejects to file ".len()..].trim();
            if !path.is_empty() {
                paths.push(path.to_string());
            }
        }
    }
    paths
}
