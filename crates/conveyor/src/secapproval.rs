//! Sec-approval requests for secure revisions.
//!
//! Secure revisions land with a sanitised commit message agreed through
//! the security approval process. The core's contract with that process
//! is narrow: record which comment transactions may carry the sanitised
//! message, and look up the approved replacement when building the landed
//! commit message.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::RevisionId;

/// The sanitised replacement for a secure revision's commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedMessage {
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecApprovalRequest {
    pub revision_id: RevisionId,
    /// Transaction identifiers that may carry the sanitised message.
    pub comment_candidates: Vec<String>,
    #[serde(default)]
    pub sanitized: Option<SanitizedMessage>,
}

/// Persistence of sec-approval requests. The only write from the landing
/// core is `create_request`.
pub trait SecApprovalStore {
    fn create_request(&self, request: &SecApprovalRequest) -> Result<()>;
    fn sanitized_message(&self, revision: RevisionId) -> Result<Option<SanitizedMessage>>;
}

/// File-backed store, one JSON document per revision.
#[derive(Debug)]
pub struct FsSecApprovalStore {
    root: PathBuf,
}

impl FsSecApprovalStore {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create sec-approval dir {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, revision: RevisionId) -> PathBuf {
        self.root.join(format!("{revision}.json"))
    }
}

impl SecApprovalStore for FsSecApprovalStore {
    fn create_request(&self, request: &SecApprovalRequest) -> Result<()> {
        let path = self.path_for(request.revision_id);
        let data = serde_json::to_vec_pretty(request)
            .context("failed to serialize sec-approval request")?;
        fs::write(&path, data)
            .with_context(|| format!("failed to write sec-approval file {}", path.display()))
    }

    fn sanitized_message(&self, revision: RevisionId) -> Result<Option<SanitizedMessage>> {
        let path = self.path_for(revision);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read sec-approval file {}", path.display()))?;
        let request: SecApprovalRequest = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse sec-approval JSON {}", path.display()))?;
        Ok(request.sanitized)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_request_means_no_sanitized_message() {
        let td = tempdir().expect("tempdir");
        let store = FsSecApprovalStore::new(td.path()).expect("store");
        assert_eq!(store.sanitized_message(RevisionId(1)).expect("lookup"), None);
    }

    #[test]
    fn sanitized_message_roundtrips() {
        let td = tempdir().expect("tempdir");
        let store = FsSecApprovalStore::new(td.path()).expect("store");
        store
            .create_request(&SecApprovalRequest {
                revision_id: RevisionId(7),
                comment_candidates: vec!["PHID-XACT-1".to_string()],
                sanitized: Some(SanitizedMessage {
                    title: "Fix a crash".to_string(),
                    summary: String::new(),
                }),
            })
            .expect("create");

        let message = store
            .sanitized_message(RevisionId(7))
            .expect("lookup")
            .expect("present");
        assert_eq!(message.title, "Fix a crash");
    }

    #[test]
    fn request_without_approval_yields_none() {
        let td = tempdir().expect("tempdir");
        let store = FsSecApprovalStore::new(td.path()).expect("store");
        store
            .create_request(&SecApprovalRequest {
                revision_id: RevisionId(8),
                comment_candidates: vec![],
                sanitized: None,
            })
            .expect("create");
        assert_eq!(store.sanitized_message(RevisionId(8)).expect("lookup"), None);
    }
}
