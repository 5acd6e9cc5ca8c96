//! Patch artefact storage.
//!
//! Patches built at submission time are uploaded to a blob store and
//! downloaded again by the worker. The backend is pluggable; the
//! filesystem backend is what single-host deployments and tests use.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::{DiffId, RevisionId};

/// Artefact name for one patch: `L{job_id}_D{revision_id}_{diff_id}.patch`.
pub fn patch_name(job_id: i64, revision_id: RevisionId, diff_id: DiffId) -> String {
    format!("L{job_id}_{revision_id}_{diff_id}.patch")
}

/// Storage for patch blobs, keyed by artefact name.
pub trait StorageBackend: Send + Sync {
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
    fn get(&self, name: &str) -> Result<Vec<u8>>;
    /// `<scheme>://<bucket>/<name>` form of an artefact's location.
    fn url(&self, name: &str) -> String;
    fn healthy(&self) -> Result<()>;
}

/// Blob storage on the local filesystem.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    bucket: String,
}

impl FsBackend {
    pub fn new(root: &Path, bucket: &str) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create blob dir {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            bucket: bucket.to_string(),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StorageBackend for FsBackend {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .with_context(|| format!("failed to write blob tmp file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename blob file {}", path.display()))?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path).with_context(|| format!("failed to read blob {}", path.display()))
    }

    fn url(&self, name: &str) -> String {
        format!("file://{}/{name}", self.bucket)
    }

    fn healthy(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            anyhow::bail!("blob root {} is not a directory", self.root.display())
        }
    }
}
