//! Lock files coordinating store access between processes.
//!
//! The job store uses two kinds of locks: one queue-wide lock serialising
//! submissions and claim scans, and one lock per job held by the worker
//! that is processing it. A lock file contains JSON metadata about its
//! holder (PID, hostname, timestamp) so a stuck lock can be diagnosed and
//! stale ones reclaimed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information stored in a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// A held lock file. Released on [`LockFile::release`] or on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Acquire the lock at `path`, failing if it is already held.
    ///
    /// Creation uses `create_new` so two processes racing for the same
    /// lock cannot both succeed.
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::try_acquire(path)? {
            Some(lock) => Ok(lock),
            None => {
                let info = read_lock_info(path)?;
                bail!(
                    "lock {} already held by pid {} on {} since {}",
                    path.display(),
                    info.pid,
                    info.hostname,
                    info.acquired_at
                );
            }
        }
    }

    /// Acquire the lock, returning `None` if it is currently held.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        let mut file = match fs::File::options().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create lock file {}", path.display()));
            }
        };

        let json = serde_json::to_string_pretty(&LockInfo::current())
            .context("failed to serialize lock info")?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        file.sync_all().ok();

        Ok(Some(Self {
            path: path.to_path_buf(),
            released: false,
        }))
    }

    /// Acquire the lock, removing it first if the holder looks stale
    /// (older than `timeout`, or the lock file is unreadable).
    pub fn acquire_with_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        if path.exists() {
            match read_lock_info(path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(path).with_context(|| {
                            format!("failed to remove stale lock file {}", path.display())
                        })?;
                    }
                }
                Err(_) => {
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove corrupt lock file {}", path.display())
                    })?;
                }
            }
        }

        Self::acquire(path)
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.released {
            if self.path.exists() {
                fs::remove_file(&self.path).with_context(|| {
                    format!("failed to remove lock file {}", self.path.display())
                })?;
            }
            self.released = true;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Best effort; a leftover lock is reclaimed via the stale timeout.
        let _ = self.release();
    }
}

pub fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}
