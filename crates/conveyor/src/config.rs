//! Runtime configuration variables.
//!
//! Operational toggles (pausing or stopping the worker, throttle and grace
//! windows) live in a JSON file next to the job store so operators and
//! other processes can flip them while a worker is running. Reads go
//! through a short-TTL memoised cache; writes go straight to disk and bust
//! the cache. An environment variable of the same name (prefixed with
//! `CONVEYOR_`) overrides the stored value, which is what tests and
//! one-off operator invocations use.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

pub const CONFIG_FILE: &str = "config.json";

/// Known runtime variables. Stored under their string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    /// When true the worker sleeps without claiming jobs.
    LandingWorkerPaused,
    /// When true the worker refuses to start, or exits its loop.
    LandingWorkerStopped,
    /// Minimum delay between worker iterations, in seconds.
    WorkerThrottleSeconds,
    /// Jobs younger than this many seconds are not claimed.
    DefaultGraceSeconds,
}

impl ConfigKey {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::LandingWorkerPaused => "LANDING_WORKER_PAUSED",
            ConfigKey::LandingWorkerStopped => "LANDING_WORKER_STOPPED",
            ConfigKey::WorkerThrottleSeconds => "WORKER_THROTTLE_SECONDS",
            ConfigKey::DefaultGraceSeconds => "DEFAULT_GRACE_SECONDS",
        }
    }

    fn env_name(self) -> String {
        format!("CONVEYOR_{}", self.name())
    }
}

#[derive(Debug)]
struct CachedValues {
    read_at: Instant,
    values: BTreeMap<String, Value>,
}

/// File-backed store of runtime variables with a short-TTL read cache.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<CachedValues>>,
}

impl ConfigStore {
    pub fn new(dir: &Path) -> Self {
        Self::with_ttl(dir, Duration::from_secs(3))
    }

    pub fn with_ttl(dir: &Path, ttl: Duration) -> Self {
        Self {
            path: dir.join(CONFIG_FILE),
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn get_bool(&self, key: ConfigKey, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "True" | "TRUE"),
            Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            _ => default,
        }
    }

    pub fn get_u64(&self, key: ConfigKey, default: u64) -> u64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get(&self, key: ConfigKey) -> Option<Value> {
        if let Ok(raw) = std::env::var(key.env_name()) {
            return Some(Value::String(raw));
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match cache.as_ref() {
            Some(cached) => cached.read_at.elapsed() > self.ttl,
            None => true,
        };
        if expired {
            *cache = Some(CachedValues {
                read_at: Instant::now(),
                values: self.read_values().unwrap_or_default(),
            });
        }
        cache
            .as_ref()
            .and_then(|cached| cached.values.get(key.name()).cloned())
    }

    /// Write `value` for `key` and bust the read cache.
    pub fn set(&self, key: ConfigKey, value: Value) -> Result<()> {
        let mut values = self.read_values().unwrap_or_default();
        values.insert(key.name().to_string(), value);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let data =
            serde_json::to_vec_pretty(&values).context("failed to serialize config JSON")?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)
            .with_context(|| format!("failed to write config tmp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename config file {}", self.path.display()))?;

        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn read_values(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config JSON {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempdir().expect("tempdir");
        let store = ConfigStore::new(td.path());
        assert!(!store.get_bool(ConfigKey::LandingWorkerPaused, false));
        assert_eq!(store.get_u64(ConfigKey::DefaultGraceSeconds, 120), 120);
    }

    #[test]
    fn set_then_get_roundtrips_and_busts_cache() {
        let td = tempdir().expect("tempdir");
        let store = ConfigStore::with_ttl(td.path(), Duration::from_secs(3600));

        assert!(!store.get_bool(ConfigKey::LandingWorkerPaused, false));
        store
            .set(ConfigKey::LandingWorkerPaused, Value::Bool(true))
            .expect("set");
        // Even with a long TTL the write must be visible immediately.
        assert!(store.get_bool(ConfigKey::LandingWorkerPaused, false));
    }

    #[test]
    fn stale_cache_is_refreshed_after_ttl() {
        let td = tempdir().expect("tempdir");
        let writer = ConfigStore::with_ttl(td.path(), Duration::ZERO);
        let reader = ConfigStore::with_ttl(td.path(), Duration::ZERO);

        assert_eq!(reader.get_u64(ConfigKey::WorkerThrottleSeconds, 3), 3);
        writer
            .set(ConfigKey::WorkerThrottleSeconds, Value::from(9))
            .expect("set");
        assert_eq!(reader.get_u64(ConfigKey::WorkerThrottleSeconds, 3), 9);
    }

    #[test]
    #[serial]
    fn environment_overrides_stored_value() {
        let td = tempdir().expect("tempdir");
        let store = ConfigStore::new(td.path());
        store
            .set(ConfigKey::LandingWorkerStopped, Value::Bool(false))
            .expect("set");

        temp_env::with_var("CONVEYOR_LANDING_WORKER_STOPPED", Some("true"), || {
            assert!(store.get_bool(ConfigKey::LandingWorkerStopped, false));
        });
        assert!(!store.get_bool(ConfigKey::LandingWorkerStopped, false));
    }

    #[test]
    fn string_values_coerce_to_numbers() {
        let td = tempdir().expect("tempdir");
        let store = ConfigStore::new(td.path());
        store
            .set(ConfigKey::DefaultGraceSeconds, Value::String("45".into()))
            .expect("set");
        assert_eq!(store.get_u64(ConfigKey::DefaultGraceSeconds, 120), 45);
    }
}
