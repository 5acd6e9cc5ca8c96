//! Best-effort user notifications.
//!
//! Landing failures and post-landing bug-update failures are posted to a
//! configured webhook. Notification delivery must never affect a job's
//! outcome; callers report a failed send and move on.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::types::LandingJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Optional shared secret; when set, requests carry an HMAC-SHA256
    /// signature of the body.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Sends webhook notifications, or does nothing when unconfigured.
#[derive(Debug, Default)]
pub struct Notifier {
    config: Option<WebhookConfig>,
}

impl Notifier {
    pub fn new(config: Option<WebhookConfig>) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self { config: None }
    }

    pub fn notify_landing_failure(&self, job: &LandingJob) -> Result<()> {
        self.send(json!({
            "kind": "landing-failure",
            "job_id": job.id,
            "requester_email": job.requester_email,
            "revision": job.head_revision().map(|r| r.to_string()),
            "error": job.error,
        }))
    }

    pub fn notify_bug_update_failure(&self, job: &LandingJob, message: &str) -> Result<()> {
        self.send(json!({
            "kind": "bug-update-failure",
            "job_id": job.id,
            "requester_email": job.requester_email,
            "revision": job.head_revision().map(|r| r.to_string()),
            "error": message,
        }))
    }

    fn send(&self, payload: serde_json::Value) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };

        let body = payload.to_string();
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to create webhook HTTP client")?;

        let mut request = client
            .post(&config.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &config.secret {
            request = request.header("X-Conveyor-Signature", sign(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .context("failed to send webhook request")?;
        if !response.status().is_success() {
            bail!("webhook request failed with status {}", response.status());
        }
        Ok(())
    }
}

fn sign(secret: &str, body: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialise webhook HMAC")?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
