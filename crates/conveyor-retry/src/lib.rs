//! Retry strategies for conveyor's flaky collaborators.
//!
//! External systems (the bug tracker, webhooks, the review service) fail
//! transiently; this crate provides the delay calculation those call sites
//! share, plus a small driver for bounded retry loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for calculating the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay increases linearly each attempt.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Cap applied after the backoff calculation.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 0.5 = delay * 0.5..1.5).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.5,
        }
    }
}

impl RetryStrategyConfig {
    /// Linear backoff without jitter, as used by post-landing bug updates:
    /// `base_delay * attempt` for a fixed number of attempts.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategyType::Linear,
            max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(max_attempts.max(1)),
            jitter: 0.0,
        }
    }
}

/// Calculate the delay before the next attempt. `attempt` is 1-based.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay. A factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter = jitter.clamp(0.0, 1.0);
    let factor: f64 = 1.0 + rand::rng().random_range(-jitter..=jitter);
    delay.mul_f64(factor.max(0.0))
}

/// Run `op` until it succeeds or attempts are exhausted, sleeping the
/// strategy's delay between attempts. The final error is returned as-is.
pub fn retry_with<T, E, F>(config: &RetryStrategyConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => std::thread::sleep(calculate_delay(config, attempt)),
        }
    }
}
