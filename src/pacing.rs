//! Retry and pacing delay policy.
//!
//! Two kinds of delay: short escalating waits between retries of a failed
//! action, and jittered human-like pauses between successful actions so the
//! request cadence never shows a fixed interval. All actual sleeping goes
//! through the [`Sleeper`] trait so the policy is testable without real time
//! passing.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay configuration. All values in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Base delay before the first retry; attempt N waits N times this.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Lower bound of the pause between successful items/pages.
    #[serde(default = "default_pace_min_ms")]
    pub pace_min_ms: u64,
    /// Upper bound of the pause between successful items/pages.
    #[serde(default = "default_pace_max_ms")]
    pub pace_max_ms: u64,
    /// Settle time after identity rotation and initial page load.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_retry_base_ms() -> u64 {
    5_000
}

fn default_pace_min_ms() -> u64 {
    3_000
}

fn default_pace_max_ms() -> u64 {
    7_000
}

fn default_settle_ms() -> u64 {
    5_000
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: default_retry_base_ms(),
            pace_min_ms: default_pace_min_ms(),
            pace_max_ms: default_pace_max_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Computes retry and pacing delays. Pure; holds no shared state.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    config: PacingConfig,
}

impl BackoffScheduler {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    /// Delay before retry `attempt` (1-based). Escalates linearly over the
    /// bounded attempt count.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.retry_base_ms * u64::from(attempt.max(1)))
    }

    /// Jittered pause between successful items/pages, drawn uniformly from
    /// the configured range.
    pub fn pace_delay(&self) -> Duration {
        let lo = self.config.pace_min_ms.min(self.config.pace_max_ms);
        let hi = self.config.pace_min_ms.max(self.config.pace_max_ms);
        if hi == lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    /// Fixed settle time after identity rotation or initial load.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.config.settle_ms)
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(PacingConfig::default())
    }
}

/// Sleep capability, injected so delay policy is testable without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by tokio's timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately. For tests.
pub struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}
