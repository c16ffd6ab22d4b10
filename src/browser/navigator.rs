//! Navigation with bounded retry and readiness gating.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{DriverError, EngineError};
use crate::pacing::{BackoffScheduler, Sleeper};

use super::PageDriver;

/// A fetched page: final URL plus serialized HTML. Plain data, safe to hold
/// across await points.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
}

/// Navigation configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NavigationConfig {
    /// Page load timeout in seconds.
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    /// Separate timeout for the page-defining marker element.
    #[serde(default = "default_marker_timeout_secs")]
    pub marker_timeout_secs: u64,
    /// Navigation attempts per fetch before the failure surfaces.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_page_timeout_secs() -> u64 {
    60
}

fn default_marker_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            page_timeout_secs: default_page_timeout_secs(),
            marker_timeout_secs: default_marker_timeout_secs(),
            attempts: default_attempts(),
        }
    }
}

/// Owns the one browser session of a crawl run and performs "go to URL, wait
/// until the page is in its expected shape" with bounded retry.
///
/// Timeout-class navigation failures are retried internally up to the
/// configured bound; exhaustion surfaces as a transient error to the caller.
/// A page that loads but never shows its marker element is a distinct
/// failure: the navigation worked, the page is just not in the expected
/// shape (blocked, redirected, or structurally different).
pub struct Navigator {
    driver: Box<dyn PageDriver>,
    scheduler: BackoffScheduler,
    sleeper: Arc<dyn Sleeper>,
    page_timeout: Duration,
    marker_timeout: Duration,
    attempts: u32,
    current: Option<String>,
}

impl Navigator {
    pub fn new(
        driver: Box<dyn PageDriver>,
        config: &NavigationConfig,
        scheduler: BackoffScheduler,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            driver,
            scheduler,
            sleeper,
            page_timeout: Duration::from_secs(config.page_timeout_secs),
            marker_timeout: Duration::from_secs(config.marker_timeout_secs),
            attempts: config.attempts.max(1),
            current: None,
        }
    }

    /// Navigate to `url`, then block until `marker` is present. Returns the
    /// page snapshot once both succeeded.
    pub async fn fetch(&mut self, url: &str, marker: &str) -> Result<PageSnapshot, EngineError> {
        self.navigate_with_retry(url).await?;
        self.current = Some(url.to_string());
        self.await_marker(marker).await?;
        self.snapshot().await
    }

    /// Re-fetch whatever URL was last navigated to (recovery after identity
    /// rotation).
    pub async fn refresh(&mut self, marker: &str) -> Result<PageSnapshot, EngineError> {
        let url = self.current.clone().ok_or_else(|| {
            EngineError::Driver(DriverError::Protocol("no page to refresh".into()))
        })?;
        self.fetch(&url, marker).await
    }

    /// Content and URL of whatever the page currently shows, marker or not.
    /// Used to inspect pages that failed the readiness precondition.
    pub async fn snapshot(&self) -> Result<PageSnapshot, EngineError> {
        let html = self.driver.content().await?;
        let url = self.driver.current_url().await?;
        Ok(PageSnapshot { url, html })
    }

    /// Block until `marker` is present, up to the marker timeout.
    pub async fn await_marker(&self, marker: &str) -> Result<(), EngineError> {
        match self
            .driver
            .wait_for_selector(marker, self.marker_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(DriverError::Timeout { .. }) => Err(EngineError::PreconditionFailed {
                url: self.current.clone().unwrap_or_default(),
                marker: marker.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn execute_script(&self, script: &str) -> Result<serde_json::Value, EngineError> {
        Ok(self.driver.execute_script(script).await?)
    }

    pub async fn delete_cookies(&self) -> Result<(), EngineError> {
        Ok(self.driver.delete_cookies().await?)
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Release the session. Called on every run exit path.
    pub async fn close(&self) {
        self.driver.close().await;
    }

    async fn navigate_with_retry(&mut self, url: &str) -> Result<(), EngineError> {
        for attempt in 1..=self.attempts {
            match self.driver.navigate(url, self.page_timeout).await {
                Ok(()) => {
                    debug!("navigated to {} (attempt {})", url, attempt);
                    return Ok(());
                }
                Err(DriverError::Timeout { .. }) if attempt < self.attempts => {
                    warn!(
                        "navigation to {} timed out (attempt {}/{}), retrying",
                        url, attempt, self.attempts
                    );
                    self.sleeper.sleep(self.scheduler.retry_delay(attempt)).await;
                }
                Err(DriverError::Timeout { .. }) => {
                    return Err(EngineError::NavigationTimeout {
                        url: url.to_string(),
                        attempts: self.attempts,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("attempt loop always returns")
    }
}
