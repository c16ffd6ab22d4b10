//! Browser automation surface and the session-owning navigator.
//!
//! The engine talks to a generic [`PageDriver`] capability; the chromiumoxide
//! implementation lives behind the default-on `browser` feature so the
//! engine (and its tests) build without a browser toolchain.

mod navigator;

#[cfg(feature = "browser")]
mod cdp;

pub use navigator::{NavigationConfig, Navigator, PageSnapshot};

#[cfg(feature = "browser")]
pub use cdp::CdpDriver;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Browser session configuration. Plain data; available with or without the
/// `browser` feature so config files always parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserSessionConfig {
    /// Run in headless mode (default: true). Set to false for debugging.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Remote Chrome DevTools URL (e.g. "ws://localhost:9222"). If set,
    /// connects to an existing browser instead of launching one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,
}

fn default_headless() -> bool {
    true
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            remote_url: None,
            chrome_args: Vec::new(),
        }
    }
}

/// Generic browser-automation capability: navigate, wait for readiness,
/// read content, drive scripts, manage cookies. One implementor owns one
/// live browser session.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate the session's page to a URL, bounded by a timeout.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Block until an element matching the selector is present.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<(), DriverError>;

    /// Serialized HTML of the current page.
    async fn content(&self) -> Result<String, DriverError>;

    /// The page's current (post-redirect) URL.
    async fn current_url(&self) -> Result<String, DriverError>;

    /// Evaluate a script in the page; returns its JSON result.
    async fn execute_script(&self, script: &str) -> Result<serde_json::Value, DriverError>;

    /// Clear all cookies for the session.
    async fn delete_cookies(&self) -> Result<(), DriverError>;

    /// Release the underlying session. Idempotent.
    async fn close(&self);
}
