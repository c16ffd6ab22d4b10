//! chromiumoxide-backed driver.
//!
//! Launches (or connects to) a Chromium instance with all traffic routed
//! through the SOCKS proxy, DNS included.

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::error::{DriverError, EngineError};

use super::{BrowserSessionConfig, PageDriver};

/// How often the marker wait re-probes the page.
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One live Chromium session driven over CDP.
pub struct CdpDriver {
    browser: Mutex<Option<Browser>>,
    page: Page,
}

impl CdpDriver {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        // Common install locations
        "/opt/google/chrome/google-chrome",
    ];

    /// Launch a browser session with all traffic (DNS included) routed
    /// through the given SOCKS endpoint, or connect to a remote one.
    pub async fn launch(
        config: &BrowserSessionConfig,
        socks_host: &str,
        socks_port: u16,
    ) -> Result<Self, EngineError> {
        if let Some(ref remote_url) = config.remote_url {
            return Self::connect_remote(remote_url).await;
        }

        let chrome_path = Self::find_chrome()
            .ok_or_else(|| EngineError::SessionUnavailable("Chrome/Chromium not found".into()))?;
        info!(
            "launching browser (headless={}) via socks5://{}:{}",
            config.headless, socks_host, socks_port
        );

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !config.headless {
            builder = builder.with_head();
        }

        // MAP-everything resolver rules keep hostname resolution inside the
        // proxy; nothing may leak to local DNS.
        builder = builder
            .arg(format!("--proxy-server=socks5://{socks_host}:{socks_port}"))
            .arg(format!(
                "--host-resolver-rules=MAP * ~NOTFOUND , EXCLUDE {socks_host}"
            ))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--metrics-recording-only")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        for arg in &config.chrome_args {
            builder = builder.arg(arg);
        }

        let browser_config = builder
            .build()
            .map_err(|e| EngineError::SessionUnavailable(format!("bad browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("launch failed: {e}")))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("no page: {e}")))?;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
        })
    }

    /// Connect to an already-running Chrome via its DevTools endpoint.
    async fn connect_remote(url: &str) -> Result<Self, EngineError> {
        info!("connecting to remote browser at {}", url);

        let http_url = url.replace("ws://", "http://").replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("remote browser: {e}")))?
            .json()
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("version info: {e}")))?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::SessionUnavailable("no webSocketDebuggerUrl in response".into())
            })?;

        let handler_config = HandlerConfig {
            request_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("connect failed: {e}")))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::SessionUnavailable(format!("no page: {e}")))?;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
        })
    }

    fn find_chrome() -> Option<PathBuf> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                debug!("found Chrome at {}", path);
                return Some(p.to_path_buf());
            }
        }

        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        debug!("found Chrome in PATH: {}", path);
                        return Some(PathBuf::from(path));
                    }
                }
            }
        }

        None
    }
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| DriverError::Protocol(format!("invalid URL {url}: {e}")))?;

        tokio::time::timeout(timeout, self.page.execute(params))
            .await
            .map_err(|_| DriverError::Timeout {
                what: format!("navigation to {url}"),
                timeout,
            })?
            .map_err(|e| DriverError::Protocol(format!("navigation to {url} failed: {e}")))?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("element '{selector}'"),
                    timeout,
                });
            }
            tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.page
            .content()
            .await
            .map_err(|e| DriverError::Protocol(format!("content: {e}")))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|e| DriverError::Protocol(format!("url: {e}")))?
            .map(|u| u.to_string())
            .unwrap_or_default())
    }

    async fn execute_script(&self, script: &str) -> Result<serde_json::Value, DriverError> {
        let result = self
            .page
            .evaluate(script.to_string())
            .await
            .map_err(|e| DriverError::Protocol(format!("script: {e}")))?;
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn delete_cookies(&self) -> Result<(), DriverError> {
        self.page
            .execute(ClearBrowserCookiesParams::default())
            .await
            .map_err(|e| DriverError::Protocol(format!("clear cookies: {e}")))?;
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            info!("closing browser session");
            let _ = browser.close().await;
            let _ = browser.wait().await;
        }
    }
}
