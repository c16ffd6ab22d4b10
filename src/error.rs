//! Typed error taxonomy for the crawl engine.
//!
//! Every failure the engine can surface is one of three kinds: transient
//! (retried or tolerated locally), blocking (recovered by rotating the
//! network identity), or fatal (the run stops). The controller dispatches
//! on [`EngineError::kind`] rather than matching individual variants.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors from the page automation surface.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver gave up waiting for a navigation or an element.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// The automation protocol reported a failure.
    #[error("automation protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by the crawl engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Navigation kept timing out; the per-fetch retry budget is exhausted.
    #[error("navigation to {url} timed out after {attempts} attempts")]
    NavigationTimeout { url: String, attempts: u32 },

    /// The page loaded but its defining marker element never appeared.
    #[error("page {url} loaded without marker '{marker}'")]
    PreconditionFailed { url: String, marker: String },

    /// The session looks blocked or challenged.
    #[error("block detected on {url}")]
    Blocked { url: String },

    /// The automation surface failed mid-run.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The browser session could not be acquired at all.
    #[error("browser session could not be started: {0}")]
    SessionUnavailable(String),

    /// The SOCKS proxy did not answer at startup.
    #[error("proxy {endpoint} unreachable: {source}")]
    ProxyUnreachable { endpoint: String, source: io::Error },

    /// The checkpoint log or final artifact could not be written.
    #[error("checkpoint storage error: {0}")]
    Storage(#[from] io::Error),
}

/// Coarse classification driving the controller's recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried locally; never aborts the run on its own.
    Transient,
    /// Recovered by rotating the network identity.
    Blocking,
    /// The run stops with a non-zero outcome.
    Fatal,
}

impl EngineError {
    /// Classify this error for the controller's recovery policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NavigationTimeout { .. }
            | Self::PreconditionFailed { .. }
            | Self::Driver(_) => ErrorKind::Transient,
            Self::Blocked { .. } => ErrorKind::Blocking,
            Self::SessionUnavailable(_)
            | Self::ProxyUnreachable { .. }
            | Self::Storage(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_blocking(&self) -> bool {
        self.kind() == ErrorKind::Blocking
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_timeout_is_transient() {
        let err = EngineError::NavigationTimeout {
            url: "http://example.onion".into(),
            attempts: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn precondition_is_transient_and_distinct_from_timeout() {
        let err = EngineError::PreconditionFailed {
            url: "http://example.onion".into(),
            marker: ".product-item".into(),
        };
        assert!(err.is_transient());
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[test]
    fn blocked_is_blocking() {
        let err = EngineError::Blocked {
            url: "http://example.onion".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Blocking);
    }

    #[test]
    fn storage_and_proxy_failures_are_fatal() {
        let storage = EngineError::Storage(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert!(storage.is_fatal());

        let proxy = EngineError::ProxyUnreachable {
            endpoint: "127.0.0.1:9050".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(proxy.is_fatal());
    }

    #[test]
    fn driver_errors_are_transient() {
        let err: EngineError = DriverError::Protocol("tab crashed".into()).into();
        assert!(err.is_transient());
    }
}
