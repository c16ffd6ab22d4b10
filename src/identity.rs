//! Anonymous network identity: SOCKS endpoint probing and circuit rotation.
//!
//! Rotation speaks the Tor control protocol directly: AUTHENTICATE, then
//! SIGNAL NEWNYM, then a fixed settle wait while the new circuit is built.
//! Session cookies are cleared afterwards so the new identity does not carry
//! the old session's state.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::browser::Navigator;
use crate::error::EngineError;
use crate::pacing::Sleeper;

/// How long the control-port conversation may take end to end.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Anonymizing proxy endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// SOCKS port all page traffic is routed through.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Control port used for identity rotation.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    9050
}

fn default_control_port() -> u16 {
    9051
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            socks_port: default_socks_port(),
            control_port: default_control_port(),
        }
    }
}

impl ProxyConfig {
    pub fn socks_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.socks_port)
    }

    pub fn control_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

/// Verify the SOCKS endpoint answers before any crawling starts. An
/// unreachable proxy is fatal; silently crawling without it would leak
/// traffic outside the anonymizing network.
pub async fn probe_proxy(proxy: &ProxyConfig, timeout: Duration) -> Result<(), EngineError> {
    let endpoint = proxy.socks_endpoint();
    match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(source)) => Err(EngineError::ProxyUnreachable { endpoint, source }),
        Err(_) => Err(EngineError::ProxyUnreachable {
            endpoint,
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Requests a fresh network circuit when the session has been blocked.
pub struct IdentityRotator {
    control_endpoint: String,
    settle: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl IdentityRotator {
    pub fn new(proxy: &ProxyConfig, settle: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            control_endpoint: proxy.control_endpoint(),
            settle,
            sleeper,
        }
    }

    /// Request a new identity and confirm it by waiting the settle time.
    /// Returns false (never an error) when the control port could not be
    /// reached or refused the request; the caller decides whether to abort.
    pub async fn rotate(&self, navigator: &Navigator) -> bool {
        match tokio::time::timeout(CONTROL_TIMEOUT, self.signal_newnym()).await {
            Ok(Ok(())) => {
                self.sleeper.sleep(self.settle).await;
                if let Err(e) = navigator.delete_cookies().await {
                    warn!("could not clear cookies after rotation: {}", e);
                }
                info!("new circuit established");
                true
            }
            Ok(Err(e)) => {
                warn!("identity rotation failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "identity rotation timed out talking to {}",
                    self.control_endpoint
                );
                false
            }
        }
    }

    async fn signal_newnym(&self) -> io::Result<()> {
        let mut stream = TcpStream::connect(&self.control_endpoint).await?;
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        send_command(&mut write_half, &mut reader, "AUTHENTICATE \"\"").await?;
        send_command(&mut write_half, &mut reader, "SIGNAL NEWNYM").await?;
        let _ = write_half.write_all(b"QUIT\r\n").await;
        Ok(())
    }
}

async fn send_command<W, R>(writer: &mut W, reader: &mut R, command: &str) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    R: AsyncBufReadExt + Unpin,
{
    writer
        .write_all(format!("{command}\r\n").as_bytes())
        .await?;
    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    if reply.starts_with("250") {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control port refused '{command}': {}", reply.trim()),
        ))
    }
}
