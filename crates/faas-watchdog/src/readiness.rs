use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::lifecycle::Lifecycle;
use crate::{Result, WatchdogError};

/// Health response header naming the watchdog instance that answered.
pub const INSTANCE_HEADER: &str = "x-watchdog-instance";

const PROBE_INTERVAL: Duration = Duration::from_millis(20);
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// File whose presence tells the orchestrator the watchdog takes traffic.
#[derive(Debug, Clone)]
pub struct ReadinessMarker {
    path: PathBuf,
}

impl ReadinessMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    async fn write(&self) -> Result<()> {
        tokio::fs::write(&self.path, b"")
            .await
            .map_err(|source| WatchdogError::LockFile {
                path: self.path.clone(),
                source,
            })
    }
}

/// Wait until the listener at `addr` has answered a request carrying
/// `instance` in its [`INSTANCE_HEADER`], then move the lifecycle to Ready
/// and write the marker.
///
/// The probe connects directly; proxy settings from the environment are
/// ignored. A failed marker write is returned to the caller, which treats it
/// as fatal.
pub async fn signal_when_live(
    addr: SocketAddr,
    instance: String,
    lifecycle: Lifecycle,
    marker: Option<ReadinessMarker>,
) -> Result<()> {
    let url = format!("http://{}/_/health", probe_addr(addr));
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(1))
        .build()
        .map_err(|e| WatchdogError::Readiness(e.to_string()))?;

    let probe = async {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            ticker.tick().await;
            // Any status will do, as long as this watchdog sent it.
            match client.get(&url).send().await {
                Ok(response) if answered_by(&response, &instance) => {
                    debug!(status = %response.status(), "Listener answered readiness probe");
                    return;
                }
                Ok(response) => {
                    warn!(status = %response.status(), %url, "Readiness probe answered by another server");
                }
                Err(e) => debug!(error = %e, "Listener not answering yet"),
            }
        }
    };
    tokio::time::timeout(PROBE_DEADLINE, probe)
        .await
        .map_err(|_| {
            WatchdogError::Readiness(format!("listener on {addr} never answered {url}"))
        })?;

    if !lifecycle.mark_ready() {
        return Ok(());
    }
    match marker {
        Some(marker) => {
            marker.write().await?;
            info!(path = %marker.path().display(), "Readiness marker written");
        }
        None => info!("Readiness marker suppressed"),
    }
    Ok(())
}

fn answered_by(response: &reqwest::Response, instance: &str) -> bool {
    response
        .headers()
        .get(INSTANCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == instance)
}

fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
