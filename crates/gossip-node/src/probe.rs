//! Reachability probes used by peer liveness monitors.

use crate::config::ProbeKind;
use async_trait::async_trait;
use gossip_core::{PeerAddress, Prober};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Probes a peer by opening (and immediately dropping) a TCP connection to
/// its listening port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &PeerAddress, limit: Duration) -> bool {
        match timeout(limit, TcpStream::connect((target.host(), target.port()))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("TCP probe to {} failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("TCP probe to {} timed out", target);
                false
            }
        }
    }
}

/// Probes a peer's host with one ICMP echo via the system `ping` utility.
///
/// Only the host is checked; a stopped process on a live host still answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: &PeerAddress, limit: Duration) -> bool {
        let wait_secs = limit.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", wait_secs.as_str(), target.host()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match timeout(limit + Duration::from_millis(500), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("Failed to run ping for {}: {}", target, e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Build the prober selected in configuration.
pub fn build_prober(kind: ProbeKind) -> Arc<dyn Prober> {
    match kind {
        ProbeKind::Tcp => Arc::new(TcpProber),
        ProbeKind::Ping => Arc::new(PingProber),
    }
}
