//! In-process launcher: a whole network of seeds and peers in one process.
//!
//! Seeds bind consecutive ports starting at `seed_port`, peers consecutive
//! ports starting at `peer_port`. Every peer's seed list is replaced by the
//! launched seeds. Optionally the first peer is disconnected after a delay to
//! exercise dead-node detection.

use crate::config::NodeConfig;
use crate::peer::PeerNode;
use crate::seed::SeedServer;
use anyhow::{Context, Result};
use gossip_core::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub host: String,
    pub seeds: usize,
    pub peers: usize,
    /// First seed port; 0 lets the OS pick every port
    pub seed_port: u16,
    /// First peer port; 0 lets the OS pick every port
    pub peer_port: u16,
    /// Pause between starting consecutive peers
    pub peer_stagger: Duration,
    /// Disconnect the first peer this long after the last one started
    pub disconnect_after: Option<Duration>,
}

impl Default for LaunchPlan {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            seeds: 4,
            peers: 3,
            seed_port: 6000,
            peer_port: 8000,
            peer_stagger: Duration::from_secs(1),
            disconnect_after: None,
        }
    }
}

/// A launched network.
pub struct Cluster {
    seeds: Vec<SeedServer>,
    peers: Vec<Arc<PeerNode>>,
    disconnect: Option<JoinHandle<()>>,
}

impl Cluster {
    /// Start every seed, then every peer in turn.
    ///
    /// `config` supplies the timing and fan-out settings shared by all peers.
    pub async fn launch(plan: &LaunchPlan, config: &NodeConfig, bus: Arc<EventBus>) -> Result<Self> {
        let mut seeds = Vec::with_capacity(plan.seeds);
        for i in 0..plan.seeds {
            let listen = format!("{}:{}", plan.host, offset_port(plan.seed_port, i)?);
            info!("Starting seed node {} at {}", i + 1, listen);
            seeds.push(SeedServer::start(&listen, Arc::clone(&bus)).await?);
        }

        let mut config = config.clone();
        config.seeds = seeds.iter().map(|s| s.address().clone()).collect();

        let mut peers = Vec::with_capacity(plan.peers);
        for i in 0..plan.peers {
            if i > 0 {
                sleep(plan.peer_stagger).await;
            }
            let listen = format!("{}:{}", plan.host, offset_port(plan.peer_port, i)?);
            info!("Starting peer node {} at {}", i + 1, listen);
            let peer = PeerNode::start(config.clone(), &listen, Arc::clone(&bus))
                .await
                .with_context(|| format!("Failed to start peer {}", listen))?;
            peers.push(Arc::new(peer));
        }

        let disconnect = match (plan.disconnect_after, peers.first()) {
            (Some(delay), Some(victim)) => {
                let victim = Arc::clone(victim);
                Some(tokio::spawn(async move {
                    sleep(delay).await;
                    warn!("Simulating disconnect of peer {}", victim.address());
                    victim.simulate_disconnect();
                }))
            }
            _ => None,
        };

        Ok(Self {
            seeds,
            peers,
            disconnect,
        })
    }

    pub fn seeds(&self) -> &[SeedServer] {
        &self.seeds
    }

    pub fn peers(&self) -> &[Arc<PeerNode>] {
        &self.peers
    }

    /// Stop every peer gracefully, then every seed.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.disconnect.take() {
            task.abort();
        }
        for peer in &self.peers {
            peer.shutdown();
        }
        for seed in &mut self.seeds {
            seed.shutdown();
        }
    }
}

fn offset_port(base: u16, index: usize) -> Result<u16> {
    if base == 0 {
        return Ok(0);
    }
    u16::try_from(index)
        .ok()
        .and_then(|i| base.checked_add(i))
        .with_context(|| format!("Port {} + {} is out of range", base, index))
}
