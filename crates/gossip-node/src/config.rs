//! Node configuration loading and management.

use anyhow::{Context, Result};
use gossip_core::{LivenessConfig, MembershipConfig, PeerAddress, MESSAGES_PER_RUN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How liveness probes reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeKind {
    /// TCP connect to the peer's listening port
    Tcp,
    /// One ICMP echo via the system `ping` utility
    Ping,
}

/// Configuration shared by seeds and peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Static seed list, known to every peer at startup
    #[serde(default = "default_seeds")]
    pub seeds: Vec<PeerAddress>,

    /// Maximum peers to connect to after join (`null` = all known peers)
    #[serde(default = "default_fan_out")]
    pub fan_out: Option<usize>,

    /// Messages each peer originates
    #[serde(default = "default_message_count")]
    pub message_count: u32,

    /// Delay between joining and the first originated message
    #[serde(default = "default_gossip_start_delay_ms")]
    pub gossip_start_delay_ms: u64,

    /// Delay between consecutive originated messages
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures before a peer is declared dead
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Timeout for one seed RPC (registration or dead report). Also bounds the
    /// WebSocket upgrade of an inbound connection.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_probe")]
    pub probe: ProbeKind,

    /// Directory for per-node log files (none = console only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            seeds: default_seeds(),
            fan_out: default_fan_out(),
            message_count: default_message_count(),
            gossip_start_delay_ms: default_gossip_start_delay_ms(),
            gossip_interval_ms: default_gossip_interval_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            probe: default_probe(),
            log_dir: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            fan_out: self.fan_out,
        }
    }

    pub fn gossip_start_delay(&self) -> Duration {
        Duration::from_millis(self.gossip_start_delay_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn default_seeds() -> Vec<PeerAddress> {
    (6000..=6003)
        .filter_map(|port| PeerAddress::new("127.0.0.1", port).ok())
        .collect()
}

fn default_fan_out() -> Option<usize> {
    Some(4)
}

fn default_message_count() -> u32 {
    MESSAGES_PER_RUN
}

fn default_gossip_start_delay_ms() -> u64 {
    3000
}

fn default_gossip_interval_ms() -> u64 {
    5000
}

fn default_probe_interval_ms() -> u64 {
    13_000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_probe() -> ProbeKind {
    ProbeKind::Tcp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.seeds.len(), 4);
        assert_eq!(config.seeds[0].to_string(), "127.0.0.1:6000");
        assert_eq!(config.fan_out, Some(4));
        assert_eq!(config.message_count, 10);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.probe, ProbeKind::Tcp);
        assert_eq!(config.liveness().probe_interval, Duration::from_secs(13));
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.seeds, NodeConfig::default().seeds);
        assert_eq!(config.gossip_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "seeds": [{"host": "10.0.0.1", "port": 7000}],
            "fanOut": null,
            "probe": "ping",
            "probeIntervalMs": 100
        }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.seeds[0].host(), "10.0.0.1");
        assert_eq!(config.fan_out, None);
        assert_eq!(config.probe, ProbeKind::Ping);
        assert_eq!(config.liveness().probe_interval, Duration::from_millis(100));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_malformed_seed() {
        let json = r#"{"seeds": [{"host": "", "port": 7000}]}"#;
        assert!(serde_json::from_str::<NodeConfig>(json).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"messageCount": 3}"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.message_count, 3);

        let missing = NodeConfig::load(&dir.path().join("missing.json"));
        assert!(missing.is_err());
    }
}
