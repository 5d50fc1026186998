//! gossip-node library: tokio/WebSocket runtime for seeds and peers.
//!
//! Exposes the node components so the binary, the launcher and the
//! integration tests share one implementation.

pub mod config;
pub mod connection;
pub mod launcher;
pub mod logging;
pub mod peer;
pub mod probe;
pub mod seed;
pub mod seed_client;

// Re-export key types for convenience
pub use config::{NodeConfig, ProbeKind};
pub use connection::{dial, Connection, ConnectionEvent, LineOutbound, MAX_LINE_SIZE};
pub use launcher::{Cluster, LaunchPlan};
pub use logging::{FileSink, NodeLog};
pub use peer::PeerNode;
pub use probe::{build_prober, PingProber, TcpProber};
pub use seed::{SeedCoordinator, SeedServer};
pub use seed_client::WsSeedDirectory;
