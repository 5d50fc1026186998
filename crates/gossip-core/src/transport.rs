//! Seed RPC transport abstraction.
//!
//! The membership client talks to seeds only through [`SeedDirectory`], so the
//! join/quorum logic is independent of the socket layer. The node crate
//! provides a WebSocket implementation; tests use in-memory fakes.

use crate::address::PeerAddress;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// RPCs a peer issues against seeds.
#[async_trait]
pub trait SeedDirectory: Send + Sync {
    /// Register `own` with `seed`; returns the seed's peer-list snapshot.
    async fn register(&self, seed: &PeerAddress, own: &PeerAddress) -> Result<Vec<PeerAddress>>;

    /// Tell `seed` that `dead` failed liveness probing, as observed by `reporter`.
    /// Best effort: `Ok` means the report was handed to the transport.
    async fn report_dead(
        &self,
        seed: &PeerAddress,
        dead: &PeerAddress,
        reporter: &PeerAddress,
    ) -> Result<()>;
}
