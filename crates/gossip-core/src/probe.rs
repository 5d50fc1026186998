//! Liveness probe capability.
//!
//! The state machine in [`crate::liveness`] only consumes a boolean per probe.
//! How reachability is checked (TCP connect, ICMP via `ping`, …) is supplied
//! by an implementation of [`Prober`].

use crate::address::PeerAddress;
use async_trait::async_trait;
use std::time::Duration;

/// Reachability check against a peer.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `target`, answering within `timeout`. Implementations must treat
    /// a missing answer as `false` rather than waiting indefinitely.
    async fn probe(&self, target: &PeerAddress, timeout: Duration) -> bool;
}

#[async_trait]
impl<P: Prober + ?Sized> Prober for std::sync::Arc<P> {
    async fn probe(&self, target: &PeerAddress, timeout: Duration) -> bool {
        (**self).probe(target, timeout).await
    }
}
