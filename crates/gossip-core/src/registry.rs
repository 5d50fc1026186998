//! Peer list registry owned by a seed.
//!
//! Maps every registered [`PeerAddress`] to the time it last registered.
//! Thread-safe for the multi-threaded Tokio runtime: wrap in `Arc` and share
//! it between all registration and dead-report handlers of one seed.

use crate::address::PeerAddress;
use std::collections::HashMap;
use std::sync::RwLock;

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Address was not known before
    Added,
    /// Address was already present; only its timestamp changed
    Refreshed,
}

/// Registry of peers known to one seed.
#[derive(Default)]
pub struct PeerListRegistry {
    /// Address → last registration time (ms since epoch)
    peers: RwLock<HashMap<PeerAddress, u64>>,
}

impl PeerListRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address. Idempotent: a repeat registration refreshes the
    /// timestamp but never duplicates the entry.
    pub fn register(&self, addr: PeerAddress, timestamp: u64) -> Registration {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.insert(addr, timestamp) {
            Some(_) => Registration::Refreshed,
            None => Registration::Added,
        }
    }

    /// Remove an address. Returns whether it was present.
    pub fn remove(&self, addr: &PeerAddress) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr)
            .is_some()
    }

    /// Point-in-time copy of the membership, sorted for a stable wire order.
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(addr)
    }

    #[cfg(test)]
    fn registered_at(&self, addr: &PeerAddress) -> Option<u64> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
