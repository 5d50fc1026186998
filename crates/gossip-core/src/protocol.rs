//! Control frames exchanged between nodes.
//!
//! Two encodings share one connection:
//! - **JSON**: control frames (registration, dead-node reports, hello)
//! - **Text line**: gossip messages (see [`crate::message`])
//!
//! JSON frames always start with `{`; gossip lines never do.

use crate::address::PeerAddress;
use serde::{Deserialize, Serialize};

/// Kind of an inbound payload, decided from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// JSON control frame
    Control,
    /// Gossip text line
    Gossip,
    /// Empty payload
    Empty,
}

/// Classify raw payload bytes.
pub fn classify(data: &[u8]) -> PayloadKind {
    match data.first() {
        Some(b'{') => PayloadKind::Control,
        Some(_) => PayloadKind::Gossip,
        None => PayloadKind::Empty,
    }
}

/// Control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Peer → seed: register my listening address.
    Register { address: PeerAddress },

    /// Seed → peer: the seed's current peer-list snapshot.
    PeerList { peers: Vec<PeerAddress> },

    /// Peer → seed: this peer failed liveness probing. No reply.
    DeadNode {
        /// Peer believed dead
        address: PeerAddress,
        /// Peer that observed the failure
        reporter: PeerAddress,
        /// When the failure was declared
        timestamp: String,
    },

    /// Peer → peer: first frame on a new connection, announcing the
    /// dialer's listening address.
    Hello { address: PeerAddress },
}

impl Frame {
    pub fn register(address: PeerAddress) -> Self {
        Self::Register { address }
    }

    pub fn peer_list(peers: Vec<PeerAddress>) -> Self {
        Self::PeerList { peers }
    }

    pub fn dead_node(address: PeerAddress, reporter: PeerAddress, timestamp: impl Into<String>) -> Self {
        Self::DeadNode {
            address,
            reporter,
            timestamp: timestamp.into(),
        }
    }

    pub fn hello(address: PeerAddress) -> Self {
        Self::Hello { address }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Frame serialization should not fail")
    }

    /// Try to parse from JSON bytes. Returns `None` for anything that is not
    /// a well-formed frame (including frames carrying malformed addresses).
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
