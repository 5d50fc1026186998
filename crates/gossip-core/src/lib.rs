//! gossip-core: runtime-agnostic building blocks for seed-based gossip.
//!
//! This crate provides:
//! - Peer addresses and the seed-side peer list registry
//! - The gossip line format and control frames
//! - The gossip engine (node-global dedup, relay to all other edges)
//! - The per-connection liveness state machine and `Prober` capability
//! - The membership client (quorum registration, union, peer selection)
//! - Structured log entries and the `EventBus`

pub mod address;
pub mod events;
pub mod gossip;
pub mod liveness;
pub mod membership;
pub mod message;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use address::{AddressError, PeerAddress};
pub use events::{EventBus, EventKind, LogEntry, NodeRole, Subscription};
pub use gossip::{Broadcast, ConnectionId, GossipEngine, Outbound, Receipt};
pub use liveness::{LivenessConfig, LivenessEvent, LivenessState, LivenessTracker, ProbeOutcome};
pub use membership::{join, JoinOutcome, MembershipConfig, MembershipError};
pub use message::{GossipMessage, MessageError, MessageId, MESSAGES_PER_RUN};
pub use probe::Prober;
pub use protocol::{classify, Frame, PayloadKind};
pub use registry::{PeerListRegistry, Registration};
pub use transport::{SeedDirectory, TransportError};
