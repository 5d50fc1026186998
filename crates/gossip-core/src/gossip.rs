//! Gossip engine: origination, dedup and relay for one peer node.
//!
//! The engine owns the node-global "seen" set and the set of active outbound
//! edges. Both live behind one mutex so that check-and-record of a message and
//! the fan-out that follows are atomic with respect to concurrent receivers:
//! a message can never be forwarded twice by the same node.
//!
//! Forwarding never blocks. Each edge is an [`Outbound`] queue drained by its
//! own writer task, so a slow edge only backs up its own queue.

use crate::address::PeerAddress;
use crate::message::{GossipMessage, MessageError, MessageId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Node-local identifier of one connection.
pub type ConnectionId = u64;

/// Non-blocking handle for queueing lines on one connection.
pub trait Outbound: Send + Sync {
    /// Queue a line for delivery. Returns `false` if the edge is gone.
    fn push(&self, line: &str) -> bool;
}

/// Outcome of handing an inbound line to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// First sighting: recorded and relayed to `forwarded` edges.
    Delivered {
        message: GossipMessage,
        forwarded: usize,
    },
    /// Already processed; dropped without forwarding.
    Duplicate(MessageId),
}

/// A freshly originated message and how many edges it went out on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub message: GossipMessage,
    pub forwarded: usize,
}

struct EngineState<O> {
    seen: HashSet<MessageId>,
    connections: BTreeMap<ConnectionId, O>,
    originated: u32,
}

/// Per-node gossip state, shared by handle between all connection tasks.
pub struct GossipEngine<O> {
    own: PeerAddress,
    message_limit: u32,
    state: Mutex<EngineState<O>>,
}

impl<O: Outbound> GossipEngine<O> {
    /// Create an engine for `own` that originates at most `message_limit` messages.
    pub fn new(own: PeerAddress, message_limit: u32) -> Self {
        Self {
            own,
            message_limit,
            state: Mutex::new(EngineState {
                seen: HashSet::new(),
                connections: BTreeMap::new(),
                originated: 0,
            }),
        }
    }

    pub fn own_address(&self) -> &PeerAddress {
        &self.own
    }

    /// Add an edge to the active set.
    pub fn add_connection(&self, id: ConnectionId, outbound: O) {
        self.lock().connections.insert(id, outbound);
    }

    /// Remove an edge; the engine stops forwarding to it immediately.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<O> {
        self.lock().connections.remove(&id)
    }

    /// Remove every edge (used at shutdown).
    pub fn clear_connections(&self) -> Vec<O> {
        let mut state = self.lock();
        std::mem::take(&mut state.connections).into_values().collect()
    }

    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.lock().connections.keys().copied().collect()
    }

    /// How many messages this node has originated so far.
    pub fn originated(&self) -> u32 {
        self.lock().originated
    }

    /// Whether the origination budget is used up.
    pub fn exhausted(&self) -> bool {
        self.originated() >= self.message_limit
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen.len()
    }

    /// Originate the next message and flood it to every active edge.
    ///
    /// Returns `None` once `message_limit` messages have been produced.
    pub fn originate(&self, timestamp: &str) -> Result<Option<Broadcast>, MessageError> {
        let mut state = self.lock();
        if state.originated >= self.message_limit {
            return Ok(None);
        }

        let message = GossipMessage::new(self.own.clone(), state.originated + 1, timestamp)?;
        state.originated += 1;
        state.seen.insert(message.id());

        let forwarded = Self::fan_out(&mut state, &message.to_line(), None);
        Ok(Some(Broadcast { message, forwarded }))
    }

    /// Process a line received on connection `from`.
    ///
    /// Malformed lines are rejected without touching any state.
    pub fn receive(&self, from: ConnectionId, line: &str) -> Result<Receipt, MessageError> {
        let message = GossipMessage::parse(line)?;
        let id = message.id();

        let mut state = self.lock();
        if !state.seen.insert(id.clone()) {
            debug!(
                "Dropping duplicate {}#{} from connection {}",
                id.sender, id.seq, from
            );
            return Ok(Receipt::Duplicate(id));
        }

        let forwarded = Self::fan_out(&mut state, &message.to_line(), Some(from));
        Ok(Receipt::Delivered { message, forwarded })
    }

    /// Push to every edge except `exclude`. Edges whose queue is gone are dropped.
    fn fan_out(state: &mut EngineState<O>, line: &str, exclude: Option<ConnectionId>) -> usize {
        let mut forwarded = 0;
        let mut gone = Vec::new();

        for (id, outbound) in &state.connections {
            if Some(*id) == exclude {
                continue;
            }
            if outbound.push(line) {
                forwarded += 1;
            } else {
                gone.push(*id);
            }
        }

        for id in gone {
            debug!("Connection {} queue closed, removing from active set", id);
            state.connections.remove(&id);
        }

        forwarded
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState<O>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
