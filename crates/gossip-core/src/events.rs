//! Structured node log entries and the bus that carries them.
//!
//! Every notable event of a seed or peer becomes a [`LogEntry`]. Entries are
//! published on an [`EventBus`]; sinks (console, per-node log file, tests)
//! subscribe with a callback.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Role of the node that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRole {
    Seed,
    Peer,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seed => f.write_str("seed"),
            Self::Peer => f.write_str("peer"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Listening,
    ConnectionAccepted,
    ConnectionOpened,
    ConnectionClosed,
    ConnectionLost,
    Registered,
    RegistrationFailed,
    PeerListSent,
    DeadNodeRemoved,
    DeadNodeReported,
    MessageOriginated,
    MessageDelivered,
    MessageMalformed,
    ProbeFailed,
    ProbeRecovered,
    PeerDead,
    Disconnected,
    Shutdown,
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Wall-clock time, `%Y-%m-%d %H:%M:%S`
    pub timestamp: String,
    pub role: NodeRole,
    /// The node's designated listening port
    pub local_port: u16,
    /// OS-assigned port of the socket involved, for connection events
    pub ephemeral_port: Option<u16>,
    pub event: EventKind,
    pub detail: String,
}

impl LogEntry {
    /// Render as the single-line text format used by file sinks.
    pub fn to_line(&self) -> String {
        match self.ephemeral_port {
            Some(port) => format!("[{}] {} (Ephemeral: {})", self.timestamp, self.detail, port),
            None => format!("[{}] {}", self.timestamp, self.detail),
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Event bus for publishing log entries to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to entries. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&LogEntry) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds a read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Publish an entry to all subscribers.
    pub fn emit(&self, entry: &LogEntry) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(entry);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(event: EventKind) -> LogEntry {
        LogEntry {
            timestamp: "2025-01-01 00:00:00".into(),
            role: NodeRole::Peer,
            local_port: 8000,
            ephemeral_port: Some(51234),
            event,
            detail: "Connected to peer 127.0.0.1:8001".into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.event));

        bus.emit(&entry(EventKind::ConnectionOpened));
        bus.emit(&entry(EventKind::MessageDelivered));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::ConnectionOpened, EventKind::MessageDelivered]
        );
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_line_includes_ephemeral_port() {
        let line = entry(EventKind::ConnectionOpened).to_line();
        assert_eq!(
            line,
            "[2025-01-01 00:00:00] Connected to peer 127.0.0.1:8001 (Ephemeral: 51234)"
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&entry(EventKind::PeerDead)).unwrap();
        assert!(json.contains("\"role\":\"peer\""));
        assert!(json.contains("\"localPort\":8000"));
        assert!(json.contains("\"ephemeralPort\":51234"));
        assert!(json.contains("\"event\":\"peerDead\""));
    }
}
