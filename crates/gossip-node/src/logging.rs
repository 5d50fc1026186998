//! Node logging: tracing output plus structured entries on the node's bus.
//!
//! Every entry is mirrored to `tracing` at a level chosen by its kind and
//! published on the node's [`EventBus`], where sinks such as [`FileSink`]
//! pick it up.

use chrono::Local;
use gossip_core::{EventBus, EventKind, LogEntry, NodeRole, Subscription};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Current wall-clock time in log format.
pub fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Logging handle bound to one node's role and listening port.
#[derive(Clone)]
pub struct NodeLog {
    role: NodeRole,
    local_port: u16,
    bus: Arc<EventBus>,
}

impl NodeLog {
    pub fn new(role: NodeRole, local_port: u16, bus: Arc<EventBus>) -> Self {
        Self {
            role,
            local_port,
            bus,
        }
    }

    /// Record an event not tied to a particular socket.
    pub fn record(&self, event: EventKind, detail: impl Into<String>) {
        self.emit(event, None, detail.into());
    }

    /// Record a connection event, carrying the socket's ephemeral port.
    pub fn record_conn(&self, event: EventKind, ephemeral_port: u16, detail: impl Into<String>) {
        self.emit(event, Some(ephemeral_port), detail.into());
    }

    fn emit(&self, event: EventKind, ephemeral_port: Option<u16>, detail: String) {
        let entry = LogEntry {
            timestamp: now_timestamp(),
            role: self.role,
            local_port: self.local_port,
            ephemeral_port,
            event,
            detail,
        };

        let node = format!("{}:{}", self.role, self.local_port);
        match event {
            EventKind::RegistrationFailed
            | EventKind::MessageMalformed
            | EventKind::ProbeFailed
            | EventKind::PeerDead
            | EventKind::ConnectionLost => {
                warn!(node = %node, ephemeral_port = ?ephemeral_port, event = ?event, "{}", entry.detail)
            }
            _ => info!(node = %node, ephemeral_port = ?ephemeral_port, event = ?event, "{}", entry.detail),
        }

        self.bus.emit(&entry);
    }
}

/// Appends every entry of a bus to `logfile_<role>_<port>.txt`.
pub struct FileSink;

impl FileSink {
    /// Log file path for a node.
    pub fn path_for(dir: &Path, role: NodeRole, port: u16) -> PathBuf {
        dir.join(format!("logfile_{}_{}.txt", role, port))
    }

    /// Open (or create) the node's log file and subscribe it to `bus`.
    pub fn attach(
        bus: &Arc<EventBus>,
        dir: &Path,
        role: NodeRole,
        port: u16,
    ) -> std::io::Result<Subscription> {
        std::fs::create_dir_all(dir)?;
        let file: Mutex<File> = Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::path_for(dir, role, port))?,
        );

        Ok(bus.subscribe(move |entry| {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{}", entry.to_line()) {
                warn!("Failed to write log entry: {}", e);
            }
        }))
    }

    /// Route each entry of a bus shared by many nodes to its own node's file.
    ///
    /// Files are opened on the first entry of each node.
    pub fn attach_per_node(bus: &Arc<EventBus>, dir: &Path) -> std::io::Result<Subscription> {
        std::fs::create_dir_all(dir)?;
        let dir = dir.to_path_buf();
        let files: Mutex<HashMap<(NodeRole, u16), File>> = Mutex::new(HashMap::new());

        Ok(bus.subscribe(move |entry| {
            let mut files = files.lock().unwrap_or_else(|e| e.into_inner());
            let key = (entry.role, entry.local_port);
            if !files.contains_key(&key) {
                let path = Self::path_for(&dir, entry.role, entry.local_port);
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => {
                        files.insert(key, file);
                    }
                    Err(e) => {
                        warn!("Failed to open log file {}: {}", path.display(), e);
                        return;
                    }
                }
            }
            if let Some(file) = files.get_mut(&key) {
                if let Err(e) = writeln!(file, "{}", entry.to_line()) {
                    warn!("Failed to write log entry: {}", e);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_reach_bus() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let log = NodeLog::new(NodeRole::Peer, 8000, Arc::clone(&bus));
        log.record_conn(EventKind::ConnectionOpened, 50123, "Connected to peer 127.0.0.1:8001");
        log.record(EventKind::Listening, "Listening on 127.0.0.1:8000");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].local_port, 8000);
        assert_eq!(seen[0].ephemeral_port, Some(50123));
        assert_eq!(seen[0].role, NodeRole::Peer);
        assert_eq!(seen[1].ephemeral_port, None);
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let _sub = FileSink::attach(&bus, dir.path(), NodeRole::Seed, 6000).unwrap();

        let log = NodeLog::new(NodeRole::Seed, 6000, Arc::clone(&bus));
        log.record(EventKind::Listening, "Listening for connections on 127.0.0.1:6000");
        log.record_conn(EventKind::ConnectionAccepted, 40000, "Accepted connection from 127.0.0.1");

        let path = FileSink::path_for(dir.path(), NodeRole::Seed, 6000);
        assert!(path.ends_with("logfile_seed_6000.txt"));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Listening for connections on 127.0.0.1:6000"));
        assert!(lines[1].ends_with("(Ephemeral: 40000)"));
    }

    #[test]
    fn test_per_node_sink_splits_by_node() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let _sub = FileSink::attach_per_node(&bus, dir.path()).unwrap();

        NodeLog::new(NodeRole::Seed, 6000, Arc::clone(&bus)).record(EventKind::Listening, "seed up");
        NodeLog::new(NodeRole::Peer, 8000, Arc::clone(&bus)).record(EventKind::Listening, "peer up");
        NodeLog::new(NodeRole::Peer, 8000, Arc::clone(&bus)).record(EventKind::Shutdown, "peer down");

        let seed = std::fs::read_to_string(FileSink::path_for(dir.path(), NodeRole::Seed, 6000)).unwrap();
        let peer = std::fs::read_to_string(FileSink::path_for(dir.path(), NodeRole::Peer, 8000)).unwrap();
        assert_eq!(seed.lines().count(), 1);
        assert_eq!(peer.lines().count(), 2);
        assert!(peer.lines().last().unwrap().ends_with("] peer down"));
    }
}
