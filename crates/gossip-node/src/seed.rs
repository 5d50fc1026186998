//! Seed node: maintains the peer list and answers registration RPCs.
//!
//! Seeds never gossip. Each inbound WebSocket carries control frames only:
//! - `register` adds (or refreshes) the sender and is answered with a
//!   `peerList` snapshot that includes the registrant
//! - `deadNode` removes the reported address; no reply is sent

use crate::logging::{now_ms, NodeLog};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use gossip_core::{
    classify, EventBus, EventKind, Frame, NodeRole, PayloadKind, PeerAddress, PeerListRegistry,
    Registration,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error};

/// Seed-side membership operations, independent of sockets.
#[derive(Default)]
pub struct SeedCoordinator {
    registry: PeerListRegistry,
}

impl SeedCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &PeerListRegistry {
        &self.registry
    }

    /// Register `addr` and return the resulting snapshot.
    pub fn on_register(&self, addr: PeerAddress, now: u64) -> (Registration, Vec<PeerAddress>) {
        let registration = self.registry.register(addr, now);
        (registration, self.registry.snapshot())
    }

    /// Remove a reported dead address. Returns true if it was registered.
    pub fn on_dead_report(&self, addr: &PeerAddress) -> bool {
        self.registry.remove(addr)
    }
}

/// A running seed: accept loop plus one session task per connection.
pub struct SeedServer {
    address: PeerAddress,
    coordinator: Arc<SeedCoordinator>,
    log: NodeLog,
    accept_task: Option<JoinHandle<()>>,
}

impl SeedServer {
    /// Bind `listen` (`host:port`) and start accepting registrations.
    ///
    /// A port of 0 binds an OS-assigned port; [`SeedServer::address`] reports
    /// the real one.
    pub async fn start(listen: &str, bus: Arc<EventBus>) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind seed on {}", listen))?;
        let local = listener.local_addr()?;
        let address = PeerAddress::new(local.ip().to_string(), local.port())?;
        let port = address.port();

        let log = NodeLog::new(NodeRole::Seed, port, bus);
        log.record(
            EventKind::Listening,
            format!("Seed listening for connections on {}", address),
        );

        let coordinator = Arc::new(SeedCoordinator::new());
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&coordinator),
            log.clone(),
        ));

        Ok(Self {
            address,
            coordinator,
            log,
            accept_task: Some(accept_task),
        })
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn registry(&self) -> &PeerListRegistry {
        self.coordinator.registry()
    }

    /// Stop accepting and drop every open session.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            self.log
                .record(EventKind::Shutdown, format!("Seed {} shut down", self.address));
        }
    }

    async fn accept_loop(listener: TcpListener, coordinator: Arc<SeedCoordinator>, log: NodeLog) {
        // Sessions are aborted when this set is dropped with the task
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        sessions.spawn(Self::session(
                            stream,
                            remote,
                            Arc::clone(&coordinator),
                            log.clone(),
                        ));
                    }
                    Err(e) => error!("Seed failed to accept connection: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
    }

    async fn session(
        stream: TcpStream,
        remote: SocketAddr,
        coordinator: Arc<SeedCoordinator>,
        log: NodeLog,
    ) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Liveness probes connect and close without upgrading
                debug!("Connection from {} closed before upgrade: {}", remote, e);
                return;
            }
        };

        let ephemeral = remote.port();
        log.record_conn(
            EventKind::ConnectionAccepted,
            ephemeral,
            format!("Accepted connection from {}", remote.ip()),
        );

        while let Some(msg) = ws.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Seed session with {} ended: {}", remote, e);
                    break;
                }
            };

            let frame = match classify(text.as_bytes()) {
                PayloadKind::Control => Frame::from_json(text.as_bytes()),
                PayloadKind::Gossip | PayloadKind::Empty => None,
            };
            let Some(frame) = frame else {
                log.record_conn(
                    EventKind::MessageMalformed,
                    ephemeral,
                    format!("Ignoring unrecognised message from {}: {}", remote.ip(), text.trim()),
                );
                continue;
            };

            match frame {
                Frame::Register { address } => {
                    let (registration, peers) = coordinator.on_register(address.clone(), now_ms());
                    let verb = match registration {
                        Registration::Added => "Registered",
                        Registration::Refreshed => "Refreshed registration of",
                    };
                    log.record_conn(
                        EventKind::Registered,
                        ephemeral,
                        format!("{} peer {}", verb, address),
                    );

                    let count = peers.len();
                    if let Err(e) = ws.send(Message::text(Frame::peer_list(peers).to_json())).await {
                        debug!("Failed to send peer list to {}: {}", remote, e);
                        break;
                    }
                    log.record_conn(
                        EventKind::PeerListSent,
                        ephemeral,
                        format!("Sent peer list ({} peer(s)) to {}", count, address),
                    );
                }
                Frame::DeadNode {
                    address,
                    reporter,
                    timestamp,
                } => {
                    let removed = coordinator.on_dead_report(&address);
                    let outcome = if removed { "removed" } else { "not registered" };
                    log.record_conn(
                        EventKind::DeadNodeRemoved,
                        ephemeral,
                        format!(
                            "Dead node {} reported by {} at {} ({})",
                            address, reporter, timestamp, outcome
                        ),
                    );
                }
                other => debug!("Seed ignoring {:?} from {}", other, remote),
            }
        }

        log.record_conn(
            EventKind::ConnectionClosed,
            ephemeral,
            format!("Connection from {} closed", remote.ip()),
        );
    }
}

impl Drop for SeedServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
