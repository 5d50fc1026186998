//! Peer node runtime.
//!
//! A peer binds its listening port, joins the network through a quorum of
//! seeds, dials the selected peers and then runs four kinds of tasks:
//! - the accept loop, upgrading inbound sockets
//! - one reader and one writer per connection (see [`crate::connection`])
//! - the dispatcher, which feeds every inbound line to the gossip engine
//! - one liveness monitor per announced connection
//!
//! The gossip loop originates the node's own messages on a fixed interval.

use crate::config::NodeConfig;
use crate::connection::{dial, Connection, ConnectionEvent, LineOutbound};
use crate::logging::{now_timestamp, NodeLog};
use crate::probe::build_prober;
use crate::seed_client::WsSeedDirectory;
use anyhow::{Context, Result};
use gossip_core::membership::report_dead_to_all;
use gossip_core::{
    classify, join, ConnectionId, EventBus, EventKind, Frame, GossipEngine, JoinOutcome,
    LivenessEvent, LivenessTracker, NodeRole, PayloadKind, PeerAddress, ProbeOutcome, Prober,
    Receipt, SeedDirectory, TransportError,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// One open WebSocket and the peer behind it.
struct Link {
    conn: Connection,
    /// Listening address of the remote. Known up front for outgoing links,
    /// learned from `hello` for incoming ones.
    remote: Option<PeerAddress>,
}

/// State shared by all tasks of one peer.
struct PeerInner {
    address: PeerAddress,
    config: NodeConfig,
    engine: GossipEngine<LineOutbound>,
    links: Mutex<HashMap<ConnectionId, Link>>,
    monitors: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    dead_reported: Mutex<HashSet<PeerAddress>>,
    next_id: AtomicU64,
    halted: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    directory: Arc<dyn SeedDirectory>,
    prober: Arc<dyn Prober>,
    log: NodeLog,
}

/// A running peer.
///
/// Dropping a `PeerNode` without calling [`PeerNode::shutdown`] drops every
/// socket abruptly.
pub struct PeerNode {
    inner: Arc<PeerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    joined: Option<JoinOutcome>,
}

impl PeerNode {
    /// Start a peer on `listen` (`host:port`) using WebSocket seed RPCs and
    /// the configured prober. The bound address is the peer's identity.
    ///
    /// Fails if the port cannot be bound or fewer than a quorum of seeds
    /// accept the registration (`MembershipError::InsufficientSeeds`).
    pub async fn start(config: NodeConfig, listen: &str, bus: Arc<EventBus>) -> Result<Self> {
        let (listener, address, log) = Self::bind(listen, bus).await?;
        let directory = Arc::new(WsSeedDirectory::new(config.rpc_timeout(), log.clone()));
        let prober = build_prober(config.probe);
        Self::run(config, listener, address, log, directory, prober).await
    }

    /// Start a peer with explicit seed RPC and probe implementations.
    pub async fn start_with(
        config: NodeConfig,
        listen: &str,
        bus: Arc<EventBus>,
        directory: Arc<dyn SeedDirectory>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let (listener, address, log) = Self::bind(listen, bus).await?;
        Self::run(config, listener, address, log, directory, prober).await
    }

    async fn bind(listen: &str, bus: Arc<EventBus>) -> Result<(TcpListener, PeerAddress, NodeLog)> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind peer on {}", listen))?;
        let local = listener.local_addr()?;
        let address = PeerAddress::new(local.ip().to_string(), local.port())?;

        let log = NodeLog::new(NodeRole::Peer, address.port(), bus);
        log.record(
            EventKind::Listening,
            format!("Peer listening for connections on {}", address),
        );
        Ok((listener, address, log))
    }

    async fn run(
        config: NodeConfig,
        listener: TcpListener,
        address: PeerAddress,
        log: NodeLog,
        directory: Arc<dyn SeedDirectory>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PeerInner {
            engine: GossipEngine::new(address.clone(), config.message_count),
            address,
            config,
            links: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            dead_reported: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            halted: AtomicBool::new(false),
            events,
            directory,
            prober,
            log,
        });

        // Dropped (and therefore halted) if joining fails below
        let mut node = Self {
            inner: Arc::clone(&inner),
            tasks: Mutex::new(vec![
                tokio::spawn(Arc::clone(&inner).accept_loop(listener)),
                tokio::spawn(Arc::clone(&inner).dispatch(event_rx)),
            ]),
            joined: None,
        };

        let mut rng = StdRng::from_rng(&mut rand::rng());
        let outcome = match join(
            inner.directory.as_ref(),
            &inner.config.seeds,
            &inner.address,
            &inner.config.membership(),
            &mut rng,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                inner
                    .log
                    .record(EventKind::RegistrationFailed, format!("Cannot join network: {}", e));
                return Err(e.into());
            }
        };

        for target in &outcome.selected {
            if let Err(e) = inner.connect_to(target.clone()).await {
                warn!("Could not connect to peer {}: {}", target, e);
            }
        }
        info!(
            "Peer {} joined with {} connection(s) to {} selected peer(s)",
            inner.address,
            inner.engine.connection_count(),
            outcome.selected.len()
        );

        node.tasks().push(tokio::spawn(Arc::clone(&inner).gossip_loop()));
        node.joined = Some(outcome);
        Ok(node)
    }

    pub fn address(&self) -> &PeerAddress {
        &self.inner.address
    }

    /// Number of connections currently receiving forwarded gossip.
    pub fn connection_count(&self) -> usize {
        self.inner.engine.connection_count()
    }

    /// Number of own messages originated so far.
    pub fn originated(&self) -> u32 {
        self.inner.engine.originated()
    }

    /// Peers chosen during join.
    pub fn selected_peers(&self) -> &[PeerAddress] {
        self.joined
            .as_ref()
            .map(|outcome| outcome.selected.as_slice())
            .unwrap_or(&[])
    }

    /// Drop the listener and every socket without close frames.
    ///
    /// Neighbours see an abrupt loss and their probes start failing, which
    /// exercises the dead-node path. Idempotent.
    pub fn simulate_disconnect(&self) {
        if self.halt(false) {
            self.inner.log.record(
                EventKind::Disconnected,
                format!("Peer {} dropped all connections", self.inner.address),
            );
        }
    }

    /// Close every connection gracefully and stop all tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.halt(true) {
            self.inner
                .log
                .record(EventKind::Shutdown, format!("Peer {} shut down", self.inner.address));
        }
    }

    /// Stop everything. Returns false if the node was already halted.
    fn halt(&self, graceful: bool) -> bool {
        if self.inner.halted.swap(true, Ordering::SeqCst) {
            return false;
        }

        for task in self.tasks().drain(..) {
            task.abort();
        }
        for (_, monitor) in self.inner.monitors().drain() {
            monitor.abort();
        }
        self.inner.engine.clear_connections();

        let links: Vec<Link> = self.inner.links().drain().map(|(_, link)| link).collect();
        for mut link in links {
            if graceful {
                link.conn.close();
            } else {
                link.conn.abort();
            }
        }
        true
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.halt(false);
    }
}

impl PeerInner {
    fn links(&self) -> MutexGuard<'_, HashMap<ConnectionId, Link>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<ConnectionId, JoinHandle<()>>> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ephemeral_port(&self, id: ConnectionId) -> Option<u16> {
        self.links().get(&id).map(|link| link.conn.ephemeral_port)
    }

    fn record_link(&self, id: ConnectionId, event: EventKind, detail: String) {
        match self.ephemeral_port(id) {
            Some(port) => self.log.record_conn(event, port, detail),
            None => self.log.record(event, detail),
        }
    }

    // ==================== Connections ====================

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        // Pending upgrades die with this task
        let mut upgrades = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        upgrades.spawn(Arc::clone(&self).accept_connection(stream, remote));
                    }
                    Err(e) => error!("Peer {} failed to accept connection: {}", self.address, e),
                },
                Some(_) = upgrades.join_next(), if !upgrades.is_empty() => {}
            }
        }
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let ws = match timeout(self.config.rpc_timeout(), accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                // TCP liveness probes connect and close without upgrading
                debug!("Connection from {} closed before upgrade: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("Connection from {} did not upgrade in time, dropping", remote);
                return;
            }
        };
        if self.halted() {
            return;
        }

        let id = self.next_id();
        {
            let mut links = self.links();
            let conn = Connection::spawn(id, remote.port(), ws, self.events.clone());
            links.insert(id, Link { conn, remote: None });
        }
        self.log.record_conn(
            EventKind::ConnectionAccepted,
            remote.port(),
            format!("Accepted connection from {}", remote.ip()),
        );
    }

    /// Dial `target`, announce ourselves, and start forwarding and probing.
    async fn connect_to(self: &Arc<Self>, target: PeerAddress) -> Result<(), TransportError> {
        let (ws, local) = dial(&target).await?;
        let id = self.next_id();

        let outbound = {
            let mut links = self.links();
            let conn = Connection::spawn(id, local.port(), ws, self.events.clone());
            // Queued ahead of any gossip line
            conn.send_text(Frame::hello(self.address.clone()).to_json());
            let outbound = conn.outbound();
            links.insert(
                id,
                Link {
                    conn,
                    remote: Some(target.clone()),
                },
            );
            outbound
        };

        self.engine.add_connection(id, outbound);
        self.log.record_conn(
            EventKind::ConnectionOpened,
            local.port(),
            format!("Connected to peer {}", target),
        );
        self.spawn_monitor(id, local.port(), target);
        Ok(())
    }

    // ==================== Dispatch ====================

    async fn dispatch(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            if self.halted() {
                break;
            }
            match event {
                ConnectionEvent::Line { id, text } => self.on_line(id, &text),
                ConnectionEvent::Closed { id, graceful } => self.on_closed(id, graceful),
            }
        }
    }

    fn on_line(self: &Arc<Self>, id: ConnectionId, text: &str) {
        match classify(text.as_bytes()) {
            PayloadKind::Empty => {}
            PayloadKind::Control => match Frame::from_json(text.as_bytes()) {
                Some(Frame::Hello { address }) => self.on_hello(id, address),
                _ => self.record_link(
                    id,
                    EventKind::MessageMalformed,
                    format!("Ignoring unexpected control message: {}", text.trim()),
                ),
            },
            PayloadKind::Gossip => match self.engine.receive(id, text) {
                Ok(Receipt::Delivered { message, forwarded }) => self.record_link(
                    id,
                    EventKind::MessageDelivered,
                    format!("Received: {} (forwarded to {})", message, forwarded),
                ),
                Ok(Receipt::Duplicate(_)) => {}
                Err(e) => self.record_link(
                    id,
                    EventKind::MessageMalformed,
                    format!("Dropping malformed message: {}", e),
                ),
            },
        }
    }

    /// An inbound connection announced its listening address.
    fn on_hello(self: &Arc<Self>, id: ConnectionId, address: PeerAddress) {
        let (outbound, ephemeral_port) = {
            let mut links = self.links();
            let Some(link) = links.get_mut(&id) else {
                return;
            };
            if link.remote.is_some() {
                debug!("Ignoring repeated hello on connection {}", id);
                return;
            }
            link.remote = Some(address.clone());
            (link.conn.outbound(), link.conn.ephemeral_port)
        };

        info!("Connection {} belongs to peer {}", id, address);
        self.engine.add_connection(id, outbound);
        self.spawn_monitor(id, ephemeral_port, address);
    }

    fn on_closed(&self, id: ConnectionId, graceful: bool) {
        self.engine.remove_connection(id);
        let link = self.links().remove(&id);
        let Some(link) = link else {
            return;
        };

        let peer = link
            .remote
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unannounced peer".to_string());

        if graceful {
            if let Some(monitor) = self.monitors().remove(&id) {
                monitor.abort();
            }
            self.log.record_conn(
                EventKind::ConnectionClosed,
                link.conn.ephemeral_port,
                format!("Connection to {} closed", peer),
            );
        } else {
            // The monitor keeps probing; only the failure threshold reports
            self.log.record_conn(
                EventKind::ConnectionLost,
                link.conn.ephemeral_port,
                format!("Lost connection to {}", peer),
            );
        }
    }

    // ==================== Liveness ====================

    fn spawn_monitor(self: &Arc<Self>, id: ConnectionId, ephemeral_port: u16, target: PeerAddress) {
        let handle = tokio::spawn(Arc::clone(self).monitor(id, ephemeral_port, target));
        self.monitors().insert(id, handle);
        if self.halted() {
            if let Some(handle) = self.monitors().remove(&id) {
                handle.abort();
            }
        }
    }

    async fn monitor(self: Arc<Self>, id: ConnectionId, ephemeral_port: u16, target: PeerAddress) {
        let liveness = self.config.liveness();
        let mut tracker = LivenessTracker::new(liveness.failure_threshold);
        let mut ticker = interval(liveness.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let outcome = match timeout(
                liveness.probe_timeout,
                self.prober.probe(&target, liveness.probe_timeout),
            )
            .await
            {
                Ok(ok) => ProbeOutcome::from(ok),
                Err(_) => ProbeOutcome::Timeout,
            };

            if outcome == ProbeOutcome::Success && !self.links().contains_key(&id) {
                self.retire_monitor(id, ephemeral_port, &target);
                return;
            }

            match tracker.record(outcome) {
                Some(LivenessEvent::Failed { consecutive }) => self.log.record_conn(
                    EventKind::ProbeFailed,
                    ephemeral_port,
                    format!(
                        "Probe to {} failed ({}/{})",
                        target, consecutive, liveness.failure_threshold
                    ),
                ),
                Some(LivenessEvent::Recovered { previous_failures }) => self.log.record_conn(
                    EventKind::ProbeRecovered,
                    ephemeral_port,
                    format!(
                        "Probe to {} succeeded after {} failure(s)",
                        target, previous_failures
                    ),
                ),
                Some(LivenessEvent::Died { consecutive }) => {
                    self.on_peer_dead(id, ephemeral_port, &target, consecutive).await;
                    return;
                }
                None => {}
            }
        }
    }

    /// The link was lost but its peer still answers: stop probing, no report.
    fn retire_monitor(&self, id: ConnectionId, ephemeral_port: u16, target: &PeerAddress) {
        // Detaches the handle of the monitor running this call
        self.monitors().remove(&id);
        self.log.record_conn(
            EventKind::ConnectionClosed,
            ephemeral_port,
            format!("Peer {} is alive but its connection is gone, no longer probing", target),
        );
    }

    /// Drop the connection and report `target` to every seed, once per address.
    ///
    /// Runs inside the link's monitor task, whose handle stays registered
    /// until the reports finish so that halting the node cancels them.
    async fn on_peer_dead(&self, id: ConnectionId, ephemeral_port: u16, target: &PeerAddress, consecutive: u32) {
        self.engine.remove_connection(id);
        self.links().remove(&id);

        self.log.record_conn(
            EventKind::PeerDead,
            ephemeral_port,
            format!(
                "Peer {} declared dead after {} consecutive failed probes",
                target, consecutive
            ),
        );

        let first_report = self.dead_reported.lock().unwrap_or_else(|e| e.into_inner()).insert(target.clone());
        if first_report {
            let delivered =
                report_dead_to_all(self.directory.as_ref(), &self.config.seeds, target, &self.address).await;
            info!(
                "Reported dead node {} to {}/{} seed(s)",
                target,
                delivered,
                self.config.seeds.len()
            );
        } else {
            debug!("Dead node {} already reported", target);
        }

        self.monitors().remove(&id);
    }

    // ==================== Gossip ====================

    async fn gossip_loop(self: Arc<Self>) {
        sleep(self.config.gossip_start_delay()).await;

        loop {
            match self.engine.originate(&now_timestamp()) {
                Ok(Some(broadcast)) => self.log.record(
                    EventKind::MessageOriginated,
                    format!(
                        "Sent: {} (to {} connection(s))",
                        broadcast.message, broadcast.forwarded
                    ),
                ),
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to originate message: {}", e);
                    break;
                }
            }
            if self.engine.exhausted() {
                break;
            }
            sleep(self.config.gossip_interval()).await;
        }

        debug!(
            "Peer {} originated {} message(s)",
            self.address,
            self.engine.originated()
        );
    }
}
