//! End-to-end tests for gossip-node.
//!
//! Real seeds and peers on loopback sockets: registration, flooding with
//! dedup, dead-node detection and reporting, and isolation of bad connections.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gossip_core::{
    EventBus, EventKind, Frame, LogEntry, MembershipError, NodeRole, PeerAddress, Subscription,
};
use gossip_node::{NodeConfig, PeerNode, SeedServer};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ANY_PORT: &str = "127.0.0.1:0";

/// An address nothing listens on.
fn unreachable_port_address() -> PeerAddress {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    PeerAddress::new("127.0.0.1", port).unwrap()
}

/// Collects every entry published on a bus.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<LogEntry>>>);

impl Recorder {
    fn attach(bus: &Arc<EventBus>) -> (Self, Subscription) {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.0);
        let sub = bus.subscribe(move |entry| sink.lock().unwrap().push(entry.clone()));
        (recorder, sub)
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&LogEntry) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

/// Poll `check` until it holds or `limit` elapses.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    timeout(limit, async {
        while !check() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .is_ok()
}

async fn start_seeds(count: usize, bus: &Arc<EventBus>) -> Vec<SeedServer> {
    let mut seeds = Vec::new();
    for _ in 0..count {
        seeds.push(SeedServer::start(ANY_PORT, Arc::clone(bus)).await.unwrap());
    }
    seeds
}

fn peer_config(seeds: &[SeedServer]) -> NodeConfig {
    NodeConfig {
        seeds: seeds.iter().map(|s| s.address().clone()).collect(),
        fan_out: None,
        gossip_start_delay_ms: 800,
        gossip_interval_ms: 20,
        probe_interval_ms: 100,
        probe_timeout_ms: 100,
        rpc_timeout_ms: 1000,
        ..NodeConfig::default()
    }
}

fn quiet_config(seeds: &[SeedServer]) -> NodeConfig {
    NodeConfig {
        gossip_start_delay_ms: 60_000,
        ..peer_config(seeds)
    }
}

async fn start_peers(count: usize, config: &NodeConfig, bus: &Arc<EventBus>) -> Vec<PeerNode> {
    let mut peers = Vec::new();
    for _ in 0..count {
        peers.push(
            PeerNode::start(config.clone(), ANY_PORT, Arc::clone(bus))
                .await
                .unwrap(),
        );
    }
    peers
}

async fn raw_connect(addr: &PeerAddress) -> RawSocket {
    let (ws, _) = connect_async(addr.ws_url()).await.expect("Failed to connect");
    ws
}

async fn recv_text(ws: &mut RawSocket) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for reply")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

fn is_peer(entry: &LogEntry, peer: &PeerNode) -> bool {
    entry.role == NodeRole::Peer && entry.local_port == peer.address().port()
}

// ==================== Seed RPCs ====================

#[tokio::test]
async fn test_seed_register_and_dead_report() {
    let bus = Arc::new(EventBus::new());
    let seed = SeedServer::start(ANY_PORT, Arc::clone(&bus)).await.unwrap();
    let a = PeerAddress::new("127.0.0.1", 9100).unwrap();
    let b = PeerAddress::new("127.0.0.1", 9101).unwrap();

    let mut ws = raw_connect(seed.address()).await;
    ws.send(Message::text(Frame::register(a.clone()).to_json())).await.unwrap();
    let reply = Frame::from_json(recv_text(&mut ws).await.as_bytes());
    assert_eq!(reply, Some(Frame::peer_list(vec![a.clone()])));

    ws.send(Message::text(Frame::register(b.clone()).to_json())).await.unwrap();
    let reply = Frame::from_json(recv_text(&mut ws).await.as_bytes());
    assert_eq!(reply, Some(Frame::peer_list(vec![a.clone(), b.clone()])));

    // Reporting twice leaves the same registry as reporting once
    for _ in 0..2 {
        ws.send(Message::text(Frame::dead_node(a.clone(), b.clone(), "now").to_json()))
            .await
            .unwrap();
    }
    assert!(eventually(Duration::from_secs(2), || !seed.registry().contains(&a)).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(seed.registry().snapshot(), vec![b]);
}

#[tokio::test]
async fn test_seed_ignores_garbage() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seed = SeedServer::start(ANY_PORT, Arc::clone(&bus)).await.unwrap();
    let a = PeerAddress::new("127.0.0.1", 9100).unwrap();

    let mut ws = raw_connect(seed.address()).await;
    ws.send(Message::text("not a frame")).await.unwrap();
    ws.send(Message::text(r#"{"type":"register","address":{"host":"","port":1}}"#))
        .await
        .unwrap();
    ws.send(Message::text(Frame::register(a.clone()).to_json())).await.unwrap();

    // The session survives and still answers
    let reply = Frame::from_json(recv_text(&mut ws).await.as_bytes());
    assert_eq!(reply, Some(Frame::peer_list(vec![a])));
    assert_eq!(seed.registry().len(), 1);
    assert_eq!(recorder.count(|e| e.event == EventKind::MessageMalformed), 2);
}

// ==================== Membership ====================

#[tokio::test]
async fn test_insufficient_seeds_is_startup_error() {
    let bus = Arc::new(EventBus::new());
    let config = NodeConfig {
        seeds: vec![
            unreachable_port_address(),
            unreachable_port_address(),
            unreachable_port_address(),
        ],
        rpc_timeout_ms: 500,
        ..NodeConfig::default()
    };

    let err = PeerNode::start(config, ANY_PORT, bus)
        .await
        .err()
        .expect("startup should fail");
    assert_eq!(
        err.downcast_ref::<MembershipError>(),
        Some(&MembershipError::InsufficientSeeds {
            reachable: 0,
            required: 2,
            total: 3,
        })
    );
}

#[tokio::test]
async fn test_peers_register_with_quorum() {
    let bus = Arc::new(EventBus::new());
    let seeds = start_seeds(4, &bus).await;
    let peers = start_peers(3, &quiet_config(&seeds), &bus).await;

    for peer in &peers {
        let registered = seeds
            .iter()
            .filter(|s| s.registry().contains(peer.address()))
            .count();
        assert!(registered >= 3, "quorum of 4 seeds is 3, got {}", registered);
    }

    // With fan-out unbounded, the last peer connects to everyone before it
    assert_eq!(peers[2].selected_peers().len(), 2);
    assert_eq!(peers[2].connection_count(), 2);
}

// ==================== Gossip ====================

#[tokio::test]
async fn test_triangle_delivers_every_message_exactly_once() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seeds = start_seeds(3, &bus).await;
    let peers = start_peers(3, &peer_config(&seeds), &bus).await;

    // 10 messages from each of the two other peers
    let all_delivered = eventually(Duration::from_secs(10), || {
        peers.iter().all(|p| {
            recorder.count(|e| is_peer(e, p) && e.event == EventKind::MessageDelivered) >= 20
        })
    })
    .await;
    assert!(all_delivered);
    sleep(Duration::from_millis(300)).await;

    for peer in &peers {
        let originated =
            recorder.count(|e| is_peer(e, peer) && e.event == EventKind::MessageOriginated);
        assert_eq!(originated, 10);

        let delivered: Vec<String> = recorder
            .entries()
            .into_iter()
            .filter(|e| is_peer(e, peer) && e.event == EventKind::MessageDelivered)
            .map(|e| e.detail)
            .collect();
        assert_eq!(delivered.len(), 20);

        // Never delivers its own messages back to itself
        let own = format!("Gossip broadcast from {} ", peer.address());
        assert!(delivered.iter().all(|d| !d.contains(&own)));

        // Each (sender, seq) appears once
        let ids: HashSet<String> = delivered
            .iter()
            .map(|d| {
                let line = d.trim_start_matches("Received: ");
                let (head, sender) = line.split_once(" - Gossip broadcast from ").unwrap();
                let seq = head.rsplit_once(":Msg#").unwrap().1;
                let sender = sender.split_whitespace().next().unwrap();
                format!("{}#{}", sender, seq)
            })
            .collect();
        assert_eq!(ids.len(), 20);
    }
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_open() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seeds = start_seeds(1, &bus).await;
    let peers = start_peers(1, &quiet_config(&seeds), &bus).await;
    let peer = &peers[0];

    let mut ws = raw_connect(peer.address()).await;
    ws.send(Message::text("definitely not gossip")).await.unwrap();
    ws.send(Message::text(
        "2025-01-01 00:00:00:127.0.0.1:Msg#1 - Gossip broadcast from 127.0.0.1:9",
    ))
    .await
    .unwrap();

    let delivered = eventually(Duration::from_secs(2), || {
        recorder.count(|e| is_peer(e, peer) && e.event == EventKind::MessageDelivered) == 1
    })
    .await;
    assert!(delivered);
    assert_eq!(
        recorder.count(|e| is_peer(e, peer) && e.event == EventKind::MessageMalformed),
        1
    );
    assert_eq!(
        recorder.count(|e| is_peer(e, peer) && e.event == EventKind::ConnectionLost),
        0
    );
}

#[tokio::test]
async fn test_stalled_connection_does_not_block_others() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seeds = start_seeds(1, &bus).await;
    let config = peer_config(&seeds);

    let first = PeerNode::start(config.clone(), ANY_PORT, Arc::clone(&bus))
        .await
        .unwrap();

    // Announces an address nobody listens on and never reads
    let mut stalled = raw_connect(first.address()).await;
    stalled
        .send(Message::text(Frame::hello(unreachable_port_address()).to_json()))
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || first.connection_count() == 1).await);

    let second = PeerNode::start(config, ANY_PORT, Arc::clone(&bus))
        .await
        .unwrap();

    let received = eventually(Duration::from_secs(10), || {
        recorder.count(|e| is_peer(e, &second) && e.event == EventKind::MessageDelivered) == 10
    })
    .await;
    assert!(received);

    // The stalled link fails its probes and is dropped on its own
    let dropped = eventually(Duration::from_secs(5), || {
        recorder.count(|e| is_peer(e, &first) && e.event == EventKind::PeerDead) == 1
    })
    .await;
    assert!(dropped);
    assert_eq!(first.connection_count(), 1);
    drop(stalled);
}

// ==================== Liveness ====================

#[tokio::test]
async fn test_disconnected_peer_is_reported_and_removed() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seeds = start_seeds(3, &bus).await;
    let peers = start_peers(3, &quiet_config(&seeds), &bus).await;
    let victim = peers[0].address().clone();

    assert!(eventually(Duration::from_secs(2), || peers[0].connection_count() == 2).await);
    peers[0].simulate_disconnect();

    let removed = eventually(Duration::from_secs(10), || {
        seeds.iter().all(|s| !s.registry().contains(&victim))
    })
    .await;
    assert!(removed);
    sleep(Duration::from_millis(500)).await;

    for reporter in &peers[1..] {
        let dead = recorder.count(|e| is_peer(e, reporter) && e.event == EventKind::PeerDead);
        assert_eq!(dead, 1);

        // One report per seed, never repeated
        let reports = recorder.count(|e| {
            is_peer(e, reporter)
                && e.event == EventKind::DeadNodeReported
                && e.detail.contains(&victim.to_string())
        });
        assert_eq!(reports, seeds.len());
        assert_eq!(reporter.connection_count(), 1);
    }
}

#[tokio::test]
async fn test_graceful_shutdown_is_not_reported() {
    let bus = Arc::new(EventBus::new());
    let (recorder, _sub) = Recorder::attach(&bus);
    let seeds = start_seeds(3, &bus).await;
    let peers = start_peers(2, &quiet_config(&seeds), &bus).await;
    let leaving = peers[1].address().clone();

    assert!(eventually(Duration::from_secs(2), || peers[0].connection_count() == 1).await);
    peers[1].shutdown();

    let closed = eventually(Duration::from_secs(2), || {
        recorder.count(|e| is_peer(e, &peers[0]) && e.event == EventKind::ConnectionClosed) == 1
    })
    .await;
    assert!(closed);

    // Several probe intervals pass without a dead-node report
    sleep(Duration::from_millis(600)).await;
    assert_eq!(peers[0].connection_count(), 0);
    assert_eq!(recorder.count(|e| e.event == EventKind::PeerDead), 0);
    let still_registered = seeds
        .iter()
        .filter(|s| s.registry().contains(&leaving))
        .count();
    assert!(still_registered >= 2);
}
