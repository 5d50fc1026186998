//! WebSocket client for seed RPCs.
//!
//! Every RPC opens a fresh connection, sends one frame, and (for
//! registration) waits for the `peerList` reply. The whole exchange is bounded
//! by the configured RPC timeout.

use crate::connection::dial;
use crate::logging::{now_timestamp, NodeLog};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gossip_core::transport::Result;
use gossip_core::{EventKind, Frame, PeerAddress, SeedDirectory, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// [`SeedDirectory`] over WebSocket.
pub struct WsSeedDirectory {
    rpc_timeout: Duration,
    log: NodeLog,
}

impl WsSeedDirectory {
    pub fn new(rpc_timeout: Duration, log: NodeLog) -> Self {
        Self { rpc_timeout, log }
    }

    async fn bounded<T>(&self, rpc: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.rpc_timeout, rpc)
            .await
            .map_err(|_| TransportError::Timeout(self.rpc_timeout.as_millis() as u64))?
    }

    async fn register_inner(&self, seed: &PeerAddress, own: &PeerAddress) -> Result<Vec<PeerAddress>> {
        let (mut ws, local) = dial(seed).await?;
        self.log.record_conn(
            EventKind::ConnectionOpened,
            local.port(),
            format!("Connected to seed {}", seed),
        );

        ws.send(Message::text(Frame::register(own.clone()).to_json()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let peers = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match Frame::from_json(text.as_bytes()) {
                    Some(Frame::PeerList { peers }) => break peers,
                    _ => return Err(TransportError::UnexpectedReply(text.to_string())),
                },
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        };

        let _ = ws.close(None).await;
        self.log.record_conn(
            EventKind::Registered,
            local.port(),
            format!("Registered with seed {} ({} peer(s) listed)", seed, peers.len()),
        );
        Ok(peers)
    }

    async fn report_dead_inner(
        &self,
        seed: &PeerAddress,
        dead: &PeerAddress,
        reporter: &PeerAddress,
    ) -> Result<()> {
        let (mut ws, local) = dial(seed).await?;
        let frame = Frame::dead_node(dead.clone(), reporter.clone(), now_timestamp());

        ws.send(Message::text(frame.to_json()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let _ = ws.close(None).await;

        self.log.record_conn(
            EventKind::DeadNodeReported,
            local.port(),
            format!("Reported dead node {} to seed {}", dead, seed),
        );
        Ok(())
    }
}

#[async_trait]
impl SeedDirectory for WsSeedDirectory {
    async fn register(&self, seed: &PeerAddress, own: &PeerAddress) -> Result<Vec<PeerAddress>> {
        let result = self.bounded(self.register_inner(seed, own)).await;
        if let Err(e) = &result {
            self.log.record(
                EventKind::RegistrationFailed,
                format!("Could not register with seed {}: {}", seed, e),
            );
        }
        result
    }

    async fn report_dead(
        &self,
        seed: &PeerAddress,
        dead: &PeerAddress,
        reporter: &PeerAddress,
    ) -> Result<()> {
        self.bounded(self.report_dead_inner(seed, dead, reporter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::SeedServer;
    use gossip_core::{EventBus, NodeRole};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port).unwrap()
    }

    fn directory() -> WsSeedDirectory {
        let log = NodeLog::new(NodeRole::Peer, 9000, Arc::new(EventBus::new()));
        WsSeedDirectory::new(Duration::from_secs(2), log)
    }

    #[tokio::test]
    async fn test_register_and_report_dead() {
        let seed = SeedServer::start("127.0.0.1:0", Arc::new(EventBus::new())).await.unwrap();
        let client = directory();

        let peers = client.register(seed.address(), &addr(9000)).await.unwrap();
        assert_eq!(peers, vec![addr(9000)]);

        let peers = client.register(seed.address(), &addr(9001)).await.unwrap();
        assert_eq!(peers, vec![addr(9000), addr(9001)]);

        client
            .report_dead(seed.address(), &addr(9000), &addr(9001))
            .await
            .unwrap();

        // The report is fire-and-forget; wait for the seed to apply it
        for _ in 0..50 {
            if !seed.registry().contains(&addr(9000)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seed.registry().snapshot(), vec![addr(9001)]);
    }

    #[tokio::test]
    async fn test_register_unreachable_seed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = directory().register(&addr(port), &addr(9000)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_register_times_out_on_silent_seed() {
        // Accepts TCP but never completes the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let log = NodeLog::new(NodeRole::Peer, 9000, Arc::new(EventBus::new()));
        let client = WsSeedDirectory::new(Duration::from_millis(200), log);
        let err = client.register(&addr(port), &addr(9000)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(200)));
    }
}
