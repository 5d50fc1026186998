//! Individual WebSocket connection management.
//!
//! Each connection is split into a read task and a write task. The read task
//! forwards inbound lines to a shared event channel; the write task drains a
//! per-connection queue. Queueing never blocks, so a slow or stalled remote
//! only backs up its own queue.

use gossip_core::{ConnectionId, Outbound, PeerAddress, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    client_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Maximum accepted line size (64KB). Gossip lines and control frames are far smaller.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text line arrived
    Line { id: ConnectionId, text: String },
    /// The read side ended. `graceful` is true only when the remote sent a
    /// close frame; resets and EOF without one are abrupt.
    Closed { id: ConnectionId, graceful: bool },
}

/// Queue handle the gossip engine forwards through.
#[derive(Clone)]
pub struct LineOutbound(mpsc::UnboundedSender<Message>);

impl Outbound for LineOutbound {
    fn push(&self, line: &str) -> bool {
        self.0.send(Message::text(line.to_string())).is_ok()
    }
}

/// Dial `target` and complete the WebSocket upgrade.
///
/// Returns the stream and our local socket address (whose port is the
/// OS-assigned ephemeral port).
pub async fn dial(
    target: &PeerAddress,
) -> Result<(WebSocketStream<TcpStream>, SocketAddr), TransportError> {
    let stream = TcpStream::connect((target.host(), target.port()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", target, e)))?;
    let local = stream
        .local_addr()
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", target, e)))?;
    let (ws, _) = client_async(target.ws_url(), stream)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", target, e)))?;
    Ok((ws, local))
}

/// A single WebSocket connection to another node.
pub struct Connection {
    pub id: ConnectionId,
    /// Ephemeral port of the socket (ours for outgoing, the remote's for incoming)
    pub ephemeral_port: u16,
    outbound: mpsc::UnboundedSender<Message>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap an upgraded stream, spawning its read and write tasks.
    pub fn spawn(
        id: ConnectionId,
        ephemeral_port: u16,
        ws: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (sink, stream) = ws.split();
        let (outbound, queue) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(Self::write_loop(id, sink, queue));
        let read_task = tokio::spawn(Self::read_loop(id, stream, event_tx));

        Self {
            id,
            ephemeral_port,
            outbound,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    /// Queue handle for the gossip engine.
    pub fn outbound(&self) -> LineOutbound {
        LineOutbound(self.outbound.clone())
    }

    /// Queue a text frame. Returns false if the write side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.send(Message::text(text.into())).is_ok()
    }

    /// Close gracefully: the write task sends a close frame and exits.
    pub fn close(&mut self) {
        let _ = self.outbound.send(Message::Close(None));
        self.write_task.take();
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }

    /// Drop the socket without a close frame.
    pub fn abort(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }

    async fn write_loop(
        id: ConnectionId,
        mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut queue: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = queue.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!("Write to connection {} failed: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
    }

    async fn read_loop(
        id: ConnectionId,
        mut stream: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let graceful = loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Non-UTF-8 frame from connection {}, dropping", id);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from connection {}", id);
                            break true;
                        }
                    };

                    if text.len() > MAX_LINE_SIZE {
                        warn!(
                            "Line from connection {} exceeds max size ({} > {}), dropping",
                            id,
                            text.len(),
                            MAX_LINE_SIZE
                        );
                        continue;
                    }

                    let _ = event_tx.send(ConnectionEvent::Line { id, text });
                }
                Some(Err(e)) => match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", id);
                        break true;
                    }
                    _ => {
                        error!("WebSocket error on connection {}: {}", id, e);
                        break false;
                    }
                },
                None => {
                    debug!("Connection {} stream ended", id);
                    break false;
                }
            }
        };

        let _ = event_tx.send(ConnectionEvent::Closed { id, graceful });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort();
    }
}
