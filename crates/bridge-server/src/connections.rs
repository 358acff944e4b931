use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bridge_core::ConnectionId;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One open WebSocket session. Owned by the registry; everything else
/// refers to it by [`ConnectionId`].
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    close: CancellationToken,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            close: CancellationToken::new(),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    /// Ask the session loop to end; its teardown then runs as usual.
    pub fn request_close(&self) {
        self.close.cancel();
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all open connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID + outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Arc::new(Connection::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.request_close();
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Queue a message for one connection without waiting. A full queue
    /// drops the message.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close connections that haven't answered pings within `timeout`.
    pub fn close_dead_connections(&self, timeout: Duration) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            if !entry.value().is_alive(timeout) {
                entry.value().request_close();
                closed += 1;
                tracing::info!(connection_id = %entry.key(), "Closing unresponsive connection");
            }
        }
        closed
    }
}

/// Pump one WebSocket: outbound queue → socket with periodic pings,
/// socket text frames → `on_message`. Returns when the peer goes away, the
/// connection is asked to close, or `shutdown` fires. The caller runs teardown.
pub async fn handle_ws_connection(
    socket: WebSocket,
    id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let Some(conn) = registry.get(&id) else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_id = id.clone();
    let reader_conn = Arc::clone(&conn);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
        _ = conn.close.cancelled() => {},
        _ = shutdown.cancelled() => {},
    }
    reader.abort();
    writer.abort();
}

/// Periodically close connections that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let closed = registry.close_dead_connections(timeout);
            if closed > 0 {
                tracing::info!(closed, "Dead connection cleanup");
            }
        }
    })
}
