//! Request/response correlation over one WebSocket.
//!
//! Each request takes the next id from a counter and parks a oneshot in the
//! pending table. The reader task resolves entries as responses arrive and
//! fails every remaining entry with [`ClientError::ConnectionLost`] once the
//! socket closes. Notifications are republished on a broadcast channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_core::rpc::notifications::{BUTTON_EVENT, BUTTON_STATE, CONNECTION_LOST};
use bridge_core::rpc::{Envelope, RpcNotification, RpcRequest, RpcResponse};
use bridge_core::EdgeKind;
use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ClientError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingTx = oneshot::Sender<Result<Value, ClientError>>;
type PendingMap = Arc<DashMap<String, PendingTx>>;

/// Server-initiated message, decoded.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotification {
    ButtonEvent { event: EdgeKind, timestamp: f64 },
    ButtonState { state: u8, timestamp: f64 },
    ConnectionLost { message: String },
    Other { method: String, params: Value },
}

impl ClientNotification {
    fn from_envelope(note: RpcNotification) -> Self {
        let params = &note.params;
        let timestamp = params.get("timestamp").and_then(Value::as_f64);
        match note.method.as_str() {
            BUTTON_EVENT => {
                let event = params
                    .get("event")
                    .and_then(Value::as_str)
                    .and_then(|e| e.parse::<EdgeKind>().ok());
                if let (Some(event), Some(timestamp)) = (event, timestamp) {
                    return Self::ButtonEvent { event, timestamp };
                }
            }
            BUTTON_STATE => {
                let state = params
                    .get("state")
                    .and_then(Value::as_u64)
                    .and_then(|s| u8::try_from(s).ok());
                if let (Some(state), Some(timestamp)) = (state, timestamp) {
                    return Self::ButtonState { state, timestamp };
                }
            }
            CONNECTION_LOST => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Arduino connection lost");
                return Self::ConnectionLost {
                    message: message.to_string(),
                };
            }
            _ => {}
        }
        Self::Other {
            method: note.method,
            params: note.params,
        }
    }
}

/// One connection to a bridge server.
pub struct BridgeClient {
    url: String,
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    notifications: broadcast::Sender<ClientNotification>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BridgeClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with_timeout(url, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(url: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url).await.map_err(|e| ClientError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (mut sink, stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let pending: PendingMap = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));
        let (notifications, _) = broadcast::channel(256);

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "WebSocket send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&pending),
            Arc::clone(&connected),
            notifications.clone(),
        ));

        tracing::info!(url, "Connected to bridge server");
        Ok(Self {
            url: url.to_string(),
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            notifications,
            request_timeout,
            reader,
            writer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Receive every notification arriving after this call.
    pub fn notifications(&self) -> broadcast::Receiver<ClientNotification> {
        self.notifications.subscribe()
    }

    /// Send one request and wait for its response, the timeout, or the
    /// connection closing, whichever comes first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let text = serde_json::to_string(&RpcRequest::new(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(id.clone(), tx);
        // Checked after insertion: the reader clears the table only after
        // flipping the flag, so one of the two always sees the other.
        if !self.is_connected() || self.outbound.send(Message::Text(text.into())).await.is_err() {
            let _ = self.pending.remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                let _ = self.pending.remove(&id);
                tracing::warn!(method, id, "Request timed out");
                Err(ClientError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub async fn list_servers(&self) -> Result<Value, ClientError> {
        self.request("servers/list", json!({})).await
    }

    pub async fn read_server(&self, name: &str) -> Result<Value, ClientError> {
        self.request("servers/read", json!({ "name": name })).await
    }

    pub async fn list_tools(&self) -> Result<Value, ClientError> {
        self.request("tools/list", json!({})).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ClientError> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn subscribe_tool(&self, name: &str) -> Result<Value, ClientError> {
        self.request("tools/subscribe", json!({ "name": name })).await
    }

    pub async fn subscribe_notifications(&self) -> Result<Value, ClientError> {
        self.request("notifications/subscribe", json!({})).await
    }

    pub async fn connect_device(&self, port: Option<&str>) -> Result<Value, ClientError> {
        let arguments = match port {
            Some(port) => json!({ "port": port }),
            None => json!({}),
        };
        self.call_tool("connect_arduino", arguments).await
    }

    pub async fn disconnect_device(&self) -> Result<Value, ClientError> {
        self.call_tool("disconnect_arduino", json!({})).await
    }

    pub async fn get_button_state(&self) -> Result<Value, ClientError> {
        self.call_tool("get_button_state", json!({})).await
    }

    pub async fn subscribe_button_edges(&self) -> Result<Value, ClientError> {
        self.call_tool("subscribe_button_edges", json!({})).await
    }

    /// Close the socket. Requests still in flight fail with `ConnectionLost`.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None)).await;
        fail_pending(&self.pending);
        tracing::info!(url = %self.url, "Disconnected from bridge server");
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<S>(
    mut stream: S,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    notifications: broadcast::Sender<ClientNotification>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                break;
            }
        };
        match Envelope::parse(text.as_str()) {
            Ok(Envelope::Response(resp)) => resolve(&pending, resp),
            Ok(Envelope::Notification(note)) => {
                tracing::debug!(method = %note.method, "Notification received");
                let _ = notifications.send(ClientNotification::from_envelope(note));
            }
            Ok(Envelope::Request(req)) => {
                tracing::debug!(method = ?req.method, "Ignoring unsolicited message");
            }
            Err(e) => tracing::warn!(error = %e, "Invalid message from server"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending);
    tracing::info!("Bridge server connection closed");
}

fn resolve(pending: &DashMap<String, PendingTx>, resp: RpcResponse) {
    let Some(key) = resp.id.as_ref().map(id_key) else {
        return;
    };
    let Some((_, tx)) = pending.remove(&key) else {
        tracing::debug!(id = %key, "Response for unknown or expired request");
        return;
    };
    let outcome = resp.into_outcome().map_err(|err| ClientError::Remote {
        code: err.error_code(),
        message: err.message,
    });
    let _ = tx.send(outcome);
}

fn fail_pending(pending: &DashMap<String, PendingTx>) {
    let keys: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx.send(Err(ClientError::ConnectionLost));
        }
    }
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
