use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bridge_core::events::now_epoch_seconds;
use bridge_core::ConnectionId;
use bridge_device::DeviceManager;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::connections::{self, ConnectionRegistry};
use crate::event_bridge::{self, Notifier};
use crate::handlers::{self, HandlerState};
use crate::monitor::EventMonitor;
use crate::subscriptions::SubscriptionRegistry;
use crate::tools::{PROTOCOL_VERSION, SERVER_VERSION};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub ping_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Wire the registries, the event pipeline and the listener, then serve.
/// Returns once the socket is bound.
pub async fn start(config: ServerConfig, device: Arc<DeviceManager>) -> Result<ServerHandle, std::io::Error> {
    let subscriptions = Arc::new(SubscriptionRegistry::new());
    let connections = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let notifier = Arc::new(Notifier::new(Arc::clone(&subscriptions), Arc::clone(&connections)));

    // Monitor → fan-out channel
    let (event_tx, event_rx) = mpsc::channel(config.event_queue);
    let bridge = event_bridge::start_bridge(Arc::clone(&notifier), event_rx);
    let monitor = Arc::new(EventMonitor::new(
        Arc::clone(&device),
        Arc::clone(&subscriptions),
        event_tx,
        config.idle_poll,
        config.drain_interval,
    ));

    let cleanup = connections::start_cleanup_task(
        Arc::clone(&connections),
        config.cleanup_interval,
        config.client_timeout,
    );

    let handler_state = Arc::new(HandlerState {
        device,
        subscriptions,
        connections,
        notifier,
        monitor,
    });

    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let requests = TaskTracker::new();
    let processor = tokio::spawn(process_messages(
        msg_rx,
        Arc::clone(&handler_state),
        requests.clone(),
    ));

    let shutdown = CancellationToken::new();
    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        message_tx: msg_tx,
        ping_interval: config.ping_interval,
        shutdown: shutdown.clone(),
    };
    let router = build_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Button bridge server started");

    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server terminated with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        shutdown,
        state: handler_state,
        server,
        bridge,
        processor,
        requests,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// [`shutdown`](ServerHandle::shutdown).
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<HandlerState>,
    server: JoinHandle<()>,
    bridge: JoinHandle<()>,
    processor: JoinHandle<()>,
    requests: TaskTracker,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn connection_count(&self) -> usize {
        self.state.connections.count()
    }

    pub fn device(&self) -> &Arc<DeviceManager> {
        &self.state.device
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.state.subscriptions
    }

    /// Stop accepting, close every session, cancel the event monitor, let
    /// requests already dispatched finish, then release the device.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.state.monitor.shutdown().await;
        self.cleanup.abort();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task ended abnormally");
        }
        self.processor.abort();
        // Once the processor has stopped no further request can be spawned.
        let _ = self.processor.await;
        self.requests.close();
        if !self.requests.is_empty() {
            tracing::info!(in_flight = self.requests.len(), "Waiting for requests in flight");
        }
        self.requests.wait().await;
        self.bridge.abort();
        self.state.device.disconnect().await;
        tracing::info!("Button bridge server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let handlers = &state.handler_state;
    let (id, rx) = handlers.connections.register();
    handlers.subscriptions.register_connection(&id);
    tracing::info!(
        connection_id = %id,
        active = handlers.connections.count(),
        "WebSocket client connected"
    );

    connections::handle_ws_connection(
        socket,
        id.clone(),
        rx,
        Arc::clone(&handlers.connections),
        state.message_tx.clone(),
        state.ping_interval,
        state.shutdown.clone(),
    )
    .await;

    handlers.teardown(&id);
    tracing::info!(connection_id = %id, "WebSocket client disconnected");
}

#[derive(Serialize)]
struct ServerInfo {
    name: &'static str,
    version: &'static str,
    transport: &'static str,
    endpoint: &'static str,
    mcp_version: &'static str,
}

async fn info_handler() -> Json<ServerInfo> {
    Json(ServerInfo {
        name: "MCP Button Monitor WebSocket Server",
        version: SERVER_VERSION,
        transport: "WebSocket",
        endpoint: "/ws",
        mcp_version: PROTOCOL_VERSION,
    })
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    arduino_connected: bool,
    arduino_port: Option<String>,
    active_connections: usize,
    timestamp: f64,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    let handlers = &state.handler_state;
    Json(HealthReport {
        status: "healthy",
        arduino_connected: handlers.device.is_connected(),
        arduino_port: handlers.device.port(),
        active_connections: handlers.connections.count(),
        timestamp: now_epoch_seconds(),
    })
}

/// Drain inbound frames, answering each on its own task so a slow device
/// call never holds up requests from other connections.
async fn process_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    state: Arc<HandlerState>,
    requests: TaskTracker,
) {
    while let Some((conn, raw)) = rx.recv().await {
        let state = Arc::clone(&state);
        requests.spawn(async move {
            let response = handlers::handle_message(&state, &conn, &raw).await;
            match serde_json::to_string(&response) {
                Ok(json) => {
                    if !state.connections.send_to(&conn, json) {
                        tracing::debug!(connection_id = %conn, "Response dropped, connection gone");
                    }
                }
                Err(e) => tracing::error!(connection_id = %conn, error = %e, "Failed to encode response"),
            }
        });
    }
}
