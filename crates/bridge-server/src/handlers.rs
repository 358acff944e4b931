//! Request routing and tool execution.

use std::sync::Arc;

use bridge_core::rpc::{optional_str, RpcRequest, RpcResponse};
use bridge_core::{ButtonEvent, ConnectionId, DeviceError, ErrorCode, SubscriptionError};
use bridge_device::DeviceManager;
use chrono::Utc;
use serde_json::{json, Value};

use crate::connections::ConnectionRegistry;
use crate::event_bridge::Notifier;
use crate::monitor::EventMonitor;
use crate::subscriptions::{Capability, SubscriptionRegistry};
use crate::tools::{self, Tool, SERVER_NAME};

/// Shared state available to all handlers.
pub struct HandlerState {
    pub device: Arc<DeviceManager>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub notifier: Arc<Notifier>,
    pub monitor: Arc<EventMonitor>,
}

impl HandlerState {
    /// Forget a closed connection. Subscriptions go first so no fan-out can
    /// address it once its queue is gone.
    pub fn teardown(&self, id: &ConnectionId) {
        self.subscriptions.unsubscribe_all(id);
        self.connections.unregister(id);
        tracing::info!(connection_id = %id, "Connection torn down");
    }
}

/// Failure of a device-facing tool. Always answered as `tool_execution_error`.
#[derive(Debug, thiserror::Error)]
enum ToolError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("{0}")]
    Rejected(String),
}

/// Decode one text frame and answer it. Always yields exactly one response.
pub async fn handle_message(state: &Arc<HandlerState>, conn: &ConnectionId, raw: &str) -> RpcResponse {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(connection_id = %conn, error = %e, "Unparseable frame");
            return RpcResponse::parse_error();
        }
    };
    if !value.is_object() {
        return RpcResponse::invalid_request(None, "Request must be a JSON object");
    }
    let id = value.get("id").cloned().filter(|v| !v.is_null());
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(req) => req,
        Err(e) => return RpcResponse::invalid_request(id, format!("Malformed request: {e}")),
    };
    let Some(method) = request.method.as_deref() else {
        return RpcResponse::invalid_request(id, "Missing method");
    };

    tracing::info!(connection_id = %conn, method, id = ?id, "Processing request");
    let params = request.params_or_empty();
    dispatch(state, conn, method, &params, id).await
}

/// Route a method to its handler. Every method is also accepted under the
/// `mcp/` prefix.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    match method.strip_prefix("mcp/").unwrap_or(method) {
        "servers/list" => RpcResponse::success(id, json!({ "servers": [tools::server_summary()] })),
        "servers/read" => servers_read(params, id),
        "tools/list" => RpcResponse::success(id, tools::tool_catalogue()),
        "tools/call" => tools_call(state, conn, params, id).await,
        "tools/subscribe" => tools_subscribe(state, conn, params, id),
        "notifications/subscribe" => {
            state.subscriptions.subscribe_all(conn);
            RpcResponse::success(id, json!({ "subscribed": true }))
        }
        _ => {
            tracing::warn!(method, "Unknown method");
            RpcResponse::method_not_found(id, method)
        }
    }
}

fn servers_read(params: &Value, id: Option<Value>) -> RpcResponse {
    match optional_str(params, "name") {
        Some(SERVER_NAME) => RpcResponse::success(id, tools::server_details()),
        other => RpcResponse::error(
            id,
            ErrorCode::ServerNotFound,
            format!("Server not found: {}", other.unwrap_or("None")),
        ),
    }
}

async fn tools_call(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let name = optional_str(params, "name").unwrap_or("None");
    let Ok(tool) = name.parse::<Tool>() else {
        return RpcResponse::error(id, ErrorCode::ToolNotFound, format!("Unknown tool: {name}"));
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let outcome = match tool {
        Tool::GetButtonState => get_button_state(state).await,
        Tool::SubscribeButtonEdges => subscribe_button_edges(state, conn).await,
        Tool::ConnectArduino => connect_arduino(state, &arguments).await,
        Tool::DisconnectArduino => disconnect_arduino(state).await,
    };

    match outcome {
        Ok(result) => RpcResponse::success(id, result),
        Err(e) => {
            tracing::warn!(connection_id = %conn, tool = tool.name(), error = %e, "Tool execution failed");
            RpcResponse::error(id, ErrorCode::ToolExecutionError, e.to_string())
        }
    }
}

async fn get_button_state(state: &HandlerState) -> Result<Value, ToolError> {
    let mut session = state.device.lock().await;
    if !session.is_connected() {
        return Err(DeviceError::NotConnected.into());
    }
    if !session.check_health().await {
        drop(session);
        let lost = DeviceError::ConnectionLost;
        let reached = state.notifier.publish_connection_lost(&lost.to_string());
        tracing::warn!(reached, "Arduino health check failed");
        return Err(lost.into());
    }

    session.send_command("STATE").await?;
    let reply = session.read_response().await;
    drop(session);

    let level = reply
        .as_deref()
        .filter(|r| !r.is_empty() && r.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|r| r.parse::<u8>().ok());
    let Some(level) = level else {
        let shown = reply.unwrap_or_else(|| "None".into());
        return Err(DeviceError::InvalidResponse(shown).into());
    };

    let snapshot = ButtonEvent::snapshot(level, Utc::now());
    state.notifier.publish(&snapshot);
    Ok(json!({ "state": level, "timestamp": snapshot.timestamp() }))
}

async fn subscribe_button_edges(state: &HandlerState, conn: &ConnectionId) -> Result<Value, ToolError> {
    let mut session = state.device.lock().await;
    if !session.is_connected() {
        return Err(DeviceError::NotConnected.into());
    }
    session.send_command("SUBSCRIBE").await?;
    let reply = session.read_response().await;
    drop(session);

    if reply.as_deref() != Some("OK") {
        return Err(ToolError::Rejected(format!(
            "Failed to subscribe to button events: {}",
            reply.as_deref().unwrap_or("None")
        )));
    }

    state.subscriptions.subscribe_capability(Capability::ButtonEdges, conn)?;
    state.monitor.ensure_running();
    Ok(json!({
        "subscribed": true,
        "message": "Subscribed to button edge events",
    }))
}

async fn connect_arduino(state: &HandlerState, arguments: &Value) -> Result<Value, ToolError> {
    let port = state.device.connect(optional_str(arguments, "port")).await?;
    Ok(json!({
        "connected": true,
        "message": format!("Connected to Arduino on {port}"),
        "port": port,
    }))
}

async fn disconnect_arduino(state: &HandlerState) -> Result<Value, ToolError> {
    state.device.disconnect().await;
    Ok(json!({
        "disconnected": true,
        "message": "Disconnected from Arduino",
    }))
}

fn tools_subscribe(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let name = optional_str(params, "name").unwrap_or("None");
    match state.subscriptions.subscribe(name, conn) {
        Ok(_) => {
            if name == Capability::ButtonEdges.as_str() {
                state.monitor.ensure_running();
            }
            RpcResponse::success(id, json!({ "subscribed": true }))
        }
        Err(e) => RpcResponse::error(id, ErrorCode::from(&e), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use bridge_device::mock::{MockDevice, MockOpener};
    use bridge_device::{DeviceConfig, PortOpener};
    use tokio::sync::mpsc;

    use bridge_core::rpc::notifications::{BUTTON_STATE, CONNECTION_LOST};
    use bridge_core::EdgeKind;

    struct Rig {
        device: MockDevice,
        state: Arc<HandlerState>,
        events: mpsc::Receiver<ButtonEvent>,
    }

    fn rig_with(device: MockDevice, opener: Arc<dyn PortOpener>) -> Rig {
        let manager = Arc::new(DeviceManager::new(opener, DeviceConfig::default()));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(32));
        let notifier = Arc::new(Notifier::new(Arc::clone(&subscriptions), Arc::clone(&connections)));
        let (tx, rx) = mpsc::channel(16);
        let monitor = Arc::new(EventMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&subscriptions),
            tx,
            Duration::from_secs(1),
            Duration::from_millis(50),
        ));
        Rig {
            device,
            state: Arc::new(HandlerState {
                device: manager,
                subscriptions,
                connections,
                notifier,
                monitor,
            }),
            events: rx,
        }
    }

    fn rig() -> Rig {
        let device = MockDevice::new();
        let opener = Arc::new(MockOpener::new(device.clone()));
        rig_with(device, opener)
    }

    fn open_connection(state: &HandlerState) -> (ConnectionId, mpsc::Receiver<String>) {
        let (id, rx) = state.connections.register();
        state.subscriptions.register_connection(&id);
        (id, rx)
    }

    async fn call(state: &Arc<HandlerState>, conn: &ConnectionId, request: Value) -> Value {
        let resp = handle_message(state, conn, &request.to_string()).await;
        serde_json::to_value(resp).unwrap()
    }

    async fn call_tool(state: &Arc<HandlerState>, conn: &ConnectionId, id: &str, name: &str) -> Value {
        call(
            state,
            conn,
            json!({"id": id, "method": "tools/call", "params": {"name": name, "arguments": {}}}),
        )
        .await
    }

    fn error_code(resp: &Value) -> &str {
        resp["error"]["data"]["code"].as_str().unwrap_or_default()
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let resp = serde_json::to_value(handle_message(&rig.state, &conn, "{not json").await).unwrap();
        assert_eq!(error_code(&resp), "parse_error");
        assert_eq!(resp["error"]["message"], "Invalid JSON");
        assert_eq!(resp["error"]["code"], -32000);
        assert!(resp["id"].is_null());
    }

    #[tokio::test]
    async fn missing_method_is_invalid_request() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let resp = call(&rig.state, &conn, json!({"id": "7", "params": {}})).await;
        assert_eq!(error_code(&resp), "invalid_request");
        assert_eq!(resp["error"]["message"], "Missing method");
        assert_eq!(resp["id"], "7");
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let resp = call(&rig.state, &conn, json!({"id": "1", "method": "tools/explode"})).await;
        assert_eq!(error_code(&resp), "method_not_found");
        assert_eq!(resp["error"]["message"], "Unknown method: tools/explode");
    }

    #[tokio::test]
    async fn prefixed_and_bare_methods_agree() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let bare = call(&rig.state, &conn, json!({"id": "1", "method": "tools/list"})).await;
        let prefixed = call(&rig.state, &conn, json!({"id": "1", "method": "mcp/tools/list"})).await;
        assert_eq!(bare, prefixed);
        assert_eq!(bare["result"]["tools"].as_array().unwrap().len(), 4);
        assert_eq!(bare["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn servers_list_and_read() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let list = call(&rig.state, &conn, json!({"id": "1", "method": "servers/list"})).await;
        assert_eq!(list["result"]["servers"][0]["name"], SERVER_NAME);

        let read = call(
            &rig.state,
            &conn,
            json!({"id": "2", "method": "servers/read", "params": {"name": SERVER_NAME}}),
        )
        .await;
        assert_eq!(read["result"]["version"], "1.0.0");

        let missing = call(
            &rig.state,
            &conn,
            json!({"id": "3", "method": "servers/read", "params": {"name": "toaster"}}),
        )
        .await;
        assert_eq!(error_code(&missing), "server_not_found");
        assert_eq!(missing["error"]["message"], "Server not found: toaster");
    }

    #[tokio::test]
    async fn unknown_tool_touches_no_device() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let resp = call_tool(&rig.state, &conn, "4", "reboot_arduino").await;
        assert_eq!(error_code(&resp), "tool_not_found");
        assert_eq!(resp["id"], "4");
        assert!(rig.device.written().is_empty());
    }

    #[tokio::test]
    async fn connect_without_device_fails_as_tool_error() {
        let rig = rig_with(MockDevice::new(), Arc::new(MockOpener::empty()));
        let (conn, _rx) = open_connection(&rig.state);
        let resp = call_tool(&rig.state, &conn, "1", "connect_arduino").await;
        assert_eq!(resp["id"], "1");
        assert_eq!(error_code(&resp), "tool_execution_error");
        assert!(!resp["error"]["message"].as_str().unwrap().is_empty());
        assert!(resp.get("result").is_none());
    }

    #[tokio::test]
    async fn state_while_disconnected_says_so() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let resp = call_tool(&rig.state, &conn, "1", "get_button_state").await;
        assert_eq!(error_code(&resp), "tool_execution_error");
        assert!(resp["error"]["message"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_read_state() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let (watcher, mut watcher_rx) = open_connection(&rig.state);
        rig.state
            .subscriptions
            .subscribe_capability(Capability::ButtonState, &watcher)
            .unwrap();

        let connected = call(
            &rig.state,
            &conn,
            json!({"id": "1", "method": "tools/call",
                   "params": {"name": "connect_arduino", "arguments": {"port": "/dev/ttyACM0"}}}),
        )
        .await;
        assert_eq!(connected["result"]["connected"], true);
        assert_eq!(connected["result"]["port"], "/dev/ttyACM0");
        assert_eq!(connected["result"]["message"], "Connected to Arduino on /dev/ttyACM0");

        rig.device.set_level(1);
        let resp = call_tool(&rig.state, &conn, "2", "get_button_state").await;
        assert_eq!(resp["result"]["state"], 1);
        assert!(resp["result"]["timestamp"].is_f64());

        let note: Value = serde_json::from_str(&watcher_rx.try_recv().unwrap()).unwrap();
        assert_eq!(note["method"], BUTTON_STATE);
        assert_eq!(note["params"]["state"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_state_reply_is_invalid_response() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        rig.state.device.connect(None).await.unwrap();

        rig.device.set_state_reply(Some("hello"));
        let resp = call_tool(&rig.state, &conn, "1", "get_button_state").await;
        assert_eq!(error_code(&resp), "tool_execution_error");
        assert_eq!(resp["error"]["message"], "Invalid response from Arduino: hello");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_announces_connection_lost() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        let (listener, mut listener_rx) = open_connection(&rig.state);
        rig.state.subscriptions.subscribe_all(&listener);
        rig.state.device.connect(None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        rig.device.set_state_reply(Some("??"));

        let resp = call_tool(&rig.state, &conn, "1", "get_button_state").await;
        assert_eq!(resp["error"]["message"], "Arduino connection lost");

        let note: Value = serde_json::from_str(&listener_rx.try_recv().unwrap()).unwrap();
        assert_eq!(note["method"], CONNECTION_LOST);
        assert_eq!(note["params"]["message"], "Arduino connection lost");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_edges_registers_and_starts_monitor() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        rig.state.device.connect(None).await.unwrap();

        let resp = call_tool(&rig.state, &conn, "1", "subscribe_button_edges").await;
        assert_eq!(resp["result"]["subscribed"], true);
        assert_eq!(resp["result"]["message"], "Subscribed to button edge events");
        assert!(rig.state.subscriptions.is_subscribed(Capability::ButtonEdges, &conn));
        assert!(rig.state.monitor.is_running());

        // Repeating re-sends the firmware command but leaves the registry as is.
        call_tool(&rig.state, &conn, "2", "subscribe_button_edges").await;
        assert_eq!(rig.device.count_written("SUBSCRIBE"), 2);
        assert_eq!(rig.state.subscriptions.subscribers_of(Capability::ButtonEdges).len(), 1);

        rig.state.monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn state_reads_do_not_swallow_edges() {
        let mut rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        rig.state.device.connect(None).await.unwrap();
        call_tool(&rig.state, &conn, "1", "subscribe_button_edges").await;

        rig.device.emit("RISING");
        let resp = call_tool(&rig.state, &conn, "2", "get_button_state").await;
        assert!(resp["result"]["state"].is_u64());

        rig.device.interject_before_reply("FALLING");
        let resp = call_tool(&rig.state, &conn, "3", "get_button_state").await;
        assert!(resp["result"]["state"].is_u64(), "edge taken as reply: {resp}");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let first = rig.events.try_recv().unwrap();
        let second = rig.events.try_recv().unwrap();
        assert_eq!(first.kind, EdgeKind::Rising);
        assert_eq!(second.kind, EdgeKind::Falling);
        assert!(rig.events.try_recv().is_err());

        rig.state.monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_refusal_fails_the_subscription() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        rig.state.device.connect(None).await.unwrap();
        rig.device.set_subscribe_reply("NO");

        let resp = call_tool(&rig.state, &conn, "1", "subscribe_button_edges").await;
        assert_eq!(error_code(&resp), "tool_execution_error");
        assert_eq!(resp["error"]["message"], "Failed to subscribe to button events: NO");
        assert!(!rig.state.subscriptions.has_subscribers(Capability::ButtonEdges));
        assert!(!rig.state.monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        rig.state.device.connect(None).await.unwrap();

        for id in ["1", "2"] {
            let resp = call_tool(&rig.state, &conn, id, "disconnect_arduino").await;
            assert_eq!(resp["result"]["disconnected"], true);
            assert_eq!(resp["result"]["message"], "Disconnected from Arduino");
        }
        assert!(!rig.state.device.is_connected());
    }

    #[tokio::test]
    async fn tools_subscribe_validates_capability() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);

        let bad = call(
            &rig.state,
            &conn,
            json!({"id": "1", "method": "tools/subscribe", "params": {"name": "connect_arduino"}}),
        )
        .await;
        assert_eq!(error_code(&bad), "invalid_subscription");
        assert_eq!(bad["error"]["message"], "Cannot subscribe to tool: connect_arduino");

        let ok = call(
            &rig.state,
            &conn,
            json!({"id": "2", "method": "tools/subscribe", "params": {"name": "get_button_state"}}),
        )
        .await;
        assert_eq!(ok["result"]["subscribed"], true);
        assert!(rig.state.subscriptions.is_subscribed(Capability::ButtonState, &conn));
    }

    #[tokio::test]
    async fn teardown_removes_every_subscription() {
        let rig = rig();
        let (conn, _rx) = open_connection(&rig.state);
        call(&rig.state, &conn, json!({"id": "1", "method": "notifications/subscribe"})).await;
        call(
            &rig.state,
            &conn,
            json!({"id": "2", "method": "tools/subscribe", "params": {"name": "get_button_state"}}),
        )
        .await;

        rig.state.teardown(&conn);

        for capability in Capability::ALL {
            assert!(!rig.state.subscriptions.is_subscribed(capability, &conn));
        }
        assert!(rig.state.subscriptions.broadcast_subscribers().is_empty());
        assert!(!rig.state.connections.is_open(&conn));

        let late = call(
            &rig.state,
            &conn,
            json!({"id": "3", "method": "tools/subscribe", "params": {"name": "get_button_state"}}),
        )
        .await;
        assert_eq!(error_code(&late), "connection_lost");
    }
}
