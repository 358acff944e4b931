//! End-to-end tests: a real server over a scripted device, driven by real
//! WebSocket clients.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bridge_client::{BridgeClient, ClientError, ClientNotification};
use bridge_core::events::now_epoch_seconds;
use bridge_core::{EdgeKind, ErrorCode};
use bridge_device::mock::{MockDevice, MockOpener};
use bridge_device::{DeviceConfig, DeviceManager, PortOpener};
use bridge_server::{Capability, ServerConfig, ServerHandle};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    handle: ServerHandle,
    device: MockDevice,
    ws_url: String,
    http_url: String,
}

fn fast_device_config() -> DeviceConfig {
    DeviceConfig {
        io_timeout: Duration::from_millis(200),
        settle_delay: Duration::from_millis(20),
        reply_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn boot_with(device: MockDevice, opener: Arc<dyn PortOpener>) -> TestServer {
    let manager = Arc::new(DeviceManager::new(opener, fast_device_config()));
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        idle_poll: Duration::from_millis(50),
        drain_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let handle = bridge_server::start(config, manager).await.unwrap();
    let addr = handle.local_addr;
    TestServer {
        handle,
        device,
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
    }
}

async fn boot() -> TestServer {
    let device = MockDevice::new();
    let opener = Arc::new(MockOpener::new(device.clone()));
    boot_with(device, opener).await
}

async fn raw_connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_notification(rx: &mut tokio::sync::broadcast::Receiver<ClientNotification>) -> ClientNotification {
    timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn discovery_then_device_tools() {
    let server = boot().await;
    let client = BridgeClient::connect(&server.ws_url).await.unwrap();

    let servers = client.list_servers().await.unwrap();
    assert_eq!(servers["servers"][0]["name"], "arduino-button-monitor");
    let info = client.read_server("arduino-button-monitor").await.unwrap();
    assert_eq!(info["version"], "1.0.0");
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools["tools"].as_array().unwrap().len(), 4);

    let connected = client.connect_device(None).await.unwrap();
    assert_eq!(connected["connected"], true);
    assert_eq!(connected["port"], "/dev/ttyACM0");

    let state = client.get_button_state().await.unwrap();
    assert_eq!(state["state"], 0);
    server.device.set_level(1);
    let state = client.get_button_state().await.unwrap();
    assert_eq!(state["state"], 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn edges_arrive_in_order() {
    let server = boot().await;
    let client = BridgeClient::connect(&server.ws_url).await.unwrap();
    let mut notes = client.notifications();

    client.connect_device(None).await.unwrap();
    let subscribed = client.subscribe_button_edges().await.unwrap();
    assert_eq!(subscribed["subscribed"], true);

    let before = now_epoch_seconds();
    server.device.emit("RISING");
    server.device.emit("FALLING");

    let ClientNotification::ButtonEvent { event: first, timestamp: t1 } = next_notification(&mut notes).await else {
        panic!("expected a button event");
    };
    let ClientNotification::ButtonEvent { event: second, timestamp: t2 } = next_notification(&mut notes).await else {
        panic!("expected a button event");
    };
    let after = now_epoch_seconds();

    assert_eq!(first, EdgeKind::Rising);
    assert_eq!(second, EdgeKind::Falling);
    assert!(before <= t1 && t1 <= t2 && t2 <= after);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_never_reaches_the_device() {
    let server = boot().await;
    let mut ws = raw_connect(&server.ws_url).await;

    send_json(
        &mut ws,
        json!({"id": "9", "method": "tools/call", "params": {"name": "self_destruct", "arguments": {}}}),
    )
    .await;
    let resp = recv_json(&mut ws).await;
    assert_eq!(resp["id"], "9");
    assert_eq!(resp["error"]["data"]["code"], "tool_not_found");
    assert!(server.device.written().is_empty());

    server.handle.shutdown().await;
}

#[tokio::test]
async fn connect_with_no_device_present() {
    let server = boot_with(MockDevice::new(), Arc::new(MockOpener::empty())).await;
    let mut ws = raw_connect(&server.ws_url).await;

    send_json(
        &mut ws,
        json!({"id": "1", "method": "tools/call", "params": {"name": "connect_arduino", "arguments": {}}}),
    )
    .await;
    let resp = recv_json(&mut ws).await;
    assert_eq!(resp["id"], "1");
    assert_eq!(resp["error"]["data"]["code"], "tool_execution_error");
    assert!(resp["error"]["message"].is_string());
    assert!(resp.get("result").is_none());

    server.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_get_typed_errors() {
    let server = boot().await;
    let mut ws = raw_connect(&server.ws_url).await;

    ws.send(Message::Text("{oops".into())).await.unwrap();
    let resp = recv_json(&mut ws).await;
    assert_eq!(resp["error"]["data"]["code"], "parse_error");
    assert!(resp["id"].is_null());

    send_json(&mut ws, json!({"id": "2", "params": {}})).await;
    let resp = recv_json(&mut ws).await;
    assert_eq!(resp["id"], "2");
    assert_eq!(resp["error"]["data"]["code"], "invalid_request");

    send_json(&mut ws, json!({"id": "3", "method": "mcp/tools/teleport"})).await;
    let resp = recv_json(&mut ws).await;
    assert_eq!(resp["error"]["data"]["code"], "method_not_found");

    server.handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_twice_succeeds() {
    let server = boot().await;
    let client = BridgeClient::connect(&server.ws_url).await.unwrap();
    client.connect_device(None).await.unwrap();

    for _ in 0..2 {
        let resp = client.disconnect_device().await.unwrap();
        assert_eq!(resp["disconnected"], true);
    }
    assert!(!server.handle.device().is_connected());

    let err = client.get_button_state().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ToolExecutionError);
    assert!(err.to_string().contains("not connected"));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_are_answered_by_id() {
    let server = boot().await;
    let mut ws = raw_connect(&server.ws_url).await;

    for id in ["1", "2", "3"] {
        send_json(&mut ws, json!({"id": id, "method": "tools/list", "params": {}})).await;
    }
    let mut seen = BTreeSet::new();
    for _ in 0..3 {
        let resp = recv_json(&mut ws).await;
        assert!(resp.get("error").is_none());
        seen.insert(resp["id"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, BTreeSet::from(["1".to_string(), "2".into(), "3".into()]));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn closed_connection_leaves_every_subscription() {
    let server = boot().await;
    let leaving = BridgeClient::connect(&server.ws_url).await.unwrap();
    let staying = BridgeClient::connect(&server.ws_url).await.unwrap();
    let mut notes = staying.notifications();

    leaving.connect_device(None).await.unwrap();
    leaving.subscribe_button_edges().await.unwrap();
    leaving.subscribe_tool("get_button_state").await.unwrap();
    leaving.subscribe_notifications().await.unwrap();
    staying.subscribe_button_edges().await.unwrap();
    wait_until(|| server.handle.connection_count() == 2).await;

    leaving.disconnect().await;
    wait_until(|| server.handle.connection_count() == 1).await;

    let subscriptions = server.handle.subscriptions();
    assert_eq!(subscriptions.subscribers_of(Capability::ButtonEdges).len(), 1);
    assert!(subscriptions.subscribers_of(Capability::ButtonState).is_empty());
    assert!(subscriptions.broadcast_subscribers().is_empty());

    // The monitor keeps serving whoever is left.
    server.device.emit("RISING");
    assert!(matches!(
        next_notification(&mut notes).await,
        ClientNotification::ButtonEvent { event: EdgeKind::Rising, .. }
    ));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_device_and_connections() {
    let server = boot().await;
    let client = BridgeClient::connect(&server.ws_url).await.unwrap();
    client.connect_device(Some("/dev/ttyACM0")).await.unwrap();
    wait_until(|| server.handle.connection_count() == 1).await;

    let body: Value = reqwest::get(format!("{}/health", server.http_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["arduino_connected"], true);
    assert_eq!(body["arduino_port"], "/dev/ttyACM0");
    assert_eq!(body["active_connections"], 1);
    assert!(body["timestamp"].is_f64());

    server.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_clients_and_device() {
    let server = boot().await;
    let client = BridgeClient::connect(&server.ws_url).await.unwrap();
    client.connect_device(None).await.unwrap();
    client.subscribe_button_edges().await.unwrap();

    let device = Arc::clone(server.handle.device());
    server.handle.shutdown().await;

    assert!(!device.is_connected());
    wait_until(|| !client.is_connected()).await;
    let err = client.list_tools().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost), "got {err:?}");
}

#[tokio::test]
async fn shutdown_waits_for_a_connect_in_flight() {
    let server = boot().await;
    let mut ws = raw_connect(&server.ws_url).await;
    send_json(
        &mut ws,
        json!({"id": "1", "method": "tools/call", "params": {"name": "connect_arduino", "arguments": {}}}),
    )
    .await;
    wait_until(|| server.device.count_written("STATE") > 0).await;

    let device = Arc::clone(server.handle.device());
    server.handle.shutdown().await;
    assert!(!device.is_connected());

    // Nothing dispatched before shutdown may reopen the port afterwards.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!device.is_connected());
}
