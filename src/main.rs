use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_client::{BridgeClient, ClientNotification};
use bridge_device::{DeviceConfig, DeviceManager, SerialOpener};
use bridge_server::ServerConfig;
use bridge_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;

#[derive(Parser)]
#[command(name = "button-bridge", version, about = "Expose an Arduino push button over WebSocket")]
struct Cli {
    /// Log output: `pretty` or `json`.
    #[arg(long, global = true, env = "BRIDGE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Default log level. RUST_LOG takes precedence when set.
    #[arg(long, global = true, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge server against a real serial port.
    Serve {
        #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "BRIDGE_PORT", default_value_t = 5001)]
        port: u16,

        #[arg(long, default_value_t = 9600)]
        baud: u32,
    },
    /// Connect to a running server, enable edge events and print them.
    Watch {
        #[arg(long, default_value = "ws://localhost:5001/ws")]
        url: String,

        /// Serial port for the server to open. Auto-detected when omitted.
        #[arg(long)]
        serial_port: Option<String>,

        /// Seconds to watch before exiting.
        #[arg(long, default_value_t = 300)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Command::Serve { host, port, baud } => serve(host, port, baud).await,
        Command::Watch {
            url,
            serial_port,
            duration,
        } => watch(&url, serial_port.as_deref(), Duration::from_secs(duration)).await,
    }
}

async fn serve(host: String, port: u16, baud: u32) -> anyhow::Result<()> {
    let device_config = DeviceConfig {
        baud_rate: baud,
        ..Default::default()
    };
    let device = Arc::new(DeviceManager::new(Arc::new(SerialOpener), device_config));
    let config = ServerConfig {
        host,
        port,
        ..Default::default()
    };

    let handle = bridge_server::start(config, device)
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.local_addr, "Button bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn watch(url: &str, serial_port: Option<&str>, duration: Duration) -> anyhow::Result<()> {
    let client = BridgeClient::connect(url)
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let mut notes = client.notifications();

    let servers = client.list_servers().await?;
    println!("Servers: {}", servers["servers"]);
    let info = client.read_server("arduino-button-monitor").await?;
    println!("Server info: {info}");
    let tools = client.list_tools().await?;
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .map(|tools| tools.iter().filter_map(|t| t["name"].as_str()).collect())
        .unwrap_or_default();
    println!("Tools: {}", names.join(", "));

    let connected = client
        .connect_device(serial_port)
        .await
        .context("failed to connect to the Arduino")?;
    println!("{}", connected["message"].as_str().unwrap_or("Connected"));
    client.subscribe_button_edges().await?;
    client.subscribe_notifications().await?;

    match client.get_button_state().await {
        Ok(state) => println!("Initial button state: {}", state["state"]),
        Err(e) => println!("Could not get initial state: {e}"),
    }
    println!("Watching button edges for {}s", duration.as_secs());

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut liveness = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => break,
            _ = liveness.tick() => {
                if !client.is_connected() {
                    tracing::warn!("Server connection closed");
                    break;
                }
            }
            note = notes.recv() => match note {
                Ok(ClientNotification::ButtonEvent { event, timestamp }) => println!("{timestamp:.3}  {event}"),
                Ok(ClientNotification::ConnectionLost { message }) => println!("Arduino connection lost: {message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Dropped notifications"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
