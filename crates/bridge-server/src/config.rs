use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound messages buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Capacity of the monitor → fan-out event channel.
    pub event_queue: usize,
    /// Monitor sleep while the device is down or nobody listens for edges.
    pub idle_poll: Duration,
    /// Monitor sleep between drains.
    pub drain_interval: Duration,
    pub ping_interval: Duration,
    /// Connections silent for longer than this are closed.
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5001,
            max_send_queue: 256,
            event_queue: 1024,
            idle_poll: Duration::from_secs(1),
            drain_interval: Duration::from_millis(50),
            ping_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}
