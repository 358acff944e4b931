use std::time::Duration;

/// Static link configuration. One value per process; operations never take
/// per-call overrides.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub baud_rate: u32,
    /// Bounded read/write timeout on the open port.
    pub io_timeout: Duration,
    /// Pause after opening the port while the board resets.
    pub settle_delay: Duration,
    /// Pause between writing a command and looking for its reply.
    pub reply_delay: Duration,
    /// Minimum age of the last heartbeat before `check_health` probes again.
    pub heartbeat_interval: Duration,
    /// Lower-cased substrings that identify a compatible board in a port name or description.
    pub known_vendors: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            io_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            reply_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            known_vendors: ["arduino", "mkr", "wifi", "1010", "samd", "usbmodem"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
