use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::collections::VecDeque;

use bridge_core::{DeviceError, EdgeKind};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::link::{DeviceLink, PortInfo, PortOpener};

/// Upper bound on lines taken in one drain so a chatty device cannot hold
/// the link lock indefinitely. Remaining lines are picked up next cycle.
const MAX_DRAIN_LINES: usize = 256;

/// Edge lines set aside by command exchanges, waiting for the next drain.
const MAX_HELD_EDGES: usize = 256;

/// Point-in-time view of the device state.
#[derive(Clone, Debug)]
pub struct DeviceState {
    pub connected: bool,
    pub port: Option<String>,
    pub baud_rate: u32,
    pub io_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub last_heartbeat: Option<Instant>,
}

struct LinkSlot {
    link: Option<Box<dyn DeviceLink>>,
    last_heartbeat: Option<Instant>,
    // Unsolicited edges read while a command exchange owned the link.
    held: VecDeque<String>,
}

fn hold_edge(held: &mut VecDeque<String>, line: String) {
    if held.len() == MAX_HELD_EDGES {
        tracing::warn!("Held edge queue full, dropping oldest edge");
        held.pop_front();
    }
    tracing::debug!(line = %line, "Edge arrived during command exchange");
    held.push_back(line);
}

/// Owns the serial link and the one [`DeviceState`] of the process.
///
/// Every operation that touches the wire runs under `slot`. Callers that
/// need several operations to stay adjacent on the wire (send then read)
/// take a [`DeviceSession`] with [`DeviceManager::lock`].
pub struct DeviceManager {
    opener: Arc<dyn PortOpener>,
    config: DeviceConfig,
    slot: Mutex<LinkSlot>,
    // Mirrors of the slot for lock-free status reads.
    connected: AtomicBool,
    port: RwLock<Option<String>>,
}

impl DeviceManager {
    pub fn new(opener: Arc<dyn PortOpener>, config: DeviceConfig) -> Self {
        Self {
            opener,
            config,
            slot: Mutex::new(LinkSlot {
                link: None,
                last_heartbeat: None,
                held: VecDeque::new(),
            }),
            connected: AtomicBool::new(false),
            port: RwLock::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> Option<String> {
        self.port.read().clone()
    }

    /// Enumerate serial ports. Enumeration failure yields an empty list.
    pub fn list_available_ports(&self) -> Vec<PortInfo> {
        match self.opener.list_ports() {
            Ok(ports) => {
                let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
                tracing::info!(ports = ?names, "Available serial ports");
                ports
            }
            Err(e) => {
                tracing::error!(error = %e, "Error listing serial ports");
                Vec::new()
            }
        }
    }

    /// First port whose descriptor mentions a known vendor.
    pub fn auto_detect(&self) -> Option<String> {
        let found = self
            .list_available_ports()
            .into_iter()
            .find(|p| p.matches_any(&self.config.known_vendors))
            .map(|p| p.name);
        match &found {
            Some(port) => tracing::info!(port = %port, "Auto-detected Arduino port"),
            None => tracing::warn!("No Arduino port auto-detected"),
        }
        found
    }

    /// Take exclusive use of the link.
    pub async fn lock(&self) -> DeviceSession<'_> {
        DeviceSession {
            manager: self,
            slot: self.slot.lock().await,
        }
    }

    pub async fn connect(&self, port: Option<&str>) -> Result<String, DeviceError> {
        self.lock().await.connect(port).await
    }

    pub async fn disconnect(&self) {
        self.lock().await.disconnect();
    }

    pub async fn send_command(&self, text: &str) -> Result<(), DeviceError> {
        self.lock().await.send_command(text).await
    }

    pub async fn read_response(&self) -> Option<String> {
        self.lock().await.read_response().await
    }

    pub async fn check_health(&self) -> bool {
        self.lock().await.check_health().await
    }

    pub async fn state(&self) -> DeviceState {
        self.lock().await.state()
    }

    fn publish(&self, port: Option<String>) {
        self.connected.store(port.is_some(), Ordering::SeqCst);
        *self.port.write() = port;
    }
}

/// Exclusive hold on the link for the lifetime of the value.
pub struct DeviceSession<'a> {
    manager: &'a DeviceManager,
    slot: MutexGuard<'a, LinkSlot>,
}

impl DeviceSession<'_> {
    fn config(&self) -> &DeviceConfig {
        &self.manager.config
    }

    pub fn is_connected(&self) -> bool {
        self.slot.link.is_some()
    }

    pub fn state(&self) -> DeviceState {
        let config = self.config();
        DeviceState {
            connected: self.slot.link.is_some(),
            port: self.manager.port(),
            baud_rate: config.baud_rate,
            io_timeout: config.io_timeout,
            heartbeat_interval: config.heartbeat_interval,
            last_heartbeat: self.slot.last_heartbeat,
        }
    }

    /// Open `port` (or the auto-detected one), wait for the board to settle,
    /// and probe it. An existing link is torn down first.
    pub async fn connect(&mut self, port: Option<&str>) -> Result<String, DeviceError> {
        if self.slot.link.is_some() {
            self.disconnect();
        }

        let port = match port {
            Some(p) => p.to_string(),
            None => self.manager.auto_detect().ok_or_else(|| {
                tracing::error!("No Arduino port available");
                DeviceError::NoDeviceFound
            })?,
        };

        let mut link = self
            .manager
            .opener
            .open(&port, self.config())
            .inspect_err(|e| tracing::error!(port = %port, error = %e, "Failed to connect to Arduino"))?;

        tokio::time::sleep(self.config().settle_delay).await;

        if !test_communication(link.as_mut(), self.config()).await {
            drop(link);
            self.disconnect();
            return Err(DeviceError::HandshakeFailed { port });
        }

        self.slot.link = Some(link);
        self.slot.last_heartbeat = Some(Instant::now());
        self.manager.publish(Some(port.clone()));
        tracing::info!(port = %port, "Successfully connected to Arduino");
        Ok(port)
    }

    /// Close the link if open and reset to disconnected. Safe to repeat.
    pub fn disconnect(&mut self) {
        let was_open = self.slot.link.take().is_some();
        self.slot.last_heartbeat = None;
        self.slot.held.clear();
        self.manager.publish(None);
        if was_open {
            tracing::info!("Disconnected from Arduino");
        }
    }

    /// Clear stale input, write `text` plus a line terminator, flush.
    /// Does not wait for a reply.
    ///
    /// Edge lines already waiting are set aside for the next
    /// [`drain_lines`](Self::drain_lines); only other input is discarded.
    pub async fn send_command(&mut self, text: &str) -> Result<(), DeviceError> {
        let io_timeout = self.config().io_timeout;
        let slot = &mut *self.slot;
        let Some(link) = slot.link.as_mut() else {
            tracing::error!(command = text, "Arduino not connected");
            return Err(DeviceError::NotConnected);
        };

        loop {
            match link.has_input() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error polling Arduino input");
                    break;
                }
            }
            match link.read_line(io_timeout).await {
                Ok(Some(line)) if is_edge(&line) => hold_edge(&mut slot.held, line),
                Ok(Some(line)) => tracing::trace!(line = %line, "Discarding stale input"),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error reading stale input");
                    break;
                }
            }
        }
        let result = match link.clear_input() {
            Ok(()) => link.write_line(text).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            tracing::error!(command = text, error = %e, "Failed to send command");
            DeviceError::from(e)
        })
    }

    /// Wait the reply delay, then return one line if one is waiting.
    ///
    /// Edge lines that arrive ahead of the reply are set aside for the next
    /// drain rather than returned as the reply.
    pub async fn read_response(&mut self) -> Option<String> {
        let reply_delay = self.config().reply_delay;
        let io_timeout = self.config().io_timeout;
        let slot = &mut *self.slot;
        let link = slot.link.as_mut()?;

        tokio::time::sleep(reply_delay).await;
        match link.has_input() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read response");
                return None;
            }
        }
        loop {
            match link.read_line(io_timeout).await {
                Ok(Some(line)) if is_edge(&line) => hold_edge(&mut slot.held, line),
                Ok(reply) => return reply,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read response");
                    return None;
                }
            }
        }
    }

    /// Heartbeat. Within the interval this is free; past it, one `STATE`
    /// round-trip must come back numeric to refresh the stamp.
    pub async fn check_health(&mut self) -> bool {
        if self.slot.link.is_none() {
            return false;
        }

        let interval = self.config().heartbeat_interval;
        let due = self
            .slot
            .last_heartbeat
            .map_or(true, |at| at.elapsed() > interval);
        if !due {
            return true;
        }

        if let Err(e) = self.send_command("STATE").await {
            tracing::warn!(error = %e, "Arduino heartbeat failed - command failed");
            return false;
        }
        match self.read_response().await {
            Some(reply) if is_numeric(&reply) => {
                self.slot.last_heartbeat = Some(Instant::now());
                true
            }
            reply => {
                tracing::warn!(reply = ?reply, "Arduino heartbeat failed - invalid response");
                false
            }
        }
    }

    /// Take every line currently buffered on the link, preceded by any edges
    /// set aside by command exchanges since the last drain.
    ///
    /// A read error ends this drain and is logged; the caller simply tries
    /// again next cycle.
    pub async fn drain_lines(&mut self) -> Vec<String> {
        let io_timeout = self.config().io_timeout;
        let slot = &mut *self.slot;
        let Some(link) = slot.link.as_mut() else {
            return Vec::new();
        };

        let mut lines: Vec<String> = slot.held.drain(..).collect();
        while lines.len() < MAX_DRAIN_LINES {
            match link.has_input() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error polling Arduino input");
                    break;
                }
            }
            match link.read_line(io_timeout).await {
                Ok(Some(line)) => lines.push(line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error reading Arduino event");
                    break;
                }
            }
        }
        lines
    }
}

/// Write `STATE`, wait briefly, and accept any readable reply.
async fn test_communication(link: &mut dyn DeviceLink, config: &DeviceConfig) -> bool {
    if let Err(e) = link.write_line("STATE").await {
        tracing::error!(error = %e, "Arduino communication test failed");
        return false;
    }
    tokio::time::sleep(config.reply_delay).await;

    match link.has_input() {
        Ok(true) => match link.read_line(config.io_timeout).await {
            Ok(Some(reply)) => {
                tracing::info!(reply = %reply, "Arduino communication test successful");
                true
            }
            Ok(None) => {
                tracing::warn!("Arduino communication test failed - no response");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Arduino communication test failed");
                false
            }
        },
        Ok(false) => {
            tracing::warn!("Arduino communication test failed - no response");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, "Arduino communication test failed");
            false
        }
    }
}

fn is_edge(line: &str) -> bool {
    line.parse::<EdgeKind>().is_ok()
}

pub(crate) fn is_numeric(reply: &str) -> bool {
    !reply.is_empty() && reply.bytes().all(|b| b.is_ascii_digit())
}
