//! Scripted stand-in for the button firmware.
//!
//! Answers `STATE` with the current level and `SUBSCRIBE` with `OK`, queues
//! unsolicited edge lines on demand, and records every command written so
//! tests can count round-trips.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::DeviceError;
use parking_lot::Mutex;

use crate::config::DeviceConfig;
use crate::link::{DeviceLink, PortInfo, PortOpener};

#[derive(Debug)]
struct MockState {
    level: u8,
    inbound: VecDeque<Result<String, io::ErrorKind>>,
    written: Vec<String>,
    silent: bool,
    state_reply: Option<String>,
    subscribe_reply: String,
    interjected: Option<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            level: 0,
            inbound: VecDeque::new(),
            written: Vec::new(),
            silent: false,
            state_reply: None,
            subscribe_reply: "OK".into(),
            interjected: None,
        }
    }
}

/// Shared handle to the simulated board. Clones observe the same device.
#[derive(Clone, Debug, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&self, level: u8) {
        self.state.lock().level = level;
    }

    /// Queue an unsolicited line, as the firmware does on an edge.
    pub fn emit(&self, line: &str) {
        self.state.lock().inbound.push_back(Ok(line.to_string()));
    }

    /// Make the next queued read fail with `kind`.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.state.lock().inbound.push_back(Err(kind));
    }

    /// A silent device never answers commands.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Override the reply to `STATE` (e.g. garbage to fail a heartbeat).
    pub fn set_state_reply(&self, reply: Option<&str>) {
        self.state.lock().state_reply = reply.map(String::from);
    }

    /// Queue `line` just ahead of the next command reply, as an edge that
    /// races a reply on the wire.
    pub fn interject_before_reply(&self, line: &str) {
        self.state.lock().interjected = Some(line.to_string());
    }

    pub fn set_subscribe_reply(&self, reply: &str) {
        self.state.lock().subscribe_reply = reply.to_string();
    }

    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// How many times `command` was written.
    pub fn count_written(&self, command: &str) -> usize {
        self.state
            .lock()
            .written
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    pub fn pending_lines(&self) -> usize {
        self.state.lock().inbound.len()
    }

    pub fn link(&self) -> MockLink {
        MockLink {
            device: self.clone(),
        }
    }
}

/// Link half handed to the manager.
pub struct MockLink {
    device: MockDevice,
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut state = self.device.state.lock();
        state.written.push(text.to_string());
        if state.silent {
            return Ok(());
        }
        let reply = match text {
            "STATE" => Some(
                state
                    .state_reply
                    .clone()
                    .unwrap_or_else(|| state.level.to_string()),
            ),
            "SUBSCRIBE" => Some(state.subscribe_reply.clone()),
            _ => None,
        };
        if let Some(reply) = reply {
            if let Some(line) = state.interjected.take() {
                state.inbound.push_back(Ok(line));
            }
            state.inbound.push_back(Ok(reply));
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.device.state.lock().inbound.clear();
        Ok(())
    }

    fn has_input(&mut self) -> io::Result<bool> {
        Ok(!self.device.state.lock().inbound.is_empty())
    }

    async fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let next = self.device.state.lock().inbound.pop_front();
        match next {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(kind)) => Err(io::Error::new(kind, "injected read failure")),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }
}

/// Opener that enumerates a fixed port list and hands out links to one [`MockDevice`].
pub struct MockOpener {
    device: MockDevice,
    ports: Vec<PortInfo>,
    opens: AtomicUsize,
}

impl MockOpener {
    /// One board on `/dev/ttyACM0` described as an Arduino.
    pub fn new(device: MockDevice) -> Self {
        Self::with_ports(
            device,
            vec![PortInfo::new("/dev/ttyACM0", "Arduino MKR WiFi 1010")],
        )
    }

    pub fn with_ports(device: MockDevice, ports: Vec<PortInfo>) -> Self {
        Self {
            device,
            ports,
            opens: AtomicUsize::new(0),
        }
    }

    /// No ports at all.
    pub fn empty() -> Self {
        Self::with_ports(MockDevice::new(), Vec::new())
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl PortOpener for MockOpener {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        Ok(self.ports.clone())
    }

    fn open(&self, port: &str, _config: &DeviceConfig) -> Result<Box<dyn DeviceLink>, DeviceError> {
        if !self.ports.iter().any(|p| p.name == port) {
            return Err(DeviceError::OpenFailed {
                port: port.to_string(),
                reason: "No such file or directory".into(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.device.link()))
    }
}
