use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::DeviceError;

use crate::config::DeviceConfig;

/// One enumerated serial port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Case-insensitive match of the descriptor text against known vendor substrings.
    pub fn matches_any(&self, needles: &[String]) -> bool {
        let haystack = format!("{} {}", self.description, self.name).to_lowercase();
        needles
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()))
    }
}

/// An open, line-oriented duplex link to the firmware.
#[async_trait]
pub trait DeviceLink: Send {
    /// Write `text` followed by `\n` and flush.
    async fn write_line(&mut self, text: &str) -> io::Result<()>;

    /// Discard anything already received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Whether at least one byte is waiting to be read.
    fn has_input(&mut self) -> io::Result<bool>;

    /// Read one line without its terminator. `Ok(None)` when nothing arrived
    /// within `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

/// Port enumeration and opening. The serial implementation talks to the OS;
/// tests substitute the scripted mock.
pub trait PortOpener: Send + Sync {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>>;

    fn open(&self, port: &str, config: &DeviceConfig) -> Result<Box<dyn DeviceLink>, DeviceError>;
}

/// Split the first complete line off `buffer`, trimming the terminator and
/// surrounding whitespace.
pub(crate) fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}
