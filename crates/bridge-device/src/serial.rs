use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::DeviceError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{
    ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream,
};

use crate::config::DeviceConfig;
use crate::link::{take_line, DeviceLink, PortInfo, PortOpener};

const READ_CHUNK: usize = 256;

/// Opens real serial ports through `tokio-serial`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }

    fn open(&self, port: &str, config: &DeviceConfig) -> Result<Box<dyn DeviceLink>, DeviceError> {
        let stream = tokio_serial::new(port, config.baud_rate)
            .timeout(config.io_timeout)
            .open_native_async()
            .map_err(|e| DeviceError::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(SerialLink::new(stream)))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let description = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let parts: Vec<&str> = [usb.product.as_deref(), usb.manufacturer.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                if parts.is_empty() {
                    format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
                } else {
                    parts.join(" - ")
                }
            }
            SerialPortType::PciPort => "PCI serial port".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
            SerialPortType::Unknown => "n/a".to_string(),
        };
        PortInfo::new(info.port_name, description)
    }
}

/// Line-buffered wrapper over an open serial stream.
pub struct SerialLink {
    stream: SerialStream,
    buffer: Vec<u8>,
}

impl SerialLink {
    pub fn new(stream: SerialStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\n');
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.buffer.clear();
        self.stream.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn has_input(&mut self) -> io::Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        let waiting = self.stream.bytes_to_read().map_err(io::Error::from)?;
        Ok(waiting > 0)
    }

    async fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }
            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                // Like a timed-out readline: hand back whatever partial line arrived.
                Err(_) if self.buffer.is_empty() => return Ok(None),
                Err(_) => {
                    let partial = std::mem::take(&mut self.buffer);
                    return Ok(Some(String::from_utf8_lossy(&partial).trim().to_string()));
                }
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    ))
                }
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}
