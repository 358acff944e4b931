//! Sole owner of the serial link to the button firmware.
//!
//! All device I/O goes through [`DeviceManager`], whose lock serialises
//! probes, command/reply exchanges, health checks and event drains so that
//! replies are never attributed to the wrong caller.

mod config;
mod link;
mod manager;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod serial;

pub use config::DeviceConfig;
pub use link::{DeviceLink, PortInfo, PortOpener};
pub use manager::{DeviceManager, DeviceSession, DeviceState};
pub use serial::{SerialLink, SerialOpener};
