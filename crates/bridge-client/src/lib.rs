//! WebSocket client for the button bridge.

pub mod client;
pub mod error;

pub use client::{BridgeClient, ClientNotification, DEFAULT_REQUEST_TIMEOUT};
pub use error::ClientError;
