use std::fmt;

use serde::{Deserialize, Serialize};

/// Failures raised by the device connection manager.
///
/// None of these escape to a remote caller unformatted; the dispatcher wraps
/// them as `tool_execution_error` carrying the display text.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("No Arduino port available")]
    NoDeviceFound,

    #[error("Arduino on {port} did not answer the communication test")]
    HandshakeFailed { port: String },

    #[error("Arduino not connected. Use connect_arduino first.")]
    NotConnected,

    #[error("failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("serial I/O error: {0}")]
    Io(String),

    #[error("Invalid response from Arduino: {0}")]
    InvalidResponse(String),

    #[error("Arduino connection lost")]
    ConnectionLost,
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

/// Failures raised by the subscription registry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Cannot subscribe to tool: {0}")]
    InvalidSubscription(String),

    #[error("connection {0} is closing")]
    ConnectionClosed(String),
}

/// Stable machine-readable code carried in `error.data.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    ServerNotFound,
    ToolNotFound,
    InvalidSubscription,
    ToolExecutionError,
    InternalError,
    RequestTimeout,
    ConnectionLost,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::InvalidRequest => "invalid_request",
            Self::MethodNotFound => "method_not_found",
            Self::ServerNotFound => "server_not_found",
            Self::ToolNotFound => "tool_not_found",
            Self::InvalidSubscription => "invalid_subscription",
            Self::ToolExecutionError => "tool_execution_error",
            Self::InternalError => "internal_error",
            Self::RequestTimeout => "request_timeout",
            Self::ConnectionLost => "connection_lost",
        }
    }

    /// Parse a wire code. Unknown codes map to `InternalError`.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "parse_error" => Self::ParseError,
            "invalid_request" => Self::InvalidRequest,
            "method_not_found" => Self::MethodNotFound,
            "server_not_found" => Self::ServerNotFound,
            "tool_not_found" => Self::ToolNotFound,
            "invalid_subscription" => Self::InvalidSubscription,
            "tool_execution_error" => Self::ToolExecutionError,
            "request_timeout" => Self::RequestTimeout,
            "connection_lost" => Self::ConnectionLost,
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SubscriptionError> for ErrorCode {
    fn from(e: &SubscriptionError) -> Self {
        match e {
            SubscriptionError::InvalidSubscription(_) => Self::InvalidSubscription,
            SubscriptionError::ConnectionClosed(_) => Self::ConnectionLost,
        }
    }
}
