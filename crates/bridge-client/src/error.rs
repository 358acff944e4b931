use bridge_core::ErrorCode;

/// Failures surfaced to callers of [`BridgeClient`](crate::BridgeClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request {method} timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("connection to server lost")]
    ConnectionLost,

    /// The server answered with an error envelope.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Machine-readable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Self::ConnectionLost | Self::Connect { .. } => ErrorCode::ConnectionLost,
            Self::Remote { code, .. } => *code,
            Self::Serialization(_) => ErrorCode::InternalError,
        }
    }
}
