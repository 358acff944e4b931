//! Wire envelopes shared by the server dispatcher and the client.
//!
//! Requests are `{id, method, params}`, responses `{id, result}` or
//! `{id, error: {code, message, data: {code}}}`, notifications
//! `{method, params}` without an id. Every outgoing envelope carries
//! `"jsonrpc": "2.0"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorCode;

pub const JSONRPC_VERSION: &str = "2.0";

/// Numeric code carried beside the string code on every error object.
pub const SERVER_ERROR: i32 = -32000;

/// Server-initiated notification methods.
pub mod notifications {
    pub const BUTTON_EVENT: &str = "button_event";
    pub const BUTTON_STATE: &str = "button_state";
    pub const CONNECTION_LOST: &str = "arduino_connection_lost";
}

/// Request envelope. `method` is optional here so a missing method can be
/// answered with `invalid_request` instead of a parse failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(Value::String(id.into())),
            method: Some(method.into()),
            params: Some(params),
        }
    }

    /// Params as an object, defaulting to `{}` when absent or null.
    pub fn params_or_empty(&self) -> Value {
        match &self.params {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(p) => p.clone(),
        }
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default = "default_error_code")]
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

fn default_error_code() -> i32 {
    SERVER_ERROR
}

impl RpcError {
    /// Machine-readable code, `internal_error` if the peer sent none.
    pub fn error_code(&self) -> ErrorCode {
        self.data
            .as_ref()
            .map(|d| ErrorCode::from_wire(&d.code))
            .unwrap_or(ErrorCode::InternalError)
    }
}

/// Response envelope. Exactly one of `result`/`error` is set by the
/// constructors; `id` serializes as `null` when the request id was unknown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcError {
                code: SERVER_ERROR,
                message: message.into(),
                data: Some(ErrorData {
                    code: code.as_str().to_string(),
                }),
            }),
        }
    }

    pub fn parse_error() -> Self {
        Self::error(None, ErrorCode::ParseError, "Invalid JSON")
    }

    pub fn invalid_request(id: Option<Value>, msg: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InvalidRequest, msg)
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, ErrorCode::MethodNotFound, format!("Unknown method: {method}"))
    }

    /// Collapse into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Server-initiated message with no id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcNotification {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Any decoded message.
#[derive(Clone, Debug)]
pub enum Envelope {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("not a protocol envelope: {0}")]
    Shape(String),
}

impl Envelope {
    /// Decode one text frame.
    ///
    /// An object with a non-null `id` and a `result` or `error` is a
    /// response; one with `method` and no id is a notification; anything
    /// else with an object shape is a request.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Some(obj) = value.as_object() else {
            return Err(EnvelopeError::Shape("expected a JSON object".into()));
        };

        let has_id = obj.get("id").is_some_and(|v| !v.is_null());
        let is_reply = obj.contains_key("result") || obj.contains_key("error");

        if has_id && is_reply {
            let resp: RpcResponse = serde_json::from_value(value)
                .map_err(|e| EnvelopeError::Shape(e.to_string()))?;
            return Ok(Self::Response(resp));
        }
        if !has_id && obj.get("method").is_some_and(Value::is_string) {
            let note: RpcNotification = serde_json::from_value(value)
                .map_err(|e| EnvelopeError::Shape(e.to_string()))?;
            return Ok(Self::Notification(note));
        }

        let req: RpcRequest =
            serde_json::from_value(value).map_err(|e| EnvelopeError::Shape(e.to_string()))?;
        Ok(Self::Request(req))
    }
}

/// Extract an optional string param.
pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}
