//! Fixed server descriptor and tool catalogue.

use std::str::FromStr;

use serde_json::{json, Value};

pub const SERVER_NAME: &str = "arduino-button-monitor";
pub const SERVER_DESCRIPTION: &str = "MCP server for monitoring Arduino button state and events";
pub const SERVER_VERSION: &str = "1.0.0";
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// The device-facing tools reachable through `tools/call`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tool {
    GetButtonState,
    SubscribeButtonEdges,
    ConnectArduino,
    DisconnectArduino,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::GetButtonState,
        Tool::SubscribeButtonEdges,
        Tool::ConnectArduino,
        Tool::DisconnectArduino,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetButtonState => "get_button_state",
            Self::SubscribeButtonEdges => "subscribe_button_edges",
            Self::ConnectArduino => "connect_arduino",
            Self::DisconnectArduino => "disconnect_arduino",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::GetButtonState => "Get the current state of the button (0 or 1)",
            Self::SubscribeButtonEdges => "Subscribe to button edge events (RISING/FALLING)",
            Self::ConnectArduino => "Connect to Arduino on specified or auto-detected port",
            Self::DisconnectArduino => "Disconnect from Arduino",
        }
    }

    pub fn input_schema(&self) -> Value {
        let properties = match self {
            Self::ConnectArduino => json!({
                "port": {
                    "type": "string",
                    "description": "Serial port name (optional, will auto-detect if not specified)"
                }
            }),
            _ => json!({}),
        };
        json!({
            "type": "object",
            "properties": properties,
            "required": []
        })
    }

    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "inputSchema": self.input_schema(),
        })
    }
}

impl FromStr for Tool {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.name() == s).ok_or(())
    }
}

pub fn tool_catalogue() -> Value {
    let tools: Vec<Value> = Tool::ALL.iter().map(Tool::descriptor).collect();
    json!({ "tools": tools })
}

pub fn server_summary() -> Value {
    json!({
        "name": SERVER_NAME,
        "description": SERVER_DESCRIPTION,
        "transport": "websocket",
    })
}

pub fn server_details() -> Value {
    let mut details = server_summary();
    details["version"] = json!(SERVER_VERSION);
    details
}
