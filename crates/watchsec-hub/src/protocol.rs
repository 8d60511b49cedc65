//! JSON-RPC 2.0 framing shared by the hub WebSocket and the admin socket,
//! plus the typed hub verbs and pushes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
/// Application error: the dispatch could not be completed.
pub const DISPATCH_FAILED: i32 = -32000;
/// Application error: the connection's role may not call this method.
pub const FORBIDDEN: i32 = -32003;

fn default_jsonrpc() -> String {
    "2.0".into()
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Server-initiated push (no `id`).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Hub verbs (client -> hub)
// ---------------------------------------------------------------------------

/// `SendScreen` params; also the payload of the `ReceiveScreen` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenParams {
    pub agent_id: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEventParams {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillProcessParams {
    pub target_agent_id: String,
    pub pid: u32,
}

/// A decoded inbound hub call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCall {
    SendScreen(ScreenParams),
    SendEvent(SendEventParams),
    KillProcess(KillProcessParams),
}

impl HubCall {
    /// Decode `method` + `params`, mapping failures to JSON-RPC error codes.
    pub fn decode(method: &str, params: serde_json::Value) -> Result<Self, JsonRpcError> {
        fn params_of<T: for<'de> Deserialize<'de>>(
            method: &str,
            params: serde_json::Value,
        ) -> Result<T, JsonRpcError> {
            serde_json::from_value(params).map_err(|e| JsonRpcError {
                code: INVALID_PARAMS,
                message: format!("invalid params for {method}: {e}"),
            })
        }

        match method {
            "SendScreen" => params_of(method, params).map(HubCall::SendScreen),
            "SendEvent" => params_of(method, params).map(HubCall::SendEvent),
            "KillProcess" => params_of(method, params).map(HubCall::KillProcess),
            other => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method not found: {other}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Hub pushes (hub -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPush {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPush {
    pub agent_id: String,
    pub command: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KillPush {
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPush {
    pub connection_id: u64,
    pub role: &'static str,
}

/// Everything the hub pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubPush {
    Connected(ConnectedPush),
    ReceiveScreen(ScreenParams),
    ReceiveEvent(EventPush),
    ReceiveCommand(CommandPush),
    KillProcess(KillPush),
}

impl HubPush {
    pub fn method(&self) -> &'static str {
        match self {
            HubPush::Connected(_) => "Connected",
            HubPush::ReceiveScreen(_) => "ReceiveScreen",
            HubPush::ReceiveEvent(_) => "ReceiveEvent",
            HubPush::ReceiveCommand(_) => "ReceiveCommand",
            HubPush::KillProcess(_) => "KillProcess",
        }
    }

    /// Render as a JSON-RPC notification text frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        let params = match self {
            HubPush::Connected(p) => serde_json::to_value(p)?,
            HubPush::ReceiveScreen(p) => serde_json::to_value(p)?,
            HubPush::ReceiveEvent(p) => serde_json::to_value(p)?,
            HubPush::ReceiveCommand(p) => serde_json::to_value(p)?,
            HubPush::KillProcess(p) => serde_json::to_value(p)?,
        };
        serde_json::to_string(&JsonRpcNotification::new(self.method(), params))
    }
}
