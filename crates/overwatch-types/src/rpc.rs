//! JSON-RPC 2.0 message model and Overwatch proxy error codes.

use serde::{Deserialize, Serialize};

// ============================================================
// Proxy Error Codes
// ============================================================

/// JSON-RPC error codes emitted by the proxy, in the server-error range
/// -32000..-32099.
pub mod codes {
    /// Denied by policy or user.
    pub const TOOL_DENIED: i64 = -32001;
    /// Upstream is not serving requests.
    pub const UPSTREAM_UNAVAILABLE: i64 = -32002;
    /// No response within the timeout window.
    pub const REQUEST_TIMEOUT: i64 = -32003;
    /// Frame exceeded the size limit.
    pub const REQUEST_TOO_LARGE: i64 = -32004;
    /// Too many recent upstream failures.
    pub const CIRCUIT_BREAKER_OPEN: i64 = -32005;
    /// Proxy is terminating.
    pub const SERVER_SHUTTING_DOWN: i64 = -32006;
}

// ============================================================
// Messages
// ============================================================

/// A JSON-RPC 2.0 message.
///
/// One struct covers all three shapes: requests carry `id` + `method`,
/// notifications carry `method` without `id`, responses carry `id` and one of
/// `result`/`error`. Absent fields are omitted on the wire so relayed frames
/// round-trip byte-compatibly with what well-formed peers produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (absent for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Method name (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Result (for success responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error (for error responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcMessage {
    /// Build a request message.
    pub fn request(
        id: serde_json::Value,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a notification message (no id).
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a success response bound to `id`.
    pub fn response(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response bound to `id`.
    pub fn error_response(
        id: serde_json::Value,
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// A message with an id and a method is a request.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    /// A message with a method and no id is a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// A message with an id and a result or error is a response.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// True for `tools/call` requests.
    pub fn is_tool_call(&self) -> bool {
        self.method.as_deref() == Some("tools/call")
    }
}

/// Canonical string key for a JSON-RPC request id.
///
/// Ids may be numbers or strings on the wire; the pending-request table keys
/// them by this canonical form so `1` and `"1"` stay distinct.
pub fn request_key(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => format!("s:{s}"),
        other => format!("v:{other}"),
    }
}

/// Extract the tool name and arguments from `tools/call` params.
pub fn tool_call_parts(params: Option<&serde_json::Value>) -> Option<(String, Option<serde_json::Value>)> {
    let params = params?;
    let name = params.get("name")?.as_str()?.to_string();
    let args = params.get("arguments").cloned();
    Some((name, args))
}
