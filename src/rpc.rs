//! JSON-RPC 2.0 message value type (spec §3 "RpcMessage", §6).
//!
//! One project-specific convention on top of plain JSON-RPC: MCP capability
//! objects must serialize as `{}` rather than `[]` when empty — `serde_json`
//! does this naturally for a `HashMap`/struct but not for `Option<Vec<_>>`,
//! which is why capability fields below are modeled as `serde_json::Map`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next monotonic decimal-string id for an auto-assigned
/// request (spec §3: "auto-assigned monotonic decimal string when request
/// and caller omits it").
fn next_id() -> Value {
    Value::String(NEXT_ID.fetch_add(1, Ordering::Relaxed).to_string())
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Tagged union over the four JSON-RPC 2.0 message shapes. Serializes to the
/// flat wire representation (no internal `"kind"` tag) via a custom
/// `Serialize`/`Deserialize` pair so that `deserialize(serialize(m)) == m`
/// for every message not containing non-UTF-8 string bytes (spec §8.7).
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Value,
    },
    Error {
        id: Value,
        error: RpcError,
    },
}

/// The wire-level JSON-RPC envelope. `params`/`result` default to an empty
/// object rather than being omitted, matching spec §3's "empty payload
/// serializes as an empty object, not an empty array".
#[derive(Serialize, Deserialize)]
struct Wire {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Serialize for RpcMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire = match self {
            RpcMessage::Request { id, method, params } => Wire {
                jsonrpc: "2.0".to_string(),
                id: Some(id.clone()),
                method: Some(method.clone()),
                params: Some(normalize_empty_object(params)),
                result: None,
                error: None,
            },
            RpcMessage::Notification { method, params } => Wire {
                jsonrpc: "2.0".to_string(),
                id: None,
                method: Some(method.clone()),
                params: Some(normalize_empty_object(params)),
                result: None,
                error: None,
            },
            RpcMessage::Response { id, result } => Wire {
                jsonrpc: "2.0".to_string(),
                id: Some(id.clone()),
                method: None,
                params: None,
                result: Some(result.clone()),
                error: None,
            },
            RpcMessage::Error { id, error } => Wire {
                jsonrpc: "2.0".to_string(),
                id: Some(id.clone()),
                method: None,
                params: None,
                result: None,
                error: Some(error.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = Wire::deserialize(deserializer)?;
        Ok(if let Some(error) = wire.error {
            RpcMessage::Error {
                id: wire.id.unwrap_or(Value::Null),
                error,
            }
        } else if let Some(result) = wire.result {
            RpcMessage::Response {
                id: wire.id.unwrap_or(Value::Null),
                result,
            }
        } else if let Some(method) = wire.method {
            let params = wire.params.unwrap_or_else(|| Value::Object(Default::default()));
            match wire.id {
                Some(id) => RpcMessage::Request { id, method, params },
                None => RpcMessage::Notification { method, params },
            }
        } else {
            return Err(serde::de::Error::custom(
                "JSON-RPC message has neither method, result, nor error",
            ));
        })
    }
}

fn normalize_empty_object(v: &Value) -> Value {
    match v {
        Value::Array(a) if a.is_empty() => Value::Object(Default::default()),
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

impl RpcMessage {
    /// Build a request, auto-assigning a monotonic id if the caller passes
    /// `None`.
    pub fn request(method: impl Into<String>, params: Value, id: Option<Value>) -> Self {
        RpcMessage::Request {
            id: id.unwrap_or_else(next_id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        RpcMessage::Response { id, result }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        RpcMessage::Error {
            id,
            error: RpcError {
                code,
                message: message.into(),
                data,
            },
        }
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Response { id, .. }
            | RpcMessage::Error { id, .. } => Some(id),
            RpcMessage::Notification { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcMessage::Error { .. })
    }

    /// The MCP default protocol version string (spec §6).
    pub const MCP_PROTOCOL_VERSION: &'static str = "2025-06-18";

    /// Build the `initialize` request per spec §4.4 step 1: capability
    /// object fields serialize as `{}` when empty, never `[]`.
    pub fn mcp_initialize(client_info: Option<Value>, capabilities: Option<Value>) -> Self {
        let client_info = client_info.unwrap_or_else(|| {
            serde_json::json!({ "name": "flightdeck", "version": env!("CARGO_PKG_VERSION") })
        });
        let capabilities = capabilities.unwrap_or_else(default_capabilities);
        Self::request(
            "initialize",
            serde_json::json!({
                "protocolVersion": Self::MCP_PROTOCOL_VERSION,
                "capabilities": capabilities,
                "clientInfo": client_info,
            }),
            None,
        )
    }

    /// Build the `notifications/initialized` notification (spec §4.4 step 2b).
    pub fn mcp_initialized_notification() -> Self {
        Self::notification("notifications/initialized", Value::Object(Default::default()))
    }
}

/// Every MCP capability field must be present and serialize as `{}` when
/// unused (spec §4.4 step 1).
fn default_capabilities() -> Value {
    let fields = [
        "experimental",
        "sampling",
        "logging",
        "completions",
        "roots",
        "prompts",
        "resources",
        "tools",
        "elicitation",
    ];
    let mut map = serde_json::Map::new();
    for field in fields {
        map.insert(field.to_string(), Value::Object(Default::default()));
    }
    Value::Object(map)
}

/// Parse a raw JSON-RPC body, which may be a single message or a batch
/// array of messages (spec §9 Open Question: "top-level JSON type is array
/// with objects" is the unambiguous batch signal).
pub fn parse_body(body: &[u8]) -> serde_json::Result<Vec<RpcMessage>> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<RpcMessage>)
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_request() {
        let msg = RpcMessage::request("tools/list", json!({"cursor": null}), Some(json!(7)));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: RpcMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_notification_empty_params_is_object() {
        let msg = RpcMessage::mcp_initialized_notification();
        let encoded = serde_json::to_value(&msg).unwrap();
        assert!(encoded["params"].is_object());
        let decoded: RpcMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_error() {
        let msg = RpcMessage::error(json!(1), -32601, "Method not found", None);
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: RpcMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
        assert!(decoded.is_error());
    }

    #[test]
    fn initialize_capabilities_are_objects_not_arrays() {
        let msg = RpcMessage::mcp_initialize(None, None);
        let encoded = serde_json::to_value(&msg).unwrap();
        let caps = &encoded["params"]["capabilities"];
        for field in ["sampling", "roots", "tools", "elicitation"] {
            assert!(caps[field].is_object(), "{field} should serialize as {{}}");
        }
    }

    #[test]
    fn parse_body_handles_batch_array() {
        let batch = json!([
            {"jsonrpc": "2.0", "id": "1", "result": {}},
            {"jsonrpc": "2.0", "id": "2", "result": {}},
        ]);
        let messages = parse_body(batch.to_string().as_bytes()).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn parse_body_handles_single_message() {
        let single = json!({"jsonrpc": "2.0", "id": "1", "result": {"ok": true}});
        let messages = parse_body(single.to_string().as_bytes()).unwrap();
        assert_eq!(messages.len(), 1);
    }
}
