use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(s) => s.parse().ok(),
        }
    }
}

/// A method call travelling over a connection.
///
/// `id` carries the sender's outbound serial. `path` names the exported
/// object the call targets; calls without a path are connection-level
/// (the handshake). `destination` is only meaningful on the broker bus,
/// where it routes the call to the daemon owning that identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(serial: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(serial)),
            method: method.into(),
            path: None,
            destination: None,
            params,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn serial(&self) -> Option<u64> {
        self.id.as_ref().and_then(RequestId::as_u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Wrap a domain error raised by a daemon so that it is recognisable as
    /// remote in origin.
    pub fn remote(code: i32, name: &str, message: &str) -> Self {
        Self::new(code, format!("{}{}: {}", REMOTE_ERROR_PREFIX, name, message))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl Response {
    pub fn success(id: Option<RequestId>, result: impl Into<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::from_error(id, RpcError::new(code, message))
    }

    pub fn from_error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn serial(&self) -> Option<u64> {
        self.id.as_ref().and_then(RequestId::as_u64)
    }
}

/// Anything that can arrive on a connection.
///
/// Requests are tried first: a line carrying a `method` is always a call.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// No object is exported at the requested path.
pub const UNKNOWN_OBJECT: i32 = -32001;
/// The broker knows no daemon owning the requested destination.
pub const SERVICE_UNKNOWN: i32 = -32002;
/// The handshake was rejected.
pub const AUTH_FAILED: i32 = -32003;
/// The call was cancelled by a `Cancel` request.
pub const CANCELLED: i32 = -32800;

/// Marker prepended to messages of errors that originate in a daemon.
pub const REMOTE_ERROR_PREFIX: &str = "RemoteError:";

/// Split a remote-origin marker off an error message.
///
/// Returns the remote error name (if the marker was present) and the bare
/// message. Messages without the marker come back unchanged.
pub fn strip_remote_error(message: &str) -> (Option<String>, String) {
    let Some(rest) = message.strip_prefix(REMOTE_ERROR_PREFIX) else {
        return (None, message.to_string());
    };
    match rest.split_once(": ") {
        Some((name, bare)) if !name.is_empty() => (Some(name.to_string()), bare.to_string()),
        _ => (None, message.to_string()),
    }
}
