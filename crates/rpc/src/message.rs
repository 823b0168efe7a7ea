//! JSON-RPC message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_types::{TernError, TernResult, TipHeader};

use crate::methods;

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Always `"2.0"`.
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

impl Request {
    /// Create a request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { jsonrpc: jsonrpc_version(), id, method: method.into(), params }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// The error code.
    pub code: i64,
    /// The error message.
    pub message: String,
}

impl JsonRpcError {
    #[must_use]
    /// Create a new error.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Interpret an `error` member. Some servers send a bare string instead
    /// of an object.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::new(0, s.clone()),
            Value::Object(map) => Self {
                code: map.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| value.to_string(), str::to_string),
            },
            other => Self::new(0, other.to_string()),
        }
    }
}

impl From<JsonRpcError> for TernError {
    fn from(err: JsonRpcError) -> Self {
        Self::Server { code: err.code, message: err.message }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: Value,
    /// Result, absent on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Raw error member, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    /// Build a success response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self { id: Value::from(id), result: Some(result), error: None }
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self { id: Value::from(id), result: None, error: serde_json::to_value(error).ok() }
    }

    /// The numeric request id, if the server echoed one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Turn the response into the caller-facing result.
    pub fn into_result(self) -> TernResult<Value> {
        match self.error {
            Some(error) if !error.is_null() => Err(JsonRpcError::from_value(&error).into()),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A server push: a message carrying `method` and `params` but no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The subscription method.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// For `blockchain.scripthash.subscribe` pushes: `(script_hash, status)`.
    /// A `None` status means the script hash has no history.
    #[must_use]
    pub fn script_hash_status(&self) -> Option<(String, Option<String>)> {
        if self.method != methods::SCRIPTHASH_SUBSCRIBE {
            return None;
        }
        let params = self.params.as_array()?;
        let hash = params.first()?.as_str()?.to_string();
        let status = params.get(1).and_then(Value::as_str).map(str::to_string);
        Some((hash, status))
    }

    /// For `blockchain.headers.subscribe` pushes: the new tip.
    #[must_use]
    pub fn header(&self) -> Option<TipHeader> {
        if self.method != methods::HEADERS_SUBSCRIBE {
            return None;
        }
        let tip = match &self.params {
            Value::Array(items) => items.first()?,
            other => other,
        };
        serde_json::from_value(tip.clone()).ok()
    }
}
