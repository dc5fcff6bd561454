//! JSON-RPC wire types and the channel names the router publishes on.
//!
//! # Wire Format
//!
//! ```text
//! outbound  {"jsonrpc":"2.0","id":7,"method":"getCortexInfo","params":{}}
//! success   {"id":7,"result":{...}}
//! error     {"id":7,"error":{"code":-32,"message":"..."}}
//! warning   {"warning":{"code":142,"message":{...}}}
//! push      {"sid":"...","time":1.5,"met":[...]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedFrame;

/// Global channel for error frames not tied to an outstanding request.
pub const ERROR_CHANNEL: &str = "error";
/// Service warnings (headset scan finished, headset connected, ...).
pub const WARNING_CHANNEL: &str = "warning";
/// Frames that could not be matched to anything.
pub const UNRECOGNIZED_CHANNEL: &str = "unrecognized";
/// Fired once when the connection terminates.
pub const CLOSED_CHANNEL: &str = "connection_closed";

/// Keys in a push frame that describe the frame rather than name the stream.
const PUSH_METADATA_KEYS: &[&str] = &["jsonrpc", "sid", "time"];

/// Response members; never a stream tag even when present as `null`.
const RESPONSE_KEYS: &[&str] = &["id", "result", "error", "warning"];

/// Channel on which the reply to request `id` of `method` is published.
///
/// The id suffix keeps two concurrent calls to the same method apart.
pub fn response_channel(method: &str, id: u64) -> String {
    format!("{method}_done#{id}")
}

/// Channel on which push data for stream `tag` is published.
pub fn stream_channel(tag: &str) -> String {
    format!("stream_data_{tag}")
}

/// Outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// The `error` object of a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteErrorBody {
    /// Lenient decode: a missing code becomes -1 and a non-string message is
    /// rendered as JSON text.
    pub fn from_value(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = match value.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => match value {
                Value::String(s) => s.clone(),
                _ => "Unknown remote error".to_string(),
            },
        };
        Self {
            code,
            message,
            data: value.get("data").cloned(),
        }
    }
}

/// A service warning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    pub code: i64,
    #[serde(default)]
    pub message: Value,
}

impl Warning {
    pub fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: value.get("message").cloned().unwrap_or(Value::Null),
        }
    }
}

/// Payload delivered to bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `result` member of a success response.
    Result(Value),
    /// Structured error returned by the service.
    Error(RemoteErrorBody),
    Warning(Warning),
    /// Unsolicited stream datum.
    Stream {
        tag: String,
        sid: Option<String>,
        time: Option<f64>,
        data: Value,
    },
    /// A frame nothing claimed, with the raw text kept for diagnostics.
    Unrecognized { frame: String, reason: MalformedFrame },
    /// The connection terminated.
    Closed { reason: String },
}

impl Event {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Result(_) => "result",
            Event::Error(_) => "error",
            Event::Warning(_) => "warning",
            Event::Stream { .. } => "stream",
            Event::Unrecognized { .. } => "unrecognized",
            Event::Closed { .. } => "closed",
        }
    }
}

/// Build a stream event and its channel from a push frame, if the frame
/// names a stream.
pub(crate) fn stream_event(obj: &serde_json::Map<String, Value>) -> Option<(String, Event)> {
    let (tag, data) = obj
        .iter()
        .find(|(key, _)| {
            !PUSH_METADATA_KEYS.contains(&key.as_str()) && !RESPONSE_KEYS.contains(&key.as_str())
        })?;
    let event = Event::Stream {
        tag: tag.clone(),
        sid: obj.get("sid").and_then(Value::as_str).map(str::to_string),
        time: obj.get("time").and_then(Value::as_f64),
        data: data.clone(),
    };
    Some((stream_channel(tag), event))
}
