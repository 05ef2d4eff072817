use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl DapRequest {
    /// Return string argument by name.
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    /// Return integer argument by name.
    pub fn i64_arg(&self, name: &str) -> Option<i64> {
        self.arguments.get(name).and_then(Value::as_i64)
    }

    /// Return boolean argument by name.
    pub fn bool_arg(&self, name: &str) -> Option<bool> {
        self.arguments.get(name).and_then(Value::as_bool)
    }
}

/// Response from the client to a reverse request (`runInTerminal`).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientResponse {
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Anything the client may send to the adapter.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Request(DapRequest),
    Response(ClientResponse),
}

impl ClientMessage {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value.get("type").and_then(Value::as_str) {
            Some("request") => Ok(ClientMessage::Request(serde_json::from_value(value)?)),
            Some("response") => Ok(ClientMessage::Response(serde_json::from_value(value)?)),
            Some(other) => Err(Error::MalformedMessage(format!(
                "unexpected message type `{other}`"
            ))),
            None => Err(Error::MalformedMessage("message without type".into())),
        }
    }
}

/// DAP response envelope, `body` is omitted when there is none.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Request sent by the adapter to the client.
#[derive(Debug, Serialize)]
pub struct DapReverseRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: &'static str,
    pub arguments: Value,
}

/// Event produced by adapter components, the session gives it a sequence number
/// before writing to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub event: String,
    pub body: Option<Value>,
}

impl OutgoingEvent {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            event: event.into(),
            body: Some(body),
        }
    }

    pub fn bare(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            body: None,
        }
    }
}
