//! Payload types carried inside frames
//!
//! Every frame holds one JSON object. Only the fields needed for correlation
//! and dispatch are modelled; anything else the peer sends is kept in
//! [`Message::extra`] untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Top-level field names with a fixed meaning in [`Message`]
pub(crate) const RESERVED_FIELDS: &[&str] =
    &["id", "type", "method", "params", "result", "error", "headers"];

/// Discriminator carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    /// Error response; some peers use this instead of a response with an `error` field
    Error,
}

impl MessageKind {
    /// Map a raw `type` value, by name or by numeric code
    ///
    /// Codes follow the editor IPC convention: 1 request, 2 response,
    /// 3 error, 4 notification. Anything else is unknown.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => match name.to_ascii_lowercase().as_str() {
                "request" => Some(Self::Request),
                "response" | "reply" => Some(Self::Response),
                "notification" | "event" => Some(Self::Notification),
                "error" => Some(Self::Error),
                _ => None,
            },
            Value::Number(code) => match code.as_u64()? {
                1 => Some(Self::Request),
                2 => Some(Self::Response),
                3 => Some(Self::Error),
                4 => Some(Self::Notification),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Unknown discriminators decode as absent so the kind falls back to inference
fn lenient_kind<'de, D>(deserializer: D) -> std::result::Result<Option<MessageKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(MessageKind::from_value))
}

/// Accept string or numeric ids; numbers are kept in their decimal form
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(key_string))
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A single decoded payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation identifier (requests and their responses only)
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Explicit discriminator; see [`Message::kind`] for inference when absent
    /// or unrecognised
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_kind",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    /// Headers attached to outgoing requests and notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Create a request with the given correlation id
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some(MessageKind::Request),
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            kind: Some(MessageKind::Notification),
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// Create a success response
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some(MessageKind::Response),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Create an error response
    pub fn error_response(id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            id: Some(id.into()),
            kind: Some(MessageKind::Response),
            error: Some(error),
            ..Default::default()
        }
    }

    /// Attach headers, replacing any already present. Empty maps are dropped.
    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers = if headers.is_empty() {
            None
        } else {
            Some(headers.clone())
        };
        self
    }

    /// Attach connection-wide fields at the top level
    ///
    /// Fields the message already carries take precedence, and reserved
    /// names are skipped.
    pub fn with_context(mut self, context: &Map<String, Value>) -> Self {
        for (key, value) in context {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Store the correlation key in `field` as well as in `id`
    pub fn with_correlation(mut self, field: &str, key: &str) -> Self {
        if field == "id" {
            self.id = Some(key.to_string());
        } else {
            self.extra
                .insert(field.to_string(), Value::String(key.to_string()));
        }
        self
    }

    /// The value that pairs this message with a pending request
    pub fn correlation_key(&self, field: &str) -> Option<String> {
        if field == "id" {
            return self.id.clone();
        }
        self.extra.get(field).and_then(key_string)
    }

    /// The message kind, inferred from the populated fields when `type` is absent
    pub fn kind(&self) -> MessageKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if self.error.is_some() {
            MessageKind::Error
        } else if self.result.is_some() {
            MessageKind::Response
        } else if self.method.is_some() && self.id.is_some() {
            MessageKind::Request
        } else {
            MessageKind::Notification
        }
    }

    /// Check if this message carries an error
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.kind() == MessageKind::Error
    }

    /// Get the result, returning the remote error if the peer reported one
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.kind() == MessageKind::Error {
            // Error kind without an `error` object: look for top-level code/message
            let code = self
                .extra
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(RemoteError::SERVER_ERROR);
            let message = self
                .extra
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            return Err(RemoteError::new(code, message));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }

    /// Serialize to the UTF-8 JSON bytes placed inside a frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::MalformedFrame(format!("payload is not UTF-8: {}", e)))?;
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))
    }
}

/// Error information in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Unknown method: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Add optional data to the error
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}
