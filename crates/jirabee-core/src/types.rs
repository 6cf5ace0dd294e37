//! Common types shared by the connection manager and its callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a tool-server connection.
///
/// `Connecting -> Ready -> Closed`, or `Connecting -> Closed` when the
/// handshake fails. Nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Ready = 1,
    Closed = 2,
}

impl ConnectionState {
    /// Decode from the `repr(u8)` value. Unknown values decode as `Closed`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A callable operation advertised by the tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A single tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolInvocationRequest {
    /// Create a request with no arguments.
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: Map::new(),
        }
    }

    /// Create a request from a JSON object. Non-object values are rejected.
    pub fn with_arguments(tool_name: impl Into<String>, arguments: Value) -> crate::Result<Self> {
        let tool_name = tool_name.into();
        match arguments {
            Value::Object(map) => Ok(Self {
                tool_name,
                arguments: map,
            }),
            Value::Null => Ok(Self::new(tool_name)),
            other => Err(crate::Error::invalid(
                "arguments",
                format!("must be a JSON object, got {}", json_kind(&other)),
            )),
        }
    }

    /// Add one argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One item of a tool result, kept exactly as the server sent it.
///
/// MCP servers usually send `{"type": "text", "text": "..."}` blocks, but
/// images, resources and server-specific shapes pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentItem(Value);

impl ContentItem {
    /// Wrap an arbitrary JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// A `text` content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self(serde_json::json!({"type": "text", "text": text.into()}))
    }

    /// The block's `type` field, if any.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// Text of a `text` block.
    pub fn as_text(&self) -> Option<&str> {
        if self.kind() == Some("text") {
            self.0.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// The outcome of a tool call as reported by the server.
///
/// `is_error` is set by the remote tool. It is data for the caller to react
/// to, not a failure of the connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolInvocationResult {
    /// Successful result with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    /// Remote-reported failure with one text block.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(message)],
            is_error: true,
        }
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentItem::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Decode the first content item into a JSON payload.
    ///
    /// Text that parses as JSON is returned parsed; other text is wrapped
    /// as `{"text_content": ...}`. Non-text items are returned as sent.
    /// `None` when the server returned no content at all.
    pub fn payload(&self) -> Option<Value> {
        let first = self.content.first()?;
        match first.as_text() {
            Some(text) => Some(
                serde_json::from_str(text)
                    .unwrap_or_else(|_| serde_json::json!({"text_content": text})),
            ),
            None => Some(first.as_value().clone()),
        }
    }
}
