//! Canonical request/response models.
//!
//! Every inbound dialect is normalized into `CanonicalRequest` before any
//! provider is touched, and every provider result is normalized into
//! `CanonicalResponse` / `CanonicalStreamChunk` before the response
//! transformer renders the caller's wire format. The canonical shapes are the
//! only types the provider adapters consume or produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which inbound wire dialect a request used.
///
/// The protocol is symmetric: a request detected as `ContentBlock` gets a
/// content-block-shaped response, a `FlatMessage` request gets a
/// choice/delta-shaped response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProtocol {
    /// Content-block-oriented dialect: block-array message content, top-level
    /// `system`, `max_tokens`, tools shaped `{name, description, input_schema}`.
    ContentBlock,
    /// Flat-message-oriented dialect: string message content,
    /// `max_completion_tokens`, tools shaped `{type:"function", function:{..}}`.
    FlatMessage,
}

impl ClientProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientProtocol::ContentBlock => "content_block",
            ClientProtocol::FlatMessage => "flat_message",
        }
    }
}

/// Immutable capture of one inbound call.
///
/// Constructed once per request by the HTTP layer, read-only afterwards.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Header map with lower-cased keys.
    headers: HashMap<String, String>,
    pub body: Value,
    pub path: String,
    pub user_agent: Option<String>,
}

impl IncomingRequest {
    pub fn new(
        headers: impl IntoIterator<Item = (String, String)>,
        body: Value,
        path: impl Into<String>,
    ) -> Self {
        let headers: HashMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let user_agent = headers.get("user-agent").cloned();
        Self {
            headers,
            body,
            path: path.into(),
            user_agent,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

/// Optional hint controlling how much internal deliberation a backend model
/// should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// One message in the canonical conversation history.
///
/// `content` stays a `serde_json::Value`: simple text is a string, structured
/// history (tool calls, tool results) keeps its canonical object form so
/// adapters can map it without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<CanonicalToolCall>>,
}

impl CanonicalMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Flattened text view of the content, for heuristics and prompt joining.
    pub fn content_text(&self) -> String {
        content_to_text(&self.content)
    }
}

/// Collapse canonical message content (string or block array) into plain text.
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                let text = part
                    .get("text")
                    .and_then(|t| t.as_str())
                    .or_else(|| part.as_str());
                if let Some(text) = text {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Request input: either a bare prompt string or an ordered message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CanonicalInput {
    Text(String),
    Messages(Vec<CanonicalMessage>),
}

impl CanonicalInput {
    pub fn messages(&self) -> Vec<CanonicalMessage> {
        match self {
            CanonicalInput::Text(s) => vec![CanonicalMessage::text("user", s.clone())],
            CanonicalInput::Messages(msgs) => msgs.clone(),
        }
    }

    /// Joined text of all user-visible content, newest last.
    pub fn combined_text(&self) -> String {
        match self {
            CanonicalInput::Text(s) => s.clone(),
            CanonicalInput::Messages(msgs) => msgs
                .iter()
                .map(|m| m.content_text())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Canonical tool definition: flat name/description/parameters.
///
/// Provider adapters own the mapping into their wire shape
/// (`{type:"function", function:{..}}` for Responses-style,
/// `{toolSpec:{.., inputSchema:{json}}}` for Converse-style).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments string (provider-neutral form).
    pub arguments: String,
}

/// The provider-neutral request all adapters consume.
///
/// Built exactly once per request by the Universal Request Processor and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub input: CanonicalInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<CanonicalTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl CanonicalRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Status of a reasoning output item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStatus {
    InProgress,
    Completed,
}

/// One item of provider output.
///
/// Closed sum type: the response transformer matches exhaustively so a new
/// provider output kind cannot be dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Text {
        text: String,
    },
    Reasoning {
        content: String,
        status: ReasoningStatus,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// Token accounting attached to a response or final stream chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CanonicalUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// The provider-neutral unary response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub output: Vec<OutputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CanonicalUsage>,
}

impl CanonicalResponse {
    /// Concatenated text items, in output order.
    pub fn output_text(&self) -> String {
        let mut out = String::new();
        for item in &self.output {
            if let OutputItem::Text { text } = item {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> Vec<&OutputItem> {
        self.output
            .iter()
            .filter(|i| matches!(i, OutputItem::ToolCall { .. }))
            .collect()
    }
}

/// One element of a provider stream, already normalized.
///
/// A stream is an ordered, finite, non-restartable sequence of chunks; the
/// terminating chunk carries the final `usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalStreamChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<OutputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CanonicalUsage>,
}

impl CanonicalStreamChunk {
    pub fn is_final(&self) -> bool {
        self.usage.is_some()
    }
}
