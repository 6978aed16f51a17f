//! Universal request processing.
//!
//! Orchestrates format detection, body parsing, conversation tagging,
//! reasoning-effort analysis and model routing into one canonical request
//! plus per-request metadata. Fails fast with `UnsupportedModelError` on a
//! routing miss and `MalformedRequestError` when the body cannot be parsed
//! into the detected protocol's message shape; neither reaches a provider.

use crate::conversation::ConversationManager;
use crate::detector::{detect_format, response_format_for};
use crate::errors::{GatewayError, GatewayResult};
use crate::models::{
    CanonicalInput, CanonicalMessage, CanonicalRequest, CanonicalTool, CanonicalToolCall,
    ClientProtocol, IncomingRequest, ReasoningEffort,
};
use crate::reasoning::{self, ComplexityEstimate};
use crate::routing::{RoutingDecision, RoutingTable};
use serde_json::{json, Value};

/// Everything the rest of the pipeline needs to serve one request.
#[derive(Debug, Clone)]
pub struct ProcessedRequest {
    pub request_format: ClientProtocol,
    pub response_format: ClientProtocol,
    pub conversation_id: String,
    pub correlation_id: String,
    pub estimated_complexity: ComplexityEstimate,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub canonical: CanonicalRequest,
    pub routing: RoutingDecision,
}

pub struct RequestProcessor<'a> {
    routing: &'a RoutingTable,
    conversations: &'a ConversationManager,
}

impl<'a> RequestProcessor<'a> {
    pub fn new(routing: &'a RoutingTable, conversations: &'a ConversationManager) -> Self {
        Self {
            routing,
            conversations,
        }
    }

    /// Build the canonical request and its metadata for one inbound call.
    pub fn process(
        &self,
        request: &IncomingRequest,
        correlation_id: &str,
    ) -> GatewayResult<ProcessedRequest> {
        let request_format = detect_format(request);
        let response_format = response_format_for(request_format);

        let parsed = match request_format {
            ClientProtocol::ContentBlock => parse_content_block_body(&request.body)?,
            ClientProtocol::FlatMessage => parse_flat_message_body(&request.body)?,
        };

        let conversation_id = self
            .conversations
            .extract_conversation_id(request.headers(), correlation_id);
        let context = self.conversations.get_context(&conversation_id);

        let combined = parsed
            .messages
            .iter()
            .map(|m| m.content_text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let (estimated_complexity, reasoning_effort) =
            reasoning::classify(&combined, context.as_ref());

        let routing = self.routing.resolve_supported(&parsed.model)?;

        let canonical = CanonicalRequest {
            model: routing.backend_model.clone(),
            input: CanonicalInput::Messages(parsed.messages),
            max_output_tokens: parsed.max_output_tokens,
            reasoning_effort,
            stream: parsed.stream,
            temperature: parsed.temperature,
            top_p: parsed.top_p,
            stop_sequences: parsed.stop_sequences,
            previous_response_id: context.and_then(|c| c.previous_response_id),
            tools: parsed.tools,
            tool_choice: parsed.tool_choice,
            response_format: parsed.response_format,
        };

        Ok(ProcessedRequest {
            request_format,
            response_format,
            conversation_id,
            correlation_id: correlation_id.to_string(),
            estimated_complexity,
            reasoning_effort,
            canonical,
            routing,
        })
    }
}

struct ParsedBody {
    model: String,
    messages: Vec<CanonicalMessage>,
    max_output_tokens: Option<u32>,
    stream: Option<bool>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    stop_sequences: Option<Vec<String>>,
    tools: Option<Vec<CanonicalTool>>,
    tool_choice: Option<Value>,
    response_format: Option<Value>,
}

fn require_object<'v>(body: &'v Value) -> GatewayResult<&'v serde_json::Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| GatewayError::MalformedRequest("request body is not a JSON object".into()))
}

fn require_model(obj: &serde_json::Map<String, Value>) -> GatewayResult<String> {
    obj.get("model")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(String::from)
        .ok_or_else(|| GatewayError::MalformedRequest("missing \"model\" field".into()))
}

fn stop_sequences_from(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(arr) => Some(
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        _ => None,
    }
}

/// Parse the content-block dialect: top-level `system`, block-array message
/// content with `text` / `tool_use` / `tool_result` blocks.
fn parse_content_block_body(body: &Value) -> GatewayResult<ParsedBody> {
    let obj = require_object(body)?;
    let model = require_model(obj)?;

    let raw_messages = obj
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| GatewayError::MalformedRequest("missing \"messages\" array".into()))?;

    let mut messages: Vec<CanonicalMessage> = Vec::new();

    if let Some(system) = obj.get("system") {
        let text = crate::models::content_to_text(system);
        if !text.is_empty() {
            messages.push(CanonicalMessage::text("system", text));
        }
    }

    for m in raw_messages {
        let role = m
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or_else(|| GatewayError::MalformedRequest("message without role".into()))?;
        let content = m.get("content").cloned().unwrap_or(Value::Null);

        match &content {
            Value::String(text) => messages.push(CanonicalMessage::text(role, text.clone())),
            Value::Array(blocks) => {
                let mut text_parts: Vec<String> = Vec::new();
                let mut tool_calls: Vec<CanonicalToolCall> = Vec::new();

                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let id = block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let name = block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let arguments = block
                                .get("input")
                                .map(|i| i.to_string())
                                .unwrap_or_else(|| "{}".to_string());
                            tool_calls.push(CanonicalToolCall { id, name, arguments });
                        }
                        Some("tool_result") => {
                            // Tool results become their own canonical message.
                            let tool_call_id = block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let result_text = block
                                .get("content")
                                .map(crate::models::content_to_text)
                                .unwrap_or_default();
                            messages.push(CanonicalMessage {
                                role: "tool".to_string(),
                                content: Value::String(result_text),
                                tool_call_id: Some(tool_call_id),
                                tool_calls: None,
                            });
                        }
                        _ => {}
                    }
                }

                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    messages.push(CanonicalMessage {
                        role: role.to_string(),
                        content: Value::String(text_parts.join("\n")),
                        tool_call_id: None,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                    });
                }
            }
            Value::Null => {
                return Err(GatewayError::MalformedRequest(format!(
                    "message with role {role} has no content"
                )))
            }
            _ => {
                return Err(GatewayError::MalformedRequest(
                    "message content must be a string or block array".into(),
                ))
            }
        }
    }

    let tools = obj.get("tools").and_then(|t| t.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|t| {
                Some(CanonicalTool {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    parameters: t.get("input_schema").cloned().unwrap_or(json!({})),
                })
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = obj.get("tool_choice").map(normalize_block_tool_choice);

    Ok(ParsedBody {
        model,
        messages,
        max_output_tokens: obj.get("max_tokens").and_then(|v| v.as_u64()).map(|n| n as u32),
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: stop_sequences_from(obj.get("stop_sequences")),
        tools: tools.filter(|t: &Vec<CanonicalTool>| !t.is_empty()),
        tool_choice,
        response_format: None,
    })
}

/// Parse the flat-message dialect: string content, `tool` role messages,
/// `{type:"function"}` tool definitions.
fn parse_flat_message_body(body: &Value) -> GatewayResult<ParsedBody> {
    let obj = require_object(body)?;
    let model = require_model(obj)?;

    let raw_messages = obj
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| GatewayError::MalformedRequest("missing \"messages\" array".into()))?;

    let mut messages: Vec<CanonicalMessage> = Vec::new();
    for m in raw_messages {
        let role = m
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or_else(|| GatewayError::MalformedRequest("message without role".into()))?;
        let content = m.get("content").cloned().unwrap_or(Value::Null);

        let tool_calls = m.get("tool_calls").and_then(|tc| tc.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|call| {
                    Some(CanonicalToolCall {
                        id: call.get("id")?.as_str()?.to_string(),
                        name: call.get("function")?.get("name")?.as_str()?.to_string(),
                        arguments: call
                            .get("function")?
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect::<Vec<_>>()
        });
        let tool_calls = tool_calls.filter(|c| !c.is_empty());

        if content.is_null() && tool_calls.is_none() {
            return Err(GatewayError::MalformedRequest(format!(
                "message with role {role} has no content"
            )));
        }

        messages.push(CanonicalMessage {
            role: role.to_string(),
            content: if content.is_null() {
                Value::String(String::new())
            } else {
                content
            },
            tool_call_id: m
                .get("tool_call_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            tool_calls,
        });
    }

    let tools = obj.get("tools").and_then(|t| t.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|t| {
                let function = t.get("function")?;
                Some(CanonicalTool {
                    name: function.get("name")?.as_str()?.to_string(),
                    description: function
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    parameters: function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = obj.get("tool_choice").map(normalize_flat_tool_choice);

    Ok(ParsedBody {
        model,
        messages,
        max_output_tokens: obj
            .get("max_completion_tokens")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        stop_sequences: stop_sequences_from(obj.get("stop")),
        tools: tools.filter(|t: &Vec<CanonicalTool>| !t.is_empty()),
        tool_choice,
        response_format: obj.get("response_format").cloned(),
    })
}

/// Canonical tool choice: `"auto"`, `"none"`, `"required"` or `{"name": ..}`.
fn normalize_block_tool_choice(value: &Value) -> Value {
    match value.get("type").and_then(|t| t.as_str()) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => match value.get("name").and_then(|n| n.as_str()) {
            Some(name) => json!({ "name": name }),
            None => json!("auto"),
        },
        _ => value.clone(),
    }
}

fn normalize_flat_tool_choice(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Object(obj) => match obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
        {
            Some(name) => json!({ "name": name }),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}
