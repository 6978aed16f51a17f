//! "Responses"-style provider adapter.
//!
//! Canonical tool definitions map to `{type:"function", function:{..}}`, the
//! reasoning hint maps to `reasoning.effort`, and the streaming variant
//! returns newline-delimited JSON objects, each mapped 1:1 onto a
//! `CanonicalStreamChunk`.

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamChunk, CanonicalUsage, OutputItem,
    ReasoningStatus,
};
use crate::providers::{ChunkStream, ProviderAdapter};
use crate::util::now_secs;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

pub struct ResponsesAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ResponsesAdapter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Resolve endpoint and credentials from the environment, defaulting to
    /// the public Responses endpoint.
    pub fn from_env(http: reqwest::Client) -> Self {
        let base_url = std::env::var("POLYGATE_RESPONSES_BASE_URL")
            .or_else(|_| std::env::var("OPENAI_BASE_URL"))
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|s| !s.is_empty());
        Self::new(http, base_url, api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, body: &Value) -> GatewayResult<reqwest::Response> {
        let mut req = self.http.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_error(status.as_u16(), &body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for ResponsesAdapter {
    fn name(&self) -> &'static str {
        "responses"
    }

    async fn create_response(&self, request: &CanonicalRequest) -> GatewayResult<CanonicalResponse> {
        let body = build_request_body(request, false);
        let resp = self.post(&body).await?;
        let value: Value = resp.json().await?;
        parse_response(&value)
    }

    async fn create_response_stream(
        &self,
        request: &CanonicalRequest,
    ) -> GatewayResult<ChunkStream> {
        let body = build_request_body(request, true);
        let resp = self.post(&body).await?;

        let stream = async_stream::try_stream! {
            let mut bytes = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(piece) = bytes.next().await {
                let piece = piece.map_err(GatewayError::from)?;
                buffer.extend_from_slice(&piece);

                // One JSON object per line; a partial trailing line stays
                // buffered until the next read.
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(line).map_err(|e| {
                        GatewayError::provider_call(0, "protocol", format!("bad stream frame: {e}"))
                    })?;
                    yield parse_chunk(&value)?;
                }
            }

            // Trailing frame without a newline terminator.
            let rest = String::from_utf8_lossy(&buffer);
            let rest = rest.trim();
            if !rest.is_empty() {
                let value: Value = serde_json::from_str(rest).map_err(|e| {
                    GatewayError::provider_call(0, "protocol", format!("bad stream frame: {e}"))
                })?;
                yield parse_chunk(&value)?;
            }
        };

        Ok(Box::pin(stream))
    }
}

fn provider_error(status: u16, body: &str) -> GatewayError {
    let (error_type, message) = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?.clone();
            Some((
                err.get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("http")
                    .to_string(),
                err.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or(body)
                    .to_string(),
            ))
        })
        .unwrap_or_else(|| ("http".to_string(), body.to_string()));
    GatewayError::provider_call(status, &error_type, message)
}

/// Build the provider's request body from a canonical request.
pub fn build_request_body(request: &CanonicalRequest, stream: bool) -> Value {
    let input: Vec<Value> = request
        .input
        .messages()
        .iter()
        .map(|m| {
            let mut obj = Map::new();
            obj.insert("role".into(), Value::String(m.role.clone()));
            obj.insert("content".into(), m.content.clone());
            if let Some(id) = &m.tool_call_id {
                obj.insert("tool_call_id".into(), Value::String(id.clone()));
            }
            if let Some(calls) = &m.tool_calls {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments}
                        })
                    })
                    .collect();
                obj.insert("tool_calls".into(), Value::Array(calls));
            }
            Value::Object(obj)
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "input": input,
    });

    if let Some(n) = request.max_output_tokens {
        body["max_output_tokens"] = json!(n);
    }
    if let Some(effort) = request.reasoning_effort {
        body["reasoning"] = json!({ "effort": effort.as_str() });
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(stop) = &request.stop_sequences {
        body["stop"] = json!(stop);
    }
    if let Some(prev) = &request.previous_response_id {
        body["previous_response_id"] = json!(prev);
    }
    if let Some(tools) = &request.tools {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = map_tool_choice(choice);
    }
    if let Some(rf) = &request.response_format {
        body["response_format"] = rf.clone();
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn map_tool_choice(choice: &Value) -> Value {
    match choice.get("name").and_then(|n| n.as_str()) {
        Some(name) => json!({"type": "function", "function": {"name": name}}),
        None => choice.clone(),
    }
}

/// Parse a unary provider response into the canonical shape.
pub fn parse_response(value: &Value) -> GatewayResult<CanonicalResponse> {
    let output = value
        .get("output")
        .and_then(|o| o.as_array())
        .map(|items| items.iter().filter_map(parse_output_item).collect())
        .unwrap_or_default();

    Ok(CanonicalResponse {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("resp-{}", uuid::Uuid::new_v4().simple())),
        created: value.get("created").and_then(|v| v.as_u64()).unwrap_or_else(now_secs),
        model: value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        output,
        usage: parse_usage(value.get("usage")),
    })
}

/// Parse one newline-delimited stream frame. Frames carry the same item
/// vocabulary as unary responses; the terminal frame carries `usage`.
pub fn parse_chunk(value: &Value) -> GatewayResult<CanonicalStreamChunk> {
    let output = value
        .get("output")
        .and_then(|o| o.as_array())
        .map(|items| items.iter().filter_map(parse_output_item).collect())
        .unwrap_or_default();

    Ok(CanonicalStreamChunk {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        created: value.get("created").and_then(|v| v.as_u64()).unwrap_or_else(now_secs),
        model: value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        output,
        usage: parse_usage(value.get("usage")),
    })
}

fn parse_output_item(item: &Value) -> Option<OutputItem> {
    match item.get("type").and_then(|t| t.as_str())? {
        "text" | "output_text" => Some(OutputItem::Text {
            text: item.get("text")?.as_str()?.to_string(),
        }),
        "reasoning" => Some(OutputItem::Reasoning {
            content: item
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            status: match item.get("status").and_then(|s| s.as_str()) {
                Some("in_progress") => ReasoningStatus::InProgress,
                _ => ReasoningStatus::Completed,
            },
        }),
        "tool_call" | "function_call" => Some(OutputItem::ToolCall {
            id: item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            name: item.get("name")?.as_str()?.to_string(),
            arguments: item
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}")
                .to_string(),
        }),
        "tool_result" | "function_call_output" => Some(OutputItem::ToolResult {
            tool_call_id: item
                .get("call_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            content: item
                .get("output")
                .or_else(|| item.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

fn parse_usage(value: Option<&Value>) -> Option<CanonicalUsage> {
    let u = value?;
    let input = u.get("input_tokens").and_then(|v| v.as_u64())?;
    let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    Some(CanonicalUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: u
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(input + output),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalInput, CanonicalMessage, CanonicalTool, ReasoningEffort};
    use serde_json::json;

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4o".into(),
            input: CanonicalInput::Messages(vec![
                CanonicalMessage::text("system", "Be terse."),
                CanonicalMessage::text("user", "hi"),
            ]),
            max_output_tokens: Some(100),
            reasoning_effort: Some(ReasoningEffort::Medium),
            stream: None,
            temperature: Some(0.2),
            top_p: None,
            stop_sequences: None,
            previous_response_id: Some("resp-prev".into()),
            tools: Some(vec![CanonicalTool {
                name: "lookup".into(),
                description: Some("Lookup a value".into()),
                parameters: json!({"type": "object"}),
            }]),
            tool_choice: Some(json!({"name": "lookup"})),
            response_format: None,
        }
    }

    #[test]
    fn builds_wire_request() {
        let body = build_request_body(&request(), false);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_output_tokens"], 100);
        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["previous_response_id"], "resp-prev");
        assert_eq!(body["input"].as_array().unwrap().len(), 2);

        let tool = &body["tools"][0];
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "lookup");

        assert_eq!(body["tool_choice"]["type"], "function");
        assert_eq!(body["tool_choice"]["function"]["name"], "lookup");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn stream_flag_is_set_for_streaming_calls() {
        let body = build_request_body(&request(), true);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn parses_unary_response_preserving_order() {
        let value = json!({
            "id": "resp-123",
            "created": 1700000000,
            "model": "gpt-4o",
            "output": [
                {"type": "reasoning", "content": "thinking...", "status": "completed"},
                {"type": "text", "text": "Hello"},
                {"type": "function_call", "call_id": "c1", "name": "lookup", "arguments": "{\"q\":1}"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}
        });

        let resp = parse_response(&value).unwrap();
        assert_eq!(resp.id, "resp-123");
        assert_eq!(resp.output.len(), 3);
        assert!(matches!(resp.output[0], OutputItem::Reasoning { .. }));
        assert!(matches!(resp.output[1], OutputItem::Text { .. }));
        assert!(
            matches!(&resp.output[2], OutputItem::ToolCall { id, name, .. } if id == "c1" && name == "lookup")
        );
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[test]
    fn parses_stream_frame_one_to_one() {
        let value = json!({
            "id": "resp-123",
            "created": 1,
            "model": "gpt-4o",
            "output": [{"type": "text", "text": "Hel"}]
        });
        let chunk = parse_chunk(&value).unwrap();
        assert_eq!(chunk.output, vec![OutputItem::Text { text: "Hel".into() }]);
        assert!(!chunk.is_final());

        let terminal = json!({
            "id": "resp-123",
            "created": 1,
            "model": "gpt-4o",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        });
        let chunk = parse_chunk(&terminal).unwrap();
        assert!(chunk.is_final());
        assert_eq!(chunk.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn http_error_body_maps_to_provider_call_error() {
        let err = provider_error(429, r#"{"error":{"type":"rate_limit","message":"slow down"}}"#);
        match &err {
            GatewayError::ProviderCall {
                status,
                provider_error_type,
                message,
            } => {
                assert_eq!(*status, 429);
                assert_eq!(provider_error_type, "rate_limit");
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
    }
}
