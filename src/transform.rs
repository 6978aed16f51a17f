//! Response transformer: canonical results back into the caller's dialect.
//!
//! The protocol is symmetric, so whichever dialect the detector assigned to
//! the request decides the shape written here. Unary responses become one
//! JSON body; streams become SSE frames with the dialect's own framing
//! (named events for the content-block dialect, `chat.completion.chunk`
//! deltas plus a `[DONE]` sentinel for the flat-message dialect). Output
//! item ordering is preserved exactly as the provider produced it.

use crate::errors::GatewayError;
use crate::models::{
    CanonicalResponse, CanonicalStreamChunk, ClientProtocol, OutputItem, ReasoningStatus,
};
use serde_json::{json, Value};

/// One server-sent-events frame, ready to write to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    fn named(event: &'static str, data: &Value) -> Self {
        Self {
            event: Some(event),
            data: data.to_string(),
        }
    }

    fn data_only(data: String) -> Self {
        Self { event: None, data }
    }

    /// Wire encoding: optional `event:` line, `data:` line, blank separator.
    pub fn to_wire(&self) -> String {
        match self.event {
            Some(event) => format!("event: {event}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Render a unary canonical response in the given dialect.
pub fn transform_response(protocol: ClientProtocol, response: &CanonicalResponse) -> Value {
    match protocol {
        ClientProtocol::ContentBlock => content_block_response(response),
        ClientProtocol::FlatMessage => flat_message_response(response),
    }
}

/// Render a terminal error in the given dialect's error envelope.
pub fn transform_error(protocol: ClientProtocol, error: &GatewayError) -> Value {
    match protocol {
        ClientProtocol::ContentBlock => json!({
            "type": "error",
            "error": {
                "type": error.code(),
                "message": error.to_string(),
            }
        }),
        ClientProtocol::FlatMessage => json!({
            "error": {
                "message": error.to_string(),
                "type": error.code(),
                "code": error.code(),
            }
        }),
    }
}

fn content_block_response(response: &CanonicalResponse) -> Value {
    let content: Vec<Value> = response.output.iter().map(content_block_item).collect();
    let stop_reason = if response.tool_calls().is_empty() {
        "end_turn"
    } else {
        "tool_use"
    };

    let mut body = json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
    });
    if let Some(usage) = &response.usage {
        body["usage"] = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });
    }
    body
}

fn content_block_item(item: &OutputItem) -> Value {
    match item {
        OutputItem::Text { text } => json!({ "type": "text", "text": text }),
        OutputItem::Reasoning { content, status } => json!({
            "type": "thinking",
            "thinking": content,
            "status": match status {
                ReasoningStatus::InProgress => "in_progress",
                ReasoningStatus::Completed => "completed",
            }
        }),
        OutputItem::ToolCall { id, name, arguments } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": serde_json::from_str::<Value>(arguments).unwrap_or(json!({})),
        }),
        OutputItem::ToolResult {
            tool_call_id,
            content,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": content,
        }),
    }
}

fn flat_message_response(response: &CanonicalResponse) -> Value {
    let text = response.output_text();
    let tool_calls = flat_tool_calls(&response.output);

    let mut message = json!({ "role": "assistant" });
    message["content"] = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        message["tool_calls"] = Value::Array(tool_calls);
        "tool_calls"
    };

    let mut body = json!({
        "id": response.id,
        "object": "chat.completion",
        "created": response.created,
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = &response.usage {
        body["usage"] = json!({
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        });
    }
    body
}

fn flat_tool_calls(output: &[OutputItem]) -> Vec<Value> {
    output
        .iter()
        .filter_map(|item| match item {
            OutputItem::ToolCall { id, name, arguments } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": arguments },
            })),
            _ => None,
        })
        .collect()
}

/// Stateful SSE renderer for one streamed response.
///
/// The content-block dialect needs opening and closing envelope events
/// around the deltas, so the renderer tracks whether the message and the
/// current block have been announced. One renderer per response; frames
/// must be written in the order returned.
pub struct StreamRenderer {
    protocol: ClientProtocol,
    message_started: bool,
    block_open: bool,
    block_index: u32,
    /// Whether a tool call has been rendered; decides the terminal
    /// stop/finish reason.
    tool_call_streamed: bool,
    done: bool,
}

impl StreamRenderer {
    pub fn new(protocol: ClientProtocol) -> Self {
        Self {
            protocol,
            message_started: false,
            block_open: false,
            block_index: 0,
            tool_call_streamed: false,
            done: false,
        }
    }

    pub fn render(&mut self, chunk: &CanonicalStreamChunk) -> Vec<SseFrame> {
        match self.protocol {
            ClientProtocol::ContentBlock => self.render_content_block(chunk),
            ClientProtocol::FlatMessage => self.render_flat_message(chunk),
        }
    }

    /// Frames that close the stream. Idempotent; also emitted automatically
    /// when the final usage-bearing chunk is rendered.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        match self.protocol {
            ClientProtocol::ContentBlock => {
                let mut frames = Vec::new();
                if self.block_open {
                    frames.push(SseFrame::named(
                        "content_block_stop",
                        &json!({ "type": "content_block_stop", "index": self.block_index }),
                    ));
                    self.block_open = false;
                }
                frames.push(SseFrame::named(
                    "message_stop",
                    &json!({ "type": "message_stop" }),
                ));
                frames
            }
            ClientProtocol::FlatMessage => vec![SseFrame::data_only("[DONE]".to_string())],
        }
    }

    fn render_content_block(&mut self, chunk: &CanonicalStreamChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }

        if !self.message_started {
            self.message_started = true;
            frames.push(SseFrame::named(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": chunk.id,
                        "type": "message",
                        "role": "assistant",
                        "model": chunk.model,
                        "content": [],
                    }
                }),
            ));
        }

        for item in &chunk.output {
            match item {
                OutputItem::Text { text } => {
                    if !self.block_open {
                        self.block_open = true;
                        frames.push(SseFrame::named(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": self.block_index,
                                "content_block": { "type": "text", "text": "" },
                            }),
                        ));
                    }
                    frames.push(SseFrame::named(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "text_delta", "text": text },
                        }),
                    ));
                }
                OutputItem::Reasoning { content, .. } => {
                    if !self.block_open {
                        self.block_open = true;
                        frames.push(SseFrame::named(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": self.block_index,
                                "content_block": { "type": "thinking", "thinking": "" },
                            }),
                        ));
                    }
                    frames.push(SseFrame::named(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "thinking_delta", "thinking": content },
                        }),
                    ));
                }
                other => {
                    // Tool calls arrive whole; emit them as a complete block.
                    if matches!(other, OutputItem::ToolCall { .. }) {
                        self.tool_call_streamed = true;
                    }
                    if self.block_open {
                        frames.push(SseFrame::named(
                            "content_block_stop",
                            &json!({ "type": "content_block_stop", "index": self.block_index }),
                        ));
                        self.block_open = false;
                        self.block_index += 1;
                    }
                    frames.push(SseFrame::named(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": content_block_item(other),
                        }),
                    ));
                    frames.push(SseFrame::named(
                        "content_block_stop",
                        &json!({ "type": "content_block_stop", "index": self.block_index }),
                    ));
                    self.block_index += 1;
                }
            }
        }

        if let Some(usage) = &chunk.usage {
            if self.block_open {
                frames.push(SseFrame::named(
                    "content_block_stop",
                    &json!({ "type": "content_block_stop", "index": self.block_index }),
                ));
                self.block_open = false;
            }
            let stop_reason = if self.tool_call_streamed {
                "tool_use"
            } else {
                "end_turn"
            };
            frames.push(SseFrame::named(
                "message_delta",
                &json!({
                    "type": "message_delta",
                    "delta": { "stop_reason": stop_reason, "stop_sequence": Value::Null },
                    "usage": { "output_tokens": usage.output_tokens },
                }),
            ));
            frames.push(SseFrame::named(
                "message_stop",
                &json!({ "type": "message_stop" }),
            ));
            self.done = true;
        }
        frames
    }

    fn render_flat_message(&mut self, chunk: &CanonicalStreamChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }

        for item in &chunk.output {
            let mut delta = match item {
                OutputItem::Text { text } => json!({ "content": text }),
                OutputItem::Reasoning { content, .. } => json!({ "reasoning_content": content }),
                OutputItem::ToolCall { id, name, arguments } => {
                    self.tool_call_streamed = true;
                    json!({
                        "tool_calls": [{
                            "index": 0,
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments },
                        }]
                    })
                }
                OutputItem::ToolResult { .. } => continue,
            };
            // The role is announced once, on the opening delta.
            if !self.message_started {
                self.message_started = true;
                delta["role"] = json!("assistant");
            }
            frames.push(SseFrame::data_only(
                json!({
                    "id": chunk.id,
                    "object": "chat.completion.chunk",
                    "created": chunk.created,
                    "model": chunk.model,
                    "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
                })
                .to_string(),
            ));
        }

        if let Some(usage) = &chunk.usage {
            let finish_reason = if self.tool_call_streamed {
                "tool_calls"
            } else {
                "stop"
            };
            let delta = if self.message_started {
                json!({})
            } else {
                json!({ "role": "assistant" })
            };
            frames.push(SseFrame::data_only(
                json!({
                    "id": chunk.id,
                    "object": "chat.completion.chunk",
                    "created": chunk.created,
                    "model": chunk.model,
                    "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
                    "usage": {
                        "prompt_tokens": usage.input_tokens,
                        "completion_tokens": usage.output_tokens,
                        "total_tokens": usage.total_tokens,
                    },
                })
                .to_string(),
            ));
            frames.push(SseFrame::data_only("[DONE]".to_string()));
            self.done = true;
        }
        frames
    }
}
