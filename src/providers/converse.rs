//! "Converse"-style provider adapter (Bedrock-equivalent backend).
//!
//! Canonical messages map to the Converse API's typed content blocks
//! (`text`, `toolUse`, `toolResult`) with system text split into a separate
//! top-level field, sampling parameters mapped into `inferenceConfig`, and
//! tool definitions mapped to `toolSpec` entries. Calls go through the SDK's
//! `Converse` and `ConverseStream` operations; stream events (`messageStart`,
//! `contentBlockDelta`, `contentBlockStop`, `messageStop`, `metadata`) are
//! folded into canonical chunks, one per delta plus a final usage-bearing
//! chunk once the message has stopped. Transport and SigV4 signing are
//! handled by the AWS SDK.

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamChunk, CanonicalUsage, OutputItem,
};
use crate::providers::{ChunkStream, ProviderAdapter};
use crate::util::now_secs;
use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::BuildError;
use aws_sdk_bedrockruntime::types::{
    AnyToolChoice, AutoToolChoice, ContentBlock, ContentBlockDelta, ContentBlockStart,
    ConversationRole, ConverseStreamOutput, InferenceConfiguration, Message, SpecificToolChoice,
    SystemContentBlock, TokenUsage, Tool, ToolChoice, ToolConfiguration, ToolInputSchema,
    ToolResultBlock, ToolResultContentBlock, ToolResultStatus, ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::{Document, Number as DocumentNumber};
use serde_json::{json, Value};

pub struct ConverseAdapter {
    region: String,
}

impl ConverseAdapter {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }

    pub fn from_env() -> Self {
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());
        Self::new(region)
    }

    async fn client(&self) -> aws_sdk_bedrockruntime::Client {
        use aws_config::BehaviorVersion;
        use aws_sdk_bedrockruntime::config::Region;

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .load()
            .await;
        aws_sdk_bedrockruntime::Client::new(&sdk_config)
    }
}

#[async_trait]
impl ProviderAdapter for ConverseAdapter {
    fn name(&self) -> &'static str {
        "converse"
    }

    async fn create_response(&self, request: &CanonicalRequest) -> GatewayResult<CanonicalResponse> {
        let wire = build_converse_request(request)?;

        let client = self.client().await;
        let response = client
            .converse()
            .model_id(&request.model)
            .set_system(if wire.system.is_empty() {
                None
            } else {
                Some(wire.system)
            })
            .set_messages(Some(wire.messages))
            .inference_config(wire.inference_config)
            .set_tool_config(wire.tool_config)
            .send()
            .await
            .map_err(|e| GatewayError::transport(format!("converse invocation failed: {e}")))?;

        let message = response
            .output()
            .and_then(|o| o.as_message().ok())
            .ok_or_else(|| {
                GatewayError::provider_call(0, "protocol", "response missing output message")
            })?;
        Ok(parse_converse_message(
            message,
            response.usage(),
            &request.model,
        ))
    }

    async fn create_response_stream(
        &self,
        request: &CanonicalRequest,
    ) -> GatewayResult<ChunkStream> {
        let wire = build_converse_request(request)?;

        let client = self.client().await;
        let response = client
            .converse_stream()
            .model_id(&request.model)
            .set_system(if wire.system.is_empty() {
                None
            } else {
                Some(wire.system)
            })
            .set_messages(Some(wire.messages))
            .inference_config(wire.inference_config)
            .set_tool_config(wire.tool_config)
            .send()
            .await
            .map_err(|e| {
                GatewayError::transport(format!("converse stream invocation failed: {e}"))
            })?;

        let mut events = response.stream;
        let mut folder = ConverseStreamFolder::new(&request.model);

        let stream = async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(Some(event)) => {
                        for out in folder.fold(&event) {
                            yield Ok(out);
                        }
                    }
                    Ok(None) => {
                        if let Some(final_chunk) = folder.finish() {
                            yield Ok(final_chunk);
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(GatewayError::transport(format!("stream error: {e}")));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Typed Converse request parts built from a canonical request.
pub struct ConverseRequest {
    pub system: Vec<SystemContentBlock>,
    pub messages: Vec<Message>,
    pub inference_config: InferenceConfiguration,
    pub tool_config: Option<ToolConfiguration>,
}

/// Map a canonical request onto the Converse operation's typed input.
pub fn build_converse_request(request: &CanonicalRequest) -> GatewayResult<ConverseRequest> {
    let mut system: Vec<SystemContentBlock> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for msg in request.input.messages() {
        match msg.role.as_str() {
            "system" => {
                let text = msg.content_text();
                if !text.is_empty() {
                    system.push(SystemContentBlock::Text(text));
                }
            }
            "tool" => {
                // Tool results travel as user messages with a toolResult block.
                let result = ToolResultBlock::builder()
                    .tool_use_id(msg.tool_call_id.clone().unwrap_or_default())
                    .content(ToolResultContentBlock::Text(msg.content_text()))
                    .status(ToolResultStatus::Success)
                    .build()
                    .map_err(build_error)?;
                messages.push(
                    Message::builder()
                        .role(ConversationRole::User)
                        .content(ContentBlock::ToolResult(result))
                        .build()
                        .map_err(build_error)?,
                );
            }
            role => {
                let mut content: Vec<ContentBlock> = Vec::new();
                let text = msg.content_text();
                if !text.is_empty() {
                    content.push(ContentBlock::Text(text));
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        let input: Value =
                            serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                        let block = ToolUseBlock::builder()
                            .tool_use_id(&call.id)
                            .name(&call.name)
                            .input(value_to_document(&input))
                            .build()
                            .map_err(build_error)?;
                        content.push(ContentBlock::ToolUse(block));
                    }
                }
                if content.is_empty() {
                    continue;
                }
                let role = if role == "assistant" {
                    ConversationRole::Assistant
                } else {
                    ConversationRole::User
                };
                messages.push(
                    Message::builder()
                        .role(role)
                        .set_content(Some(content))
                        .build()
                        .map_err(build_error)?,
                );
            }
        }
    }

    if messages.is_empty() {
        return Err(GatewayError::MalformedRequest(
            "no non-system messages to send".into(),
        ));
    }

    let inference_config = InferenceConfiguration::builder()
        .set_max_tokens(request.max_output_tokens.map(|n| n as i32))
        .set_temperature(request.temperature.map(|t| t as f32))
        .set_top_p(request.top_p.map(|p| p as f32))
        .set_stop_sequences(request.stop_sequences.clone())
        .build();

    let tool_config = match &request.tools {
        Some(tools) if !tools.is_empty() => {
            let specs = tools
                .iter()
                .map(|t| {
                    let spec = ToolSpecification::builder()
                        .name(&t.name)
                        .set_description(t.description.clone())
                        .input_schema(ToolInputSchema::Json(value_to_document(&t.parameters)))
                        .build()
                        .map_err(build_error)?;
                    Ok(Tool::ToolSpec(spec))
                })
                .collect::<GatewayResult<Vec<_>>>()?;
            Some(
                ToolConfiguration::builder()
                    .set_tools(Some(specs))
                    .set_tool_choice(
                        request
                            .tool_choice
                            .as_ref()
                            .map(map_tool_choice)
                            .transpose()?,
                    )
                    .build()
                    .map_err(build_error)?,
            )
        }
        _ => None,
    };

    Ok(ConverseRequest {
        system,
        messages,
        inference_config,
        tool_config,
    })
}

fn build_error(err: BuildError) -> GatewayError {
    GatewayError::MalformedRequest(err.to_string())
}

fn map_tool_choice(choice: &Value) -> GatewayResult<ToolChoice> {
    if let Some(name) = choice.get("name").and_then(|n| n.as_str()) {
        let specific = SpecificToolChoice::builder()
            .name(name)
            .build()
            .map_err(build_error)?;
        return Ok(ToolChoice::Tool(specific));
    }
    Ok(match choice.as_str() {
        Some("required") | Some("any") => ToolChoice::Any(AnyToolChoice::builder().build()),
        // "none" has no Converse equivalent; auto is the closest behavior.
        _ => ToolChoice::Auto(AutoToolChoice::builder().build()),
    })
}

/// Map a Converse output message and usage into the canonical shape.
pub fn parse_converse_message(
    message: &Message,
    usage: Option<&TokenUsage>,
    model: &str,
) -> CanonicalResponse {
    let mut output: Vec<OutputItem> = Vec::new();
    for block in message.content() {
        match block {
            ContentBlock::Text(text) => output.push(OutputItem::Text { text: text.clone() }),
            ContentBlock::ToolUse(tool_use) => output.push(OutputItem::ToolCall {
                id: tool_use.tool_use_id().to_string(),
                name: tool_use.name().to_string(),
                arguments: document_to_value(tool_use.input()).to_string(),
            }),
            ContentBlock::ToolResult(result) => output.push(OutputItem::ToolResult {
                tool_call_id: result.tool_use_id().to_string(),
                content: result
                    .content()
                    .iter()
                    .filter_map(|c| c.as_text().ok().cloned())
                    .collect::<Vec<_>>()
                    .join("\n"),
            }),
            _ => {}
        }
    }

    CanonicalResponse {
        id: format!("resp-{}", uuid::Uuid::new_v4().simple()),
        created: now_secs(),
        model: model.to_string(),
        output,
        usage: usage.map(canonical_usage),
    }
}

fn canonical_usage(usage: &TokenUsage) -> CanonicalUsage {
    CanonicalUsage {
        input_tokens: usage.input_tokens().max(0) as u64,
        output_tokens: usage.output_tokens().max(0) as u64,
        total_tokens: usage.total_tokens().max(0) as u64,
    }
}

/// The Converse tool schema travels as a smithy document rather than JSON.
fn value_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(DocumentNumber::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(DocumentNumber::NegInt(i))
            } else {
                Document::Number(DocumentNumber::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(value_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_document(v)))
                .collect(),
        ),
    }
}

fn document_to_value(document: &Document) -> Value {
    match document {
        Document::Null => Value::Null,
        Document::Bool(b) => json!(b),
        Document::Number(DocumentNumber::PosInt(u)) => json!(u),
        Document::Number(DocumentNumber::NegInt(i)) => json!(i),
        Document::Number(DocumentNumber::Float(f)) => json!(f),
        Document::String(s) => json!(s),
        Document::Array(items) => Value::Array(items.iter().map(document_to_value).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_value(v)))
                .collect(),
        ),
    }
}

/// Folds Converse stream events into canonical chunks.
///
/// Pure state machine so the event mapping is testable without a live
/// event stream: deltas produce one chunk each, `messageStop` arms the
/// terminal chunk, and the usage from `metadata` completes it.
pub struct ConverseStreamFolder {
    response_id: String,
    model: String,
    created: u64,
    /// Tool-use block currently being streamed, if any.
    pending_tool: Option<(String, String, String)>,
    message_stopped: bool,
    usage: Option<CanonicalUsage>,
    finished: bool,
}

impl ConverseStreamFolder {
    pub fn new(model: &str) -> Self {
        Self {
            response_id: format!("resp-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: now_secs(),
            pending_tool: None,
            message_stopped: false,
            usage: None,
            finished: false,
        }
    }

    fn chunk(&self, output: Vec<OutputItem>, usage: Option<CanonicalUsage>) -> CanonicalStreamChunk {
        CanonicalStreamChunk {
            id: self.response_id.clone(),
            created: self.created,
            model: self.model.clone(),
            output,
            usage,
        }
    }

    /// Fold one stream event, emitting zero or more canonical chunks.
    pub fn fold(&mut self, event: &ConverseStreamOutput) -> Vec<CanonicalStreamChunk> {
        match event {
            // Role announcement only; nothing canonical to emit yet.
            ConverseStreamOutput::MessageStart(_) => Vec::new(),
            ConverseStreamOutput::ContentBlockStart(start) => {
                if let Some(ContentBlockStart::ToolUse(tool)) = start.start() {
                    self.tool_use_start(tool.tool_use_id(), tool.name());
                }
                Vec::new()
            }
            ConverseStreamOutput::ContentBlockDelta(event) => match event.delta() {
                Some(ContentBlockDelta::Text(text)) => self.text_delta(text),
                Some(ContentBlockDelta::ToolUse(partial)) => {
                    self.tool_use_delta(partial.input());
                    Vec::new()
                }
                _ => Vec::new(),
            },
            ConverseStreamOutput::ContentBlockStop(_) => self.content_block_stop(),
            ConverseStreamOutput::MessageStop(_) => self.message_stop(),
            ConverseStreamOutput::Metadata(metadata) => {
                self.metadata(metadata.usage().map(canonical_usage))
            }
            _ => Vec::new(),
        }
    }

    /// A text delta becomes one canonical chunk.
    pub fn text_delta(&mut self, text: &str) -> Vec<CanonicalStreamChunk> {
        vec![self.chunk(
            vec![OutputItem::Text {
                text: text.to_string(),
            }],
            None,
        )]
    }

    /// Arms a streaming tool-use block; its arguments accumulate until the
    /// block stops.
    pub fn tool_use_start(&mut self, id: &str, name: &str) {
        self.pending_tool = Some((id.to_string(), name.to_string(), String::new()));
    }

    pub fn tool_use_delta(&mut self, partial: &str) {
        if let Some((_, _, args)) = self.pending_tool.as_mut() {
            args.push_str(partial);
        }
    }

    /// Closing a block emits the accumulated tool call, if one was streaming.
    pub fn content_block_stop(&mut self) -> Vec<CanonicalStreamChunk> {
        match self.pending_tool.take() {
            Some((id, name, args)) => vec![self.chunk(
                vec![OutputItem::ToolCall {
                    id,
                    name,
                    arguments: if args.is_empty() { "{}".to_string() } else { args },
                }],
                None,
            )],
            None => Vec::new(),
        }
    }

    pub fn message_stop(&mut self) -> Vec<CanonicalStreamChunk> {
        self.message_stopped = true;
        self.try_finish().into_iter().collect()
    }

    pub fn metadata(&mut self, usage: Option<CanonicalUsage>) -> Vec<CanonicalStreamChunk> {
        if let Some(usage) = usage {
            self.usage = Some(usage);
        }
        self.try_finish().into_iter().collect()
    }

    /// Emit the terminal usage chunk once both `messageStop` and the usage
    /// metadata have arrived.
    fn try_finish(&mut self) -> Option<CanonicalStreamChunk> {
        if self.finished || !self.message_stopped {
            return None;
        }
        let usage = self.usage.clone()?;
        self.finished = true;
        Some(self.chunk(vec![], Some(usage)))
    }

    /// Close out the stream at end-of-events even if usage never arrived.
    pub fn finish(&mut self) -> Option<CanonicalStreamChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.chunk(vec![], Some(self.usage.clone().unwrap_or_default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalInput, CanonicalMessage, CanonicalTool, CanonicalToolCall};
    use serde_json::json;

    fn request_with_messages(messages: Vec<CanonicalMessage>) -> CanonicalRequest {
        CanonicalRequest {
            model: "anthropic.claude-3-5-sonnet-20241022-v2:0".into(),
            input: CanonicalInput::Messages(messages),
            max_output_tokens: Some(256),
            reasoning_effort: None,
            stream: None,
            temperature: Some(0.5),
            top_p: Some(0.9),
            stop_sequences: Some(vec!["END".into()]),
            previous_response_id: None,
            tools: None,
            tool_choice: None,
            response_format: None,
        }
    }

    #[test]
    fn splits_system_and_builds_inference_config() {
        let req = request_with_messages(vec![
            CanonicalMessage::text("system", "Be helpful."),
            CanonicalMessage::text("user", "write a function"),
        ]);
        let wire = build_converse_request(&req).unwrap();

        assert_eq!(
            wire.system,
            vec![SystemContentBlock::Text("Be helpful.".into())]
        );
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role(), &ConversationRole::User);
        assert_eq!(
            wire.messages[0].content(),
            [ContentBlock::Text("write a function".into())]
        );

        let cfg = &wire.inference_config;
        assert_eq!(cfg.max_tokens(), Some(256));
        assert_eq!(cfg.temperature(), Some(0.5));
        assert_eq!(cfg.top_p(), Some(0.9));
        assert_eq!(cfg.stop_sequences(), ["END"]);
    }

    #[test]
    fn maps_tools_to_tool_spec_and_auto_choice() {
        let mut req = request_with_messages(vec![CanonicalMessage::text("user", "weather?")]);
        req.tools = Some(vec![CanonicalTool {
            name: "get_weather".into(),
            description: Some("Get weather".into()),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }]);
        req.tool_choice = Some(json!("auto"));

        let wire = build_converse_request(&req).unwrap();
        let config = wire.tool_config.expect("tool config expected");

        let spec = config.tools()[0].as_tool_spec().unwrap();
        assert_eq!(spec.name(), "get_weather");
        assert!(matches!(
            spec.input_schema(),
            Some(ToolInputSchema::Json(Document::Object(_)))
        ));
        assert!(matches!(config.tool_choice(), Some(ToolChoice::Auto(_))));
    }

    #[test]
    fn maps_tool_calls_and_results() {
        let req = request_with_messages(vec![
            CanonicalMessage::text("user", "weather?"),
            CanonicalMessage {
                role: "assistant".into(),
                content: json!("checking"),
                tool_call_id: None,
                tool_calls: Some(vec![CanonicalToolCall {
                    id: "t1".into(),
                    name: "get_weather".into(),
                    arguments: r#"{"city":"Oslo"}"#.into(),
                }]),
            },
            CanonicalMessage {
                role: "tool".into(),
                content: json!("raining"),
                tool_call_id: Some("t1".into()),
                tool_calls: None,
            },
        ]);

        let wire = build_converse_request(&req).unwrap();
        assert_eq!(wire.messages.len(), 3);

        let assistant = &wire.messages[1];
        assert_eq!(assistant.role(), &ConversationRole::Assistant);
        let tool_use = assistant.content()[1].as_tool_use().unwrap();
        assert_eq!(tool_use.name(), "get_weather");
        assert_eq!(document_to_value(tool_use.input())["city"], "Oslo");

        let result_msg = &wire.messages[2];
        assert_eq!(result_msg.role(), &ConversationRole::User);
        let result = result_msg.content()[0].as_tool_result().unwrap();
        assert_eq!(result.tool_use_id(), "t1");
        assert_eq!(result.content()[0].as_text().unwrap(), "raining");
    }

    #[test]
    fn rejects_request_without_sendable_messages() {
        let req = request_with_messages(vec![CanonicalMessage::text("system", "only system")]);
        assert!(build_converse_request(&req).is_err());
    }

    #[test]
    fn parses_output_message() {
        let message = Message::builder()
            .role(ConversationRole::Assistant)
            .content(ContentBlock::Text("Hello".into()))
            .content(ContentBlock::ToolUse(
                ToolUseBlock::builder()
                    .tool_use_id("t1")
                    .name("lookup")
                    .input(value_to_document(&json!({"q": 1})))
                    .build()
                    .unwrap(),
            ))
            .build()
            .unwrap();
        let usage = TokenUsage::builder()
            .input_tokens(12)
            .output_tokens(7)
            .total_tokens(19)
            .build()
            .unwrap();

        let resp = parse_converse_message(&message, Some(&usage), "model-x");
        assert_eq!(resp.output.len(), 2);
        assert!(matches!(&resp.output[0], OutputItem::Text { text } if text == "Hello"));
        match &resp.output[1] {
            OutputItem::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "lookup");
                let args: Value = serde_json::from_str(arguments).unwrap();
                assert_eq!(args["q"], 1);
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert_eq!(resp.usage.unwrap().total_tokens, 19);
    }

    #[test]
    fn document_mapping_preserves_json() {
        let value = json!({
            "type": "object",
            "properties": {"city": {"type": "string"}, "days": {"type": "integer"}},
            "required": ["city"],
            "strict": true
        });
        assert_eq!(document_to_value(&value_to_document(&value)), value);
    }

    #[test]
    fn folds_stream_events_in_order() {
        let mut folder = ConverseStreamFolder::new("model-x");

        let chunks = folder.text_delta("Hel");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].output, vec![OutputItem::Text { text: "Hel".into() }]);

        let chunks = folder.text_delta("lo");
        assert_eq!(chunks[0].output, vec![OutputItem::Text { text: "lo".into() }]);

        assert!(folder.content_block_stop().is_empty());

        // message stop alone does not finish the stream; usage must arrive.
        assert!(folder.message_stop().is_empty());

        let chunks = folder.metadata(Some(CanonicalUsage {
            input_tokens: 4,
            output_tokens: 2,
            total_tokens: 6,
        }));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final());
        assert_eq!(chunks[0].usage.as_ref().unwrap().total_tokens, 6);

        // The folder never emits a second terminal chunk.
        assert!(folder.finish().is_none());
    }

    #[test]
    fn folds_streamed_tool_use() {
        let mut folder = ConverseStreamFolder::new("model-x");

        folder.tool_use_start("t9", "run");
        folder.tool_use_delta("{\"cmd\":");
        folder.tool_use_delta("\"ls\"}");

        let chunks = folder.content_block_stop();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].output,
            vec![OutputItem::ToolCall {
                id: "t9".into(),
                name: "run".into(),
                arguments: "{\"cmd\":\"ls\"}".into(),
            }]
        );
    }

    #[test]
    fn stream_without_metadata_closes_with_zeroed_usage() {
        let mut folder = ConverseStreamFolder::new("model-x");
        folder.text_delta("partial");
        assert!(folder.message_stop().is_empty());

        let final_chunk = folder.finish().expect("terminal chunk expected");
        assert!(final_chunk.is_final());
        assert_eq!(final_chunk.usage.unwrap().total_tokens, 0);
    }
}
