//! Inbound format detection.
//!
//! Classifies a request body as one of the two supported client dialects by
//! evaluating two independent indicator sets. Content-block indicators take
//! precedence when both sets are present; a body with no indicators from
//! either set defaults to the content-block dialect. Pure function, never
//! fails: malformed input degrades to the default and is rejected later by
//! the request processor.

use crate::models::{ClientProtocol, IncomingRequest};
use serde_json::Value;

/// Classify an inbound request.
pub fn detect_format(request: &IncomingRequest) -> ClientProtocol {
    if has_content_block_indicators(request) {
        return ClientProtocol::ContentBlock;
    }
    if has_flat_message_indicators(&request.body) {
        return ClientProtocol::FlatMessage;
    }
    ClientProtocol::ContentBlock
}

/// The outbound wire dialect for a detected protocol. Identity map: the
/// response always uses the request's dialect.
pub fn response_format_for(protocol: ClientProtocol) -> ClientProtocol {
    protocol
}

fn has_content_block_indicators(request: &IncomingRequest) -> bool {
    if request.header("anthropic-version").is_some() {
        return true;
    }

    let Some(body) = request.body.as_object() else {
        return false;
    };

    if body.contains_key("system") || body.contains_key("max_tokens") {
        return true;
    }

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        // Block-array message content is the defining shape of this dialect.
        if messages.iter().any(|m| {
            m.get("content").map(|c| c.is_array()).unwrap_or(false)
        }) {
            return true;
        }
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        if tools.iter().any(|t| {
            t.get("input_schema").is_some()
                && t.get("name").is_some()
                && t.get("function").is_none()
        }) {
            return true;
        }
    }

    false
}

fn has_flat_message_indicators(body: &Value) -> bool {
    let Some(body) = body.as_object() else {
        return false;
    };

    if body.contains_key("max_completion_tokens") || body.contains_key("response_format") {
        return true;
    }

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        if messages
            .iter()
            .any(|m| m.get("role").and_then(|r| r.as_str()) == Some("tool"))
        {
            return true;
        }
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        if tools.iter().any(|t| {
            t.get("type").and_then(|v| v.as_str()) == Some("function")
                && t.get("function").is_some()
        }) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> IncomingRequest {
        IncomingRequest::new(Vec::<(String, String)>::new(), body, "/v1/completions")
    }

    #[test]
    fn detects_content_block_from_block_content() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);
    }

    #[test]
    fn detects_content_block_from_system_and_max_tokens() {
        let req = request(json!({"model": "m", "system": "be brief", "messages": []}));
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);

        let req = request(json!({"model": "m", "max_tokens": 100, "messages": []}));
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);
    }

    #[test]
    fn detects_content_block_from_version_header() {
        let req = IncomingRequest::new(
            vec![("anthropic-version".to_string(), "2023-06-01".to_string())],
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
            "/v1/completions",
        );
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);
    }

    #[test]
    fn detects_content_block_tool_shape() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "lookup", "description": "d", "input_schema": {"type": "object"}}]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);
    }

    #[test]
    fn detects_flat_message_from_max_completion_tokens() {
        let req = request(json!({
            "model": "m",
            "max_completion_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::FlatMessage);
    }

    #[test]
    fn detects_flat_message_from_tool_role_and_function_tools() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": "calling"},
                {"role": "tool", "content": "42", "tool_call_id": "c1"}
            ]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::FlatMessage);

        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {}}}]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::FlatMessage);
    }

    #[test]
    fn detects_flat_message_from_response_format() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "json_object"}
        }));
        assert_eq!(detect_format(&req), ClientProtocol::FlatMessage);
    }

    #[test]
    fn content_block_wins_when_both_sets_present() {
        // Tie-break law: max_tokens (A) together with response_format (B).
        let req = request(json!({
            "model": "m",
            "max_tokens": 100,
            "response_format": {"type": "json_object"},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(detect_format(&req), ClientProtocol::ContentBlock);
    }

    #[test]
    fn defaults_to_content_block_on_empty_or_ambiguous_body() {
        assert_eq!(detect_format(&request(json!({}))), ClientProtocol::ContentBlock);
        assert_eq!(detect_format(&request(Value::Null)), ClientProtocol::ContentBlock);
        assert_eq!(
            detect_format(&request(json!("not an object"))),
            ClientProtocol::ContentBlock
        );
        assert_eq!(
            detect_format(&request(json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}]
            }))),
            ClientProtocol::ContentBlock
        );
    }

    #[test]
    fn response_format_is_identity() {
        assert_eq!(
            response_format_for(ClientProtocol::ContentBlock),
            ClientProtocol::ContentBlock
        );
        assert_eq!(
            response_format_for(ClientProtocol::FlatMessage),
            ClientProtocol::FlatMessage
        );
    }
}
