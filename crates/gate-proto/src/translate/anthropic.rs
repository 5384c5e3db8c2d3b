// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic-dialect intake (spec §4.4.3): decode a `/v1/messages` body into
//! a [`UnifiedRequest`]. Grounded on the upstream's own Anthropic-shaped
//! converter: `system` and `content` are each either a bare string or a list
//! of typed blocks, and cache-control annotations on those blocks are
//! informational only and get dropped during extraction.

use gate_model::{ImagePart, Message, Tool, ToolCall, ToolResult};
use serde_json::Value;

use super::{TranslateError, UnifiedRequest};

pub fn from_anthropic_request(body: &Value) -> Result<UnifiedRequest, TranslateError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| TranslateError::InvalidRequest("missing model".into()))?
        .to_string();

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let max_tokens = body.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32);
    let temperature = body.get("temperature").and_then(Value::as_f64).map(|v| v as f32);

    let system = extract_system_prompt(body.get("system"));

    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| TranslateError::InvalidRequest("missing messages".into()))?;
    let messages = convert_anthropic_messages(raw_messages);

    let tools = body.get("tools").and_then(Value::as_array).map(|t| convert_anthropic_tools(t)).unwrap_or_default();

    Ok(UnifiedRequest { model, messages, system, tools, stream, max_tokens, temperature })
}

/// `system` is a bare string, or a list of text blocks each possibly
/// carrying a `cache_control` annotation that is dropped here.
fn extract_system_prompt(system: Option<&Value>) -> Option<String> {
    match system {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn convert_anthropic_content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn extract_images_from_content(content: &Value) -> Vec<ImagePart> {
    let Value::Array(blocks) = content else { return Vec::new() };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("image"))
        .filter_map(|b| {
            let source = b.get("source")?;
            let media_type = source.get("media_type").and_then(Value::as_str)?.to_string();
            let data = source.get("data").and_then(Value::as_str)?.to_string();
            Some(ImagePart { media_type, data })
        })
        .collect()
}

fn extract_tool_uses(content: &Value) -> Vec<ToolCall> {
    let Value::Array(blocks) = content else { return Vec::new() };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter_map(|b| {
            let id = b.get("id").and_then(Value::as_str)?.to_string();
            let name = b.get("name").and_then(Value::as_str)?.to_string();
            let arguments = b.get("input").cloned().unwrap_or(Value::Object(Default::default())).to_string();
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

/// `tool_result` blocks inside a user message's content; an empty result
/// content becomes `"(empty result)"`. These blocks may themselves contain
/// nested images, which are surfaced separately.
fn extract_tool_results(content: &Value) -> (Vec<ToolResult>, Vec<ImagePart>) {
    let Value::Array(blocks) = content else { return (Vec::new(), Vec::new()) };
    let mut results = Vec::new();
    let mut images = Vec::new();
    for b in blocks {
        if b.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let tool_call_id = b.get("tool_use_id").and_then(Value::as_str).unwrap_or("").to_string();
        let inner = b.get("content").cloned().unwrap_or(Value::Null);
        let text = convert_anthropic_content_to_text(&inner);
        let content = if text.is_empty() { "(empty result)".to_string() } else { text };
        results.push(ToolResult { tool_call_id, content });
        images.extend(extract_images_from_content(&inner));
    }
    (results, images)
}

fn convert_anthropic_messages(raw: &[Value]) -> Vec<Message> {
    let mut out = Vec::new();
    for m in raw {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("");
        let Some(content) = m.get("content") else { continue };
        match role {
            "assistant" => {
                let text = convert_anthropic_content_to_text(content);
                let calls = extract_tool_uses(content);
                if calls.is_empty() {
                    out.push(Message::assistant(text));
                } else {
                    let text = (!text.is_empty()).then_some(text);
                    out.push(Message::assistant_tool_calls(text, calls));
                }
            }
            "user" => {
                let (tool_results, tool_images) = extract_tool_results(content);
                if !tool_results.is_empty() {
                    out.push(Message::user_tool_results(tool_results).with_images(tool_images));
                } else {
                    let text = convert_anthropic_content_to_text(content);
                    let images = extract_images_from_content(content);
                    out.push(Message::user(text).with_images(images));
                }
            }
            _ => {}
        }
    }
    out
}

fn convert_anthropic_tools(raw: &[Value]) -> Vec<Tool> {
    raw.iter()
        .filter_map(|t| {
            let name = t.get("name").and_then(Value::as_str)?.to_string();
            let description = t.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let input_schema = t.get("input_schema").cloned().unwrap_or(Value::Object(Default::default()));
            Some(Tool { name, description, input_schema })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_string_is_used_verbatim() {
        assert_eq!(extract_system_prompt(Some(&json!("be helpful"))), Some("be helpful".to_string()));
    }

    #[test]
    fn system_blocks_drop_cache_control_and_join_text() {
        let system = json!([
            {"type": "text", "text": "part one", "cache_control": {"type": "ephemeral"}},
            {"type": "text", "text": "part two"}
        ]);
        assert_eq!(extract_system_prompt(Some(&system)), Some("part one\npart two".to_string()));
    }

    #[test]
    fn assistant_tool_use_block_becomes_tool_call() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "rust"}}
                ]
            }]
        });
        let req = from_anthropic_request(&body).unwrap();
        let calls = req.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn user_tool_result_with_nested_image_surfaces_both() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "t1",
                    "content": [
                        {"type": "text", "text": "here is a screenshot"},
                        {"type": "image", "source": {"media_type": "image/png", "data": "QUJD"}}
                    ]
                }]
            }]
        });
        let req = from_anthropic_request(&body).unwrap();
        let results = req.messages[0].tool_results.as_ref().unwrap();
        assert_eq!(results[0].content, "here is a screenshot");
        assert_eq!(req.messages[0].images.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn empty_tool_result_becomes_placeholder() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "t1", "content": ""}]
            }]
        });
        let req = from_anthropic_request(&body).unwrap();
        assert_eq!(req.messages[0].tool_results.as_ref().unwrap()[0].content, "(empty result)");
    }

    #[test]
    fn tools_map_directly() {
        let tools = json!([{"name": "search", "description": "d", "input_schema": {"type": "object"}}]);
        let converted = convert_anthropic_tools(tools.as_array().unwrap());
        assert_eq!(converted[0].name, "search");
        assert_eq!(converted[0].description, "d");
    }
}
