// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-dialect intake (spec §4.4.2): decode a `/v1/chat/completions` body
//! into a [`UnifiedRequest`].

use gate_model::{ImagePart, Message, Tool, ToolCall, ToolResult};
use serde_json::Value;

use super::{TranslateError, UnifiedRequest};

pub fn from_openai_request(body: &Value) -> Result<UnifiedRequest, TranslateError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| TranslateError::InvalidRequest("missing model".into()))?
        .to_string();

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    let temperature = body.get("temperature").and_then(Value::as_f64).map(|v| v as f32);

    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| TranslateError::InvalidRequest("missing messages".into()))?;

    let mut system_parts = Vec::new();
    for m in raw_messages {
        if m.get("role").and_then(Value::as_str) == Some("system") {
            if let Some(text) = m.get("content").and_then(Value::as_str) {
                system_parts.push(text.to_string());
            }
        }
    }
    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n"));

    let messages = convert_openai_messages(raw_messages);
    let tools = body.get("tools").and_then(Value::as_array).map(|t| convert_openai_tools(t)).unwrap_or_default();

    Ok(UnifiedRequest { model, messages, system, tools, stream, max_tokens, temperature })
}

fn convert_openai_messages(raw: &[Value]) -> Vec<Message> {
    let mut out = Vec::new();
    let mut pending_tool_results: Vec<ToolResult> = Vec::new();
    let mut pending_tool_images: Vec<ImagePart> = Vec::new();

    let flush_tool_results = |out: &mut Vec<Message>, pending: &mut Vec<ToolResult>, images: &mut Vec<ImagePart>| {
        if !pending.is_empty() {
            out.push(Message::user_tool_results(std::mem::take(pending)).with_images(std::mem::take(images)));
        }
    };

    for m in raw {
        let role = m.get("role").and_then(Value::as_str).unwrap_or("");
        match role {
            "system" => continue,
            "tool" => {
                let tool_call_id = m.get("tool_call_id").and_then(Value::as_str).unwrap_or("").to_string();
                let (text, images) = extract_user_content(m.get("content"));
                let content = if text.is_empty() { "(empty result)".to_string() } else { text };
                pending_tool_results.push(ToolResult { tool_call_id, content });
                pending_tool_images.extend(images);
            }
            "user" => {
                flush_tool_results(&mut out, &mut pending_tool_results, &mut pending_tool_images);
                let (text, images) = extract_user_content(m.get("content"));
                out.push(Message::user(text).with_images(images));
            }
            "assistant" => {
                flush_tool_results(&mut out, &mut pending_tool_results, &mut pending_tool_images);
                let text = extract_text_content(m.get("content"));
                let calls = m
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| calls.iter().filter_map(convert_openai_tool_call).collect::<Vec<_>>())
                    .unwrap_or_default();
                if calls.is_empty() {
                    out.push(Message::assistant(text.unwrap_or_default()));
                } else {
                    out.push(Message::assistant_tool_calls(text, calls));
                }
            }
            _ => {}
        }
    }
    flush_tool_results(&mut out, &mut pending_tool_results, &mut pending_tool_images);
    out
}

fn convert_openai_tool_call(v: &Value) -> Option<ToolCall> {
    let id = v.get("id").and_then(Value::as_str)?.to_string();
    let func = v.get("function")?;
    let name = func.get("name").and_then(Value::as_str)?.to_string();
    let arguments = func.get("arguments").and_then(Value::as_str).unwrap_or("{}").to_string();
    Some(ToolCall { id, name, arguments })
}

fn extract_text_content(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            Some(text)
        }
        _ => None,
    }
}

/// Extract text and `image_url` blocks from a user message's content, which
/// may be a bare string or a list of typed content parts (also covering the
/// MCP-style tool-result-as-user-message shape).
fn extract_user_content(content: Option<&Value>) -> (String, Vec<ImagePart>) {
    match content {
        Some(Value::String(s)) => (s.clone(), Vec::new()),
        Some(Value::Array(parts)) => {
            let mut text = String::new();
            let mut images = Vec::new();
            for p in parts {
                match p.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = p.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    Some("image_url") => {
                        if let Some(url) = p.get("image_url").and_then(|i| i.get("url")).and_then(Value::as_str) {
                            images.push(ImagePart::from_url(url));
                        }
                    }
                    _ => {}
                }
            }
            (text, images)
        }
        _ => (String::new(), Vec::new()),
    }
}

/// Accepts both the standard nested form and the flat Cursor-style form;
/// nested wins if both are present. Invalid entries are skipped.
fn convert_openai_tools(raw: &[Value]) -> Vec<Tool> {
    raw.iter().filter_map(convert_openai_tool).collect()
}

fn convert_openai_tool(v: &Value) -> Option<Tool> {
    if let Some(func) = v.get("function") {
        let name = func.get("name").and_then(Value::as_str)?.to_string();
        let description = func.get("description").and_then(Value::as_str).unwrap_or("").to_string();
        let input_schema = func.get("parameters").cloned().unwrap_or(Value::Object(Default::default()));
        return Some(Tool { name, description, input_schema });
    }
    let name = v.get("name").and_then(Value::as_str)?.to_string();
    let description = v.get("description").and_then(Value::as_str).unwrap_or("").to_string();
    let input_schema = v.get("input_schema").cloned().unwrap_or(Value::Object(Default::default()));
    Some(Tool { name, description, input_schema })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn concatenates_system_messages() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "first"},
                {"role": "system", "content": "second"},
                {"role": "user", "content": "hi"},
            ]
        });
        let req = from_openai_request(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn consecutive_tool_messages_merge_into_one_synthetic_user_message() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "a", "arguments": "{}"}},
                    {"id": "c2", "type": "function", "function": {"name": "b", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "r1"},
                {"role": "tool", "tool_call_id": "c2", "content": ""},
            ]
        });
        let req = from_openai_request(&body).unwrap();
        let last = req.messages.last().unwrap();
        let results = last.tool_results.as_ref().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "r1");
        assert_eq!(results[1].content, "(empty result)");
    }

    #[test]
    fn flat_cursor_style_tool_is_accepted() {
        let tools = json!([{"type": "function", "name": "search", "description": "d", "input_schema": {}}]);
        let converted = convert_openai_tools(tools.as_array().unwrap());
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].name, "search");
    }

    #[test]
    fn nested_form_wins_when_both_present() {
        let tools = json!([{
            "type": "function",
            "name": "flat-name",
            "function": {"name": "nested-name", "description": "d", "parameters": {}}
        }]);
        let converted = convert_openai_tools(tools.as_array().unwrap());
        assert_eq!(converted[0].name, "nested-name");
    }

    #[test]
    fn extracts_images_from_user_content_parts() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
                ]
            }]
        });
        let req = from_openai_request(&body).unwrap();
        let images = req.messages[0].images.as_ref().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].media_type, "image/png");
    }

    #[test]
    fn extracts_images_from_mcp_style_tool_message() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "screenshot", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": [
                    {"type": "text", "text": "here's the screenshot"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
                ]},
            ]
        });
        let req = from_openai_request(&body).unwrap();
        let last = req.messages.last().unwrap();
        let results = last.tool_results.as_ref().unwrap();
        assert_eq!(results[0].content, "here's the screenshot");
        let images = last.images.as_ref().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].media_type, "image/png");
    }
}
