// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Common unified→upstream build (spec §4.4.1): the single builder both
//! dialect intakes funnel through on the way to the wire payload.

use gate_model::{Message, Role, Tool};
use serde_json::{json, Value};

use super::TranslateError;

/// A tool call recorded in `history`, lined up by id with a subsequent
/// `toolResults` entry (spec §3 invariant).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// Everything needed to build one upstream turn, independent of dialect.
pub struct UpstreamBuildInput<'a> {
    pub messages: &'a [Message],
    pub system: Option<&'a str>,
    pub model_id: &'a str,
    pub tools: &'a [Tool],
    pub conversation_id: &'a str,
    /// Only set for accounts in the simple-refresh credential family (§4.6).
    pub profile_arn: Option<&'a str>,
    pub inject_thinking: bool,
    pub max_thinking_length: u32,
    pub tool_description_max_length: usize,
}

/// Upstream rejects `required` and `additionalProperties` at the top level
/// of a tool's input schema; strip them before sending.
fn sanitize_input_schema(schema: &Value) -> Value {
    let mut v = schema.clone();
    if let Value::Object(map) = &mut v {
        map.remove("required");
        map.remove("additionalProperties");
    }
    v
}

/// Builds the `tools` array for `userInputMessageContext`, and returns any
/// `## Tool: {name}` sections that overlong descriptions must be relocated
/// into the current message's content (step 5).
fn build_tools(tools: &[Tool], max_description_len: usize) -> (Vec<Value>, String) {
    let mut out = Vec::with_capacity(tools.len());
    let mut relocated = String::new();
    for tool in tools {
        let description = if tool.description.trim().is_empty() {
            format!("Tool: {}", tool.name)
        } else {
            tool.description.clone()
        };
        let input_schema = sanitize_input_schema(&tool.input_schema);
        let description = if description.len() > max_description_len {
            relocated.push_str(&format!("\n\n## Tool: {}\n{}", tool.name, description));
            format!("[Full documentation in system prompt under '## Tool: {}']", tool.name)
        } else {
            description
        };
        out.push(json!({ "name": tool.name, "description": description, "inputSchema": input_schema }));
    }
    (out, relocated)
}

/// Builds one upstream turn from a unified message sequence. Returns
/// `invalid_request` if the sequence carries no user/assistant turn.
pub fn build_upstream_payload(input: UpstreamBuildInput<'_>) -> Result<Value, TranslateError> {
    let has_content_turn = input.messages.iter().any(|m| matches!(m.role, Some(Role::User) | Some(Role::Assistant)));
    if !has_content_turn {
        return Err(TranslateError::InvalidRequest("no user or assistant turn in request".into()));
    }

    let (history, current) = split_history_and_current(input.messages);

    let mut content = String::new();

    // Step 3: system prompt is only ever merged into the first translation
    // (there is no prior upstream conversation state for this builder to
    // compare against, so "first" here means "always", matching the
    // single-shot nature of this builder — callers that maintain
    // multi-request conversations must only pass `system` on the first call).
    if let Some(system) = input.system {
        if !system.is_empty() {
            content.push_str(system);
            content.push_str("\n\n");
        }
    }

    if input.inject_thinking {
        content.push_str(&format!(
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
            input.max_thinking_length
        ));
    }

    content.push_str(&current.text);

    let (tools_json, relocated_descriptions) = build_tools(input.tools, input.tool_description_max_length);
    content.push_str(&relocated_descriptions);

    let mut user_input_message_context = serde_json::Map::new();
    if !tools_json.is_empty() {
        user_input_message_context.insert("tools".into(), Value::Array(tools_json));
    }
    if !current.tool_results.is_empty() {
        let results: Vec<Value> = current
            .tool_results
            .iter()
            .map(|r| json!({ "toolUseId": r.tool_call_id, "content": [{ "text": r.content }] }))
            .collect();
        user_input_message_context.insert("toolResults".into(), Value::Array(results));
    }

    let mut user_input_message = serde_json::Map::new();
    user_input_message.insert("content".into(), Value::String(content));
    user_input_message.insert("modelId".into(), Value::String(input.model_id.to_string()));
    if !user_input_message_context.is_empty() {
        user_input_message.insert("userInputMessageContext".into(), Value::Object(user_input_message_context));
    }
    if !current.images.is_empty() {
        let images: Vec<Value> = current
            .images
            .iter()
            .map(|img| json!({ "format": image_format(&img.media_type), "source": { "bytes": img.data } }))
            .collect();
        user_input_message.insert("images".into(), Value::Array(images));
    }

    let mut payload = serde_json::Map::new();
    payload.insert("conversationId".into(), Value::String(input.conversation_id.to_string()));
    payload.insert("history".into(), Value::Array(history));
    payload.insert("currentMessage".into(), json!({ "userInputMessage": Value::Object(user_input_message) }));
    if let Some(arn) = input.profile_arn {
        payload.insert("profileArn".into(), Value::String(arn.to_string()));
    }

    Ok(Value::Object(payload))
}

/// Strips the leading `image/` prefix the wire format expects bare, e.g.
/// `image/png` → `png`.
fn image_format(media_type: &str) -> &str {
    media_type.strip_prefix("image/").unwrap_or(media_type)
}

struct CurrentMessage {
    text: String,
    tool_results: Vec<gate_model::ToolResult>,
    images: Vec<gate_model::ImagePart>,
}

/// Step 2: the last message becomes `currentMessage`; everything before it
/// becomes `history`. An assistant-last sequence (the caller is continuing a
/// conversation it already answered) synthesizes a `"Continue"` turn and
/// keeps the full sequence, including that last assistant turn, in history.
fn split_history_and_current(messages: &[Message]) -> (Vec<Value>, CurrentMessage) {
    let last_is_user = messages.last().map(|m| m.role == Some(Role::User)).unwrap_or(false);

    if last_is_user {
        let (head, tail) = messages.split_at(messages.len() - 1);
        let last = &tail[0];
        let history = head.iter().map(history_entry).collect();
        let current = CurrentMessage {
            text: last.text.clone().unwrap_or_default(),
            tool_results: last.tool_results.clone().unwrap_or_default(),
            images: last.images.clone().unwrap_or_default(),
        };
        (history, current)
    } else {
        let history = messages.iter().map(history_entry).collect();
        let current = CurrentMessage { text: "Continue".to_string(), tool_results: Vec::new(), images: Vec::new() };
        (history, current)
    }
}

fn history_entry(m: &Message) -> Value {
    match m.role {
        Some(Role::Assistant) => {
            let mut entry = serde_json::Map::new();
            entry.insert("content".into(), Value::String(m.text.clone().unwrap_or_default()));
            if let Some(calls) = &m.tool_calls {
                if !calls.is_empty() {
                    let tool_uses: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            let input: Value = serde_json::from_str(&c.arguments).unwrap_or(json!({}));
                            json!({ "toolUseId": c.id, "name": c.name, "input": input })
                        })
                        .collect();
                    entry.insert("toolUses".into(), Value::Array(tool_uses));
                }
            }
            json!({ "assistantResponseMessage": entry })
        }
        _ => {
            let mut entry = serde_json::Map::new();
            entry.insert("content".into(), Value::String(m.text.clone().unwrap_or_default()));
            if let Some(results) = &m.tool_results {
                if !results.is_empty() {
                    let results: Vec<Value> = results
                        .iter()
                        .map(|r| json!({ "toolUseId": r.tool_call_id, "content": [{ "text": r.content }] }))
                        .collect();
                    entry.insert(
                        "userInputMessageContext".into(),
                        json!({ "toolResults": results }),
                    );
                }
            }
            json!({ "userInputMessage": entry })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_model::ToolCall;

    fn base_input<'a>(messages: &'a [Message], tools: &'a [Tool]) -> UpstreamBuildInput<'a> {
        UpstreamBuildInput {
            messages,
            system: None,
            model_id: "claude-sonnet-4-5-internal",
            tools,
            conversation_id: "conv-1",
            profile_arn: None,
            inject_thinking: false,
            max_thinking_length: 8000,
            tool_description_max_length: 10_000,
        }
    }

    #[test]
    fn empty_sequence_is_invalid_request() {
        let err = build_upstream_payload(base_input(&[], &[])).unwrap_err();
        assert!(matches!(err, TranslateError::InvalidRequest(_)));
    }

    #[test]
    fn last_user_message_becomes_current_message() {
        let messages = vec![Message::user("hello")];
        let payload = build_upstream_payload(base_input(&messages, &[])).unwrap();
        assert_eq!(payload["history"].as_array().unwrap().len(), 0);
        assert_eq!(
            payload["currentMessage"]["userInputMessage"]["content"].as_str().unwrap(),
            "hello"
        );
    }

    #[test]
    fn assistant_last_synthesizes_continue_and_keeps_full_history() {
        let messages = vec![Message::user("hi"), Message::assistant("there")];
        let payload = build_upstream_payload(base_input(&messages, &[])).unwrap();
        assert_eq!(payload["history"].as_array().unwrap().len(), 2);
        assert_eq!(
            payload["currentMessage"]["userInputMessage"]["content"].as_str().unwrap(),
            "Continue"
        );
    }

    #[test]
    fn system_prompt_is_prepended_to_current_message() {
        let messages = vec![Message::user("hi")];
        let mut input = base_input(&messages, &[]);
        input.system = Some("be terse");
        let payload = build_upstream_payload(input).unwrap();
        assert!(payload["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap()
            .starts_with("be terse"));
    }

    #[test]
    fn thinking_injection_precedes_message_text() {
        let messages = vec![Message::user("hi")];
        let mut input = base_input(&messages, &[]);
        input.inject_thinking = true;
        let payload = build_upstream_payload(input).unwrap();
        let content = payload["currentMessage"]["userInputMessage"]["content"].as_str().unwrap();
        assert!(content.starts_with("<thinking_mode>enabled</thinking_mode><max_thinking_length>8000</max_thinking_length>"));
    }

    #[test]
    fn empty_tool_description_becomes_placeholder() {
        let tool = Tool { name: "search".into(), description: "   ".into(), input_schema: json!({}) };
        let messages = vec![Message::user("hi")];
        let payload = build_upstream_payload(base_input(&messages, std::slice::from_ref(&tool))).unwrap();
        let tools = payload["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"].as_array().unwrap();
        assert_eq!(tools[0]["description"].as_str().unwrap(), "Tool: search");
    }

    #[test]
    fn schema_strips_required_and_additional_properties() {
        let tool = Tool {
            name: "search".into(),
            description: "d".into(),
            input_schema: json!({ "type": "object", "required": ["q"], "additionalProperties": false }),
        };
        let messages = vec![Message::user("hi")];
        let payload = build_upstream_payload(base_input(&messages, std::slice::from_ref(&tool))).unwrap();
        let schema = &payload["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"][0]["inputSchema"];
        assert!(schema.get("required").is_none());
        assert!(schema.get("additionalProperties").is_none());
        assert_eq!(schema["type"], "object");
    }

    #[test]
    fn overlong_description_is_relocated_to_system_prompt_section() {
        let long = "x".repeat(10_001);
        let tool = Tool { name: "search".into(), description: long.clone(), input_schema: json!({}) };
        let messages = vec![Message::user("hi")];
        let mut input = base_input(&messages, std::slice::from_ref(&tool));
        input.tool_description_max_length = 10_000;
        let payload = build_upstream_payload(input).unwrap();
        let tools = payload["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"].as_array().unwrap();
        assert!(tools[0]["description"].as_str().unwrap().starts_with("[Full documentation in system prompt"));
        let content = payload["currentMessage"]["userInputMessage"]["content"].as_str().unwrap();
        assert!(content.contains("## Tool: search"));
        assert!(content.contains(&long));
    }

    #[test]
    fn tool_calls_become_history_tool_uses_lined_up_with_results() {
        let messages = vec![
            Message::user("search for rust"),
            Message::assistant_tool_calls(
                None,
                vec![ToolCall { id: "call_1".into(), name: "search".into(), arguments: r#"{"q":"rust"}"#.into() }],
            ),
            Message::user_tool_results(vec![gate_model::ToolResult {
                tool_call_id: "call_1".into(),
                content: "results".into(),
            }]),
        ];
        let payload = build_upstream_payload(base_input(&messages, &[])).unwrap();
        let history = payload["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        let tool_uses = history[1]["assistantResponseMessage"]["toolUses"].as_array().unwrap();
        assert_eq!(tool_uses[0]["toolUseId"].as_str().unwrap(), "call_1");
        let current_results =
            payload["currentMessage"]["userInputMessage"]["userInputMessageContext"]["toolResults"].as_array().unwrap();
        assert_eq!(current_results[0]["toolUseId"].as_str().unwrap(), "call_1");
    }

    #[test]
    fn profile_arn_only_present_when_supplied() {
        let messages = vec![Message::user("hi")];
        let without = build_upstream_payload(base_input(&messages, &[])).unwrap();
        assert!(without.get("profileArn").is_none());

        let mut input = base_input(&messages, &[]);
        input.profile_arn = Some("arn:aws:iam::0:role/x");
        let with = build_upstream_payload(input).unwrap();
        assert_eq!(with["profileArn"].as_str().unwrap(), "arn:aws:iam::0:role/x");
    }
}
