// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-dialect SSE emitter (spec §4.5): `chat.completion.chunk` frames
//! terminated by `data: [DONE]`.

use serde_json::{json, Value};

use crate::event_stream::ToolCall;
use crate::emit::accounting::UsageTotals;
use crate::emit::FinishReason;

pub struct OpenAiEmitter {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl OpenAiEmitter {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self { id: id.into(), model: model.into(), created, role_sent: false }
    }

    fn frame(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> String {
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        format!("data: {}\n\n", body)
    }

    /// First chunk: `delta.role = "assistant"`, no content yet.
    pub fn role_frame(&mut self) -> String {
        self.role_sent = true;
        self.frame(json!({ "role": "assistant" }), None, None)
    }

    pub fn content_delta(&mut self, text: &str) -> String {
        if !self.role_sent {
            self.role_sent = true;
        }
        self.frame(json!({ "content": text }), None, None)
    }

    /// Thinking text under `as_reasoning_content` mode.
    pub fn reasoning_delta(&mut self, text: &str) -> String {
        self.frame(json!({ "reasoning_content": text }), None, None)
    }

    /// One frame carrying every tool call, each assigned a monotonic index.
    pub fn tool_calls_frame(&mut self, calls: &[ToolCall]) -> String {
        let tool_calls: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                json!({
                    "index": index,
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
        self.frame(json!({ "tool_calls": tool_calls }), None, None)
    }

    /// Penultimate chunk: empty delta, `finish_reason`, and `usage`.
    pub fn finish_frame(&mut self, reason: FinishReason, usage: UsageTotals) -> String {
        let finish_reason = match reason {
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Stop => "stop",
        };
        let usage = json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        });
        self.frame(json!({}), Some(finish_reason), Some(usage))
    }

    pub fn done_frame() -> &'static str {
        "data: [DONE]\n\n"
    }

    /// Best-effort terminal frame for mid-stream failure (spec §4.5
    /// "Failure mid-stream"): a bare `[DONE]` with no finish_reason claim,
    /// since the client has already received a partial response.
    pub fn abort_frame() -> &'static str {
        Self::done_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::accounting::UsageSource;

    fn usage() -> UsageTotals {
        UsageTotals { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15, source: UsageSource::LocalEstimate }
    }

    #[test]
    fn role_frame_carries_assistant_role_and_no_finish_reason() {
        let mut emitter = OpenAiEmitter::new("chatcmpl-1", "claude-sonnet-4-5", 1_700_000_000);
        let frame = emitter.role_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.contains(r#""role":"assistant""#));
        assert!(frame.contains(r#""finish_reason":null"#));
    }

    #[test]
    fn tool_calls_get_monotonic_index() {
        let mut emitter = OpenAiEmitter::new("id", "model", 0);
        let calls = vec![
            ToolCall { id: "c1".into(), name: "a".into(), arguments: "{}".into(), truncated: None },
            ToolCall { id: "c2".into(), name: "b".into(), arguments: "{}".into(), truncated: None },
        ];
        let frame = emitter.tool_calls_frame(&calls);
        assert!(frame.contains(r#""index":0"#));
        assert!(frame.contains(r#""index":1"#));
    }

    #[test]
    fn finish_frame_reports_tool_calls_when_present() {
        let mut emitter = OpenAiEmitter::new("id", "model", 0);
        let frame = emitter.finish_frame(FinishReason::ToolCalls, usage());
        assert!(frame.contains(r#""finish_reason":"tool_calls""#));
        assert!(frame.contains(r#""total_tokens":15"#));
    }

    #[test]
    fn done_frame_is_the_literal_sentinel() {
        assert_eq!(OpenAiEmitter::done_frame(), "data: [DONE]\n\n");
    }
}
