// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic-dialect typed SSE emitter (spec §4.5): `message_start`,
//! `content_block_{start,delta,stop}` triples, `message_delta`,
//! `message_stop`. Thinking is always block index 0 when present; text
//! follows; tool-use blocks follow that, each with its own index.

use serde_json::{json, Value};

use crate::event_stream::ToolCall;
use crate::emit::accounting::UsageTotals;
use crate::emit::FinishReason;

fn event(name: &str, data: Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

pub struct AnthropicEmitter {
    id: String,
    model: String,
    next_index: u32,
    thinking_opened: bool,
    text_opened: bool,
}

impl AnthropicEmitter {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { id: id.into(), model: model.into(), next_index: 0, thinking_opened: false, text_opened: false }
    }

    pub fn message_start(&self) -> String {
        event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                },
            }),
        )
    }

    /// Opens the thinking block at index 0. Must be called at most once,
    /// before any other block.
    pub fn open_thinking_block(&mut self) -> String {
        debug_assert_eq!(self.next_index, 0, "thinking block must be opened first");
        self.thinking_opened = true;
        let idx = self.next_index;
        self.next_index += 1;
        event(
            "content_block_start",
            json!({ "type": "content_block_start", "index": idx, "content_block": { "type": "thinking", "thinking": "" } }),
        )
    }

    pub fn thinking_delta(&self, text: &str) -> String {
        debug_assert!(self.thinking_opened, "thinking block must be opened before deltas");
        event(
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": text } }),
        )
    }

    pub fn close_thinking_block(&mut self) -> String {
        self.thinking_opened = false;
        event("content_block_stop", json!({ "type": "content_block_stop", "index": 0 }))
    }

    /// Whether the thinking block (index 0) is currently open — i.e. has
    /// been started but not yet stopped. Lets callers interleaving thinking
    /// and text deltas decide when to emit the closing frame.
    pub fn is_thinking_open(&self) -> bool {
        self.thinking_opened
    }

    /// Opens the text block, which follows thinking (if any) at the next
    /// available index.
    pub fn open_text_block(&mut self) -> (u32, String) {
        self.text_opened = true;
        let idx = self.next_index;
        self.next_index += 1;
        let frame = event(
            "content_block_start",
            json!({ "type": "content_block_start", "index": idx, "content_block": { "type": "text", "text": "" } }),
        );
        (idx, frame)
    }

    pub fn text_delta(&self, index: u32, text: &str) -> String {
        event(
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": { "type": "text_delta", "text": text } }),
        )
    }

    pub fn close_block(&self, index: u32) -> String {
        event("content_block_stop", json!({ "type": "content_block_stop", "index": index }))
    }

    /// Opens a tool-use block and emits its arguments as a single
    /// `input_json_delta` frame, then closes it. Returns the three frames
    /// plus the index assigned, which callers don't normally need but which
    /// lets tests assert on ordering.
    pub fn tool_use_block(&mut self, call: &ToolCall) -> (u32, [String; 3]) {
        let idx = self.next_index;
        self.next_index += 1;
        let start = event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": idx,
                "content_block": { "type": "tool_use", "id": call.id, "name": call.name, "input": {} },
            }),
        );
        let delta = event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": idx,
                "delta": { "type": "input_json_delta", "partial_json": call.arguments },
            }),
        );
        let stop = self.close_block(idx);
        (idx, [start, delta, stop])
    }

    pub fn message_delta(&self, reason: FinishReason, usage: UsageTotals) -> String {
        let stop_reason = match reason {
            FinishReason::ToolCalls => "tool_use",
            FinishReason::Stop => "end_turn",
        };
        event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": usage.completion_tokens },
            }),
        )
    }

    pub fn message_stop(&self) -> String {
        event("message_stop", json!({ "type": "message_stop" }))
    }

    /// Typed `error` event used both for first-token-timeout exhaustion and
    /// mid-stream failure (spec §4.5).
    pub fn error_event(error_type: &str, message: &str) -> String {
        event(
            "error",
            json!({ "type": "error", "error": { "type": error_type, "message": message } }),
        )
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
    fn thinking_block_is_always_index_zero() {
        let mut emitter = AnthropicEmitter::new("msg_1", "claude-sonnet-4-5");
        let start = emitter.open_thinking_block();
        assert!(start.contains(r#""index":0"#));
        assert!(start.contains(r#""type":"thinking""#));
    }

    #[test]
    fn text_block_follows_thinking_at_next_index() {
        let mut emitter = AnthropicEmitter::new("msg_1", "model");
        emitter.open_thinking_block();
        let (idx, frame) = emitter.open_text_block();
        assert_eq!(idx, 1);
        assert!(frame.contains(r#""index":1"#));
    }

    #[test]
    fn tool_use_block_emits_single_input_json_delta_frame() {
        let mut emitter = AnthropicEmitter::new("msg_1", "model");
        let call = ToolCall { id: "call_1".into(), name: "search".into(), arguments: r#"{"q":"rust"}"#.into(), truncated: None };
        let (idx, [start, delta, stop]) = emitter.tool_use_block(&call);
        assert_eq!(idx, 0);
        assert!(start.contains(r#""type":"tool_use""#));
        assert!(delta.contains(r#""type":"input_json_delta""#));
        assert!(delta.contains(r#"partial_json":"{\"q\":\"rust\"}""#));
        assert!(stop.contains(r#""index":0"#));
    }

    #[test]
    fn message_delta_maps_tool_calls_to_tool_use_stop_reason() {
        let emitter = AnthropicEmitter::new("msg_1", "model");
        let frame = emitter.message_delta(FinishReason::ToolCalls, usage());
        assert!(frame.contains(r#""stop_reason":"tool_use""#));
    }

    #[test]
    fn error_event_carries_type_and_message() {
        let frame = AnthropicEmitter::error_event("timeout_error", "no first token within deadline");
        assert!(frame.starts_with("event: error\n"));
        assert!(frame.contains("timeout_error"));
    }
}
