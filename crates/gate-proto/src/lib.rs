// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dialect-agnostic protocol plumbing: the upstream event-stream parser
//! (C2), the embedded-thinking-tag parser (C3), the OpenAI/Anthropic
//! request translators (C4), and the two streaming re-emitters (C5).

pub mod emit;
pub mod event_stream;
pub mod thinking;
pub mod translate;

pub use emit::accounting::{finalize_usage, pre_estimate_tokens, UsageSource, UsageTotals};
pub use emit::anthropic::AnthropicEmitter;
pub use emit::openai::OpenAiEmitter;
pub use emit::{retry_until_first_byte, FinishReason, FirstByteOutcome};
pub use event_stream::{
    deduplicate_tool_calls, generate_tool_call_id, parse_bracket_tool_calls, AwsEventStreamParser, ParsedEvent,
    ToolCall, TruncationInfo,
};
pub use thinking::{ThinkingEvent, ThinkingMode, ThinkingParser};
pub use translate::anthropic::from_anthropic_request;
pub use translate::openai::from_openai_request;
pub use translate::upstream::{build_upstream_payload, UpstreamBuildInput};
pub use translate::{TranslateError, UnifiedRequest};
