// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event-Stream Parser (C2): incrementally extracts JSON objects from the
//! upstream's byte stream and assembles tool calls across `tool_start` /
//! `tool_input` / `tool_stop` events.
//!
//! The upstream interleaves opaque binary framing with JSON objects; this
//! parser does not attempt to understand the framing, it just scans for
//! known object prefixes and brace-matches from there.

use serde_json::Value;
use uuid::Uuid;

/// A known event prefix and the logical event kind it introduces.
const EVENT_PATTERNS: &[(&str, &str)] = &[
    ("{\"content\":", "content"),
    ("{\"name\":", "tool_start"),
    ("{\"input\":", "tool_input"),
    ("{\"stop\":", "tool_stop"),
    ("{\"followupPrompt\":", "followup"),
    ("{\"usage\":", "usage"),
    ("{\"contextUsagePercentage\":", "context_usage"),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Content(String),
    Usage(f64),
    ContextUsage(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Canonical, re-serialized JSON arguments (always valid JSON, `"{}"` on
    /// any parse failure).
    pub arguments: String,
    pub truncated: Option<TruncationInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncationInfo {
    pub reason: String,
    pub size_bytes: usize,
}

/// Finds the byte index of the brace matching the `{` at byte index `start`,
/// respecting quoted strings and escape sequences. Returns `None` if
/// unbalanced (the caller should wait for more data to arrive).
pub fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    if text.as_bytes().get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text[start..].char_indices() {
        let pos = start + i;
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if c == '{' {
                depth += 1;
            } else if c == '}' {
                depth -= 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
        }
    }
    None
}

/// Scan `text` for `[Called name with args: { ... }]` patterns, returning
/// synthetic tool calls. Used as a fallback when the model emits tool calls
/// as plain text instead of structured events.
pub fn parse_bracket_tool_calls(text: &str) -> Vec<ToolCall> {
    if !text.contains("[Called") {
        return Vec::new();
    }
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").unwrap());
    let mut out = Vec::new();
    for caps in re.captures_iter(text) {
        let func_name = caps[1].to_string();
        let args_start = caps.get(0).unwrap().end();
        let Some(json_rel) = text[args_start..].find('{') else { continue };
        let json_start = args_start + json_rel;
        let Some(json_end) = find_matching_brace(text, json_start) else { continue };
        let json_str = &text[json_start..=json_end];
        match serde_json::from_str::<Value>(json_str) {
            Ok(v) => out.push(ToolCall {
                id: generate_tool_call_id(),
                name: func_name,
                arguments: v.to_string(),
                truncated: None,
            }),
            Err(_) => tracing::warn!(%func_name, "failed to parse bracket tool call arguments"),
        }
    }
    out
}

pub fn generate_tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Two-pass dedup: by id (keep the longest non-`"{}"` arguments), then by
/// exact `(name, arguments)` pair.
pub fn deduplicate_tool_calls(tool_calls: Vec<ToolCall>) -> Vec<ToolCall> {
    use std::collections::HashMap;

    let mut by_id: HashMap<String, ToolCall> = HashMap::new();
    let mut without_id = Vec::new();

    for tc in tool_calls {
        if tc.id.is_empty() {
            without_id.push(tc);
            continue;
        }
        match by_id.get(&tc.id) {
            None => {
                by_id.insert(tc.id.clone(), tc);
            }
            Some(existing) => {
                let better = tc.arguments != "{}"
                    && (existing.arguments == "{}" || tc.arguments.len() > existing.arguments.len());
                if better {
                    by_id.insert(tc.id.clone(), tc);
                }
            }
        }
    }

    let mut ordered: Vec<ToolCall> = by_id.into_values().collect();
    ordered.extend(without_id);

    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(ordered.len());
    for tc in ordered {
        let key = format!("{}-{}", tc.name, tc.arguments);
        if seen.insert(key) {
            unique.push(tc);
        }
    }
    unique
}

#[derive(Debug, Default)]
struct InProgressToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental parser over the upstream's event stream.
#[derive(Default)]
pub struct AwsEventStreamParser {
    buffer: String,
    last_content: Option<String>,
    current_tool_call: Option<InProgressToolCall>,
    tool_calls: Vec<ToolCall>,
}

impl AwsEventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of UTF-8 bytes (lossily decoded, matching the upstream's
    /// tolerance for partial multi-byte sequences at chunk boundaries).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParsedEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        loop {
            let mut earliest: Option<(usize, &'static str)> = None;
            for (pattern, kind) in EVENT_PATTERNS {
                if let Some(pos) = self.buffer.find(pattern) {
                    if earliest.map(|(p, _)| pos < p).unwrap_or(true) {
                        earliest = Some((pos, kind));
                    }
                }
            }
            let Some((pos, kind)) = earliest else { break };

            let Some(end) = find_matching_brace(&self.buffer, pos) else { break };
            let json_str = self.buffer[pos..=end].to_string();
            self.buffer.drain(..=end);

            match serde_json::from_str::<Value>(&json_str) {
                Ok(data) => {
                    if let Some(event) = self.process_event(&data, kind) {
                        events.push(event);
                    }
                }
                Err(_) => tracing::warn!(prefix = %&json_str[..json_str.len().min(100)], "failed to parse event JSON"),
            }
        }
        events
    }

    fn process_event(&mut self, data: &Value, kind: &str) -> Option<ParsedEvent> {
        match kind {
            "content" => self.process_content(data),
            "tool_start" => {
                self.process_tool_start(data);
                None
            }
            "tool_input" => {
                self.process_tool_input(data);
                None
            }
            "tool_stop" => {
                self.process_tool_stop(data);
                None
            }
            "usage" => Some(ParsedEvent::Usage(data.get("usage").and_then(Value::as_f64).unwrap_or(0.0))),
            "context_usage" => Some(ParsedEvent::ContextUsage(
                data.get("contextUsagePercentage").and_then(Value::as_f64).unwrap_or(0.0),
            )),
            _ => None,
        }
    }

    fn process_content(&mut self, data: &Value) -> Option<ParsedEvent> {
        if data.get("followupPrompt").map(|v| !v.is_null()).unwrap_or(false) {
            return None;
        }
        let content = data.get("content").and_then(Value::as_str).unwrap_or("").to_string();
        if self.last_content.as_deref() == Some(content.as_str()) {
            return None;
        }
        self.last_content = Some(content.clone());
        Some(ParsedEvent::Content(content))
    }

    fn process_tool_start(&mut self, data: &Value) {
        if self.current_tool_call.is_some() {
            self.finalize_tool_call();
        }
        let input_str = input_as_string(data.get("input"));
        self.current_tool_call = Some(InProgressToolCall {
            id: data
                .get("toolUseId")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(generate_tool_call_id),
            name: data.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
            arguments: input_str,
        });
        if data.get("stop").and_then(Value::as_bool).unwrap_or(false) {
            self.finalize_tool_call();
        }
    }

    fn process_tool_input(&mut self, data: &Value) {
        if let Some(current) = &mut self.current_tool_call {
            current.arguments.push_str(&input_as_string(data.get("input")));
        }
    }

    fn process_tool_stop(&mut self, data: &Value) {
        if self.current_tool_call.is_some() && data.get("stop").and_then(Value::as_bool).unwrap_or(false) {
            self.finalize_tool_call();
        }
    }

    fn finalize_tool_call(&mut self) {
        let Some(current) = self.current_tool_call.take() else { return };
        let trimmed = current.arguments.trim();

        let (arguments, truncated) = if trimmed.is_empty() {
            ("{}".to_string(), None)
        } else {
            match serde_json::from_str::<Value>(&current.arguments) {
                Ok(v) => (v.to_string(), None),
                Err(_) => {
                    let diag = diagnose_json_truncation(&current.arguments);
                    if diag.is_truncated {
                        tracing::error!(
                            tool = %current.name, id = %current.id, size = diag.size_bytes,
                            reason = %diag.reason, "tool call truncated by upstream"
                        );
                        ("{}".to_string(), Some(TruncationInfo { reason: diag.reason, size_bytes: diag.size_bytes }))
                    } else {
                        tracing::warn!(tool = %current.name, "failed to parse tool call arguments");
                        ("{}".to_string(), None)
                    }
                }
            }
        };

        self.tool_calls.push(ToolCall { id: current.id, name: current.name, arguments, truncated });
    }

    /// Returns all tool calls collected so far, finalizing any in-progress
    /// call and deduplicating. Also applies the bracket-tool-call fallback
    /// against `trailing_content` (the concatenated emitted text).
    pub fn finish(&mut self, trailing_content: &str) -> Vec<ToolCall> {
        if self.current_tool_call.is_some() {
            self.finalize_tool_call();
        }
        let mut all = std::mem::take(&mut self.tool_calls);
        all.extend(parse_bracket_tool_calls(trailing_content));
        deduplicate_tool_calls(all)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_content = None;
        self.current_tool_call = None;
        self.tool_calls.clear();
    }
}

fn input_as_string(input: Option<&Value>) -> String {
    match input {
        Some(v @ Value::Object(_)) => v.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

struct TruncationDiagnosis {
    is_truncated: bool,
    reason: String,
    size_bytes: usize,
}

/// Simple, non-quote-aware brace/bracket tally used only for the truncation
/// diagnostic — distinct from [`find_matching_brace`]'s precise scanner,
/// which is used for locating JSON object boundaries in the live stream.
fn diagnose_json_truncation(json_str: &str) -> TruncationDiagnosis {
    let size_bytes = json_str.len();
    let stripped = json_str.trim();

    if stripped.is_empty() {
        return TruncationDiagnosis { is_truncated: false, reason: "empty string".into(), size_bytes };
    }

    let open_braces = stripped.matches('{').count();
    let close_braces = stripped.matches('}').count();
    let open_brackets = stripped.matches('[').count();
    let close_brackets = stripped.matches(']').count();

    if stripped.starts_with('{') && !stripped.ends_with('}') {
        return TruncationDiagnosis {
            is_truncated: true,
            reason: format!("missing {} closing brace(s)", open_braces as i64 - close_braces as i64),
            size_bytes,
        };
    }
    if stripped.starts_with('[') && !stripped.ends_with(']') {
        return TruncationDiagnosis {
            is_truncated: true,
            reason: format!("missing {} closing bracket(s)", open_brackets as i64 - close_brackets as i64),
            size_bytes,
        };
    }
    if open_braces != close_braces {
        return TruncationDiagnosis {
            is_truncated: true,
            reason: format!("unbalanced braces ({open_braces} open, {close_braces} close)"),
            size_bytes,
        };
    }
    if open_brackets != close_brackets {
        return TruncationDiagnosis {
            is_truncated: true,
            reason: format!("unbalanced brackets ({open_brackets} open, {close_brackets} close)"),
            size_bytes,
        };
    }

    let mut quote_count = 0;
    let mut escape = false;
    for c in stripped.chars() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' {
            escape = true;
            continue;
        }
        if c == '"' {
            quote_count += 1;
        }
    }
    if quote_count % 2 != 0 {
        return TruncationDiagnosis { is_truncated: true, reason: "unclosed string literal".into(), size_bytes };
    }

    TruncationDiagnosis { is_truncated: false, reason: "malformed JSON".into(), size_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_simple_brace() {
        assert_eq!(find_matching_brace(r#"{"a": {"b": 1}}"#, 0), Some(14));
    }

    #[test]
    fn brace_inside_string_is_ignored() {
        assert_eq!(find_matching_brace(r#"{"a": "{}"}"#, 0), Some(10));
    }

    #[test]
    fn content_event_is_emitted() {
        let mut p = AwsEventStreamParser::new();
        let events = p.feed(br#"{"content": "hello"}"#);
        assert_eq!(events, vec![ParsedEvent::Content("hello".into())]);
    }

    #[test]
    fn duplicate_content_is_dropped() {
        let mut p = AwsEventStreamParser::new();
        p.feed(br#"{"content": "hello"}"#);
        let events = p.feed(br#"{"content": "hello"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn partial_event_waits_for_more_data() {
        let mut p = AwsEventStreamParser::new();
        let events = p.feed(br#"{"content": "hel"#);
        assert!(events.is_empty());
        let events = p.feed(br#"lo"}"#);
        assert_eq!(events, vec![ParsedEvent::Content("hello".into())]);
    }

    #[test]
    fn tool_call_assembled_across_events() {
        let mut p = AwsEventStreamParser::new();
        p.feed(br#"{"name": "search", "toolUseId": "t1", "input": "{\"q"}"#);
        p.feed(br#"{"input": "\": \"rust\"}"}"#);
        p.feed(br#"{"stop": true}"#);
        let calls = p.finish("");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, r#"{"q":"rust"}"#);
    }

    #[test]
    fn truncated_arguments_are_flagged_and_replaced_with_empty_object() {
        let mut p = AwsEventStreamParser::new();
        p.feed(br#"{"name": "search", "toolUseId": "t1", "input": "{\"q\": \"rust"}"#);
        p.feed(br#"{"stop": true}"#);
        let calls = p.finish("");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, "{}");
        assert!(calls[0].truncated.is_some());
    }

    #[test]
    fn empty_arguments_string_is_benign_not_truncated() {
        let mut p = AwsEventStreamParser::new();
        p.feed(br#"{"name": "noop", "toolUseId": "t2", "input": ""}"#);
        p.feed(br#"{"stop": true}"#);
        let calls = p.finish("");
        assert_eq!(calls[0].arguments, "{}");
        assert!(calls[0].truncated.is_none());
    }

    #[test]
    fn bracket_fallback_extracts_synthetic_tool_call() {
        let text = r#"[Called get_weather with args: {"city": "London"}]"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, r#"{"city":"London"}"#);
    }

    #[test]
    fn dedup_by_id_keeps_longest_non_empty_arguments() {
        let calls = vec![
            ToolCall { id: "1".into(), name: "f".into(), arguments: "{}".into(), truncated: None },
            ToolCall { id: "1".into(), name: "f".into(), arguments: r#"{"a":1}"#.into(), truncated: None },
        ];
        let deduped = deduplicate_tool_calls(calls);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].arguments, r#"{"a":1}"#);
    }

    #[test]
    fn dedup_by_name_and_arguments_drops_exact_duplicates() {
        let calls = vec![
            ToolCall { id: "".into(), name: "f".into(), arguments: "{}".into(), truncated: None },
            ToolCall { id: "".into(), name: "f".into(), arguments: "{}".into(), truncated: None },
        ];
        assert_eq!(deduplicate_tool_calls(calls).len(), 1);
    }

    #[test]
    fn diagnosis_detects_missing_closing_brace() {
        let diag = diagnose_json_truncation(r#"{"a": "rust"#);
        assert!(diag.is_truncated);
        assert!(diag.reason.contains("closing brace"));
    }

    #[test]
    fn diagnosis_detects_unclosed_string() {
        let diag = diagnose_json_truncation(r#"{"a": "unterminated}"#);
        assert!(diag.is_truncated);
    }
}
