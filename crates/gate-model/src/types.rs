// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The unified message and tool vocabulary both dialect intakes (C4) convert
//! into, and the upstream payload builder consumes.

use serde::{Deserialize, Serialize};

/// One image attachment, always carried as a data URL or a remote HTTPS URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImagePart {
    pub media_type: String,
    /// Base64-encoded bytes, or the URL itself when the original was a
    /// remote reference rather than a data URL.
    pub data: String,
}

impl ImagePart {
    /// Parse a `data:<mime>;base64,<b64>` URL into an [`ImagePart`].
    /// Non-data-URLs are kept verbatim in `data` with an empty media type,
    /// so callers can still forward them to a provider that accepts raw URLs.
    pub fn from_url(url: &str) -> Self {
        match parse_data_url_parts(url) {
            Ok((media_type, data)) => Self { media_type, data },
            Err(_) => Self { media_type: String::new(), data: url.to_string() },
        }
    }
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>` and return
/// `Ok((mime_type, base64_string))`. Returns `Err` for non-data-URLs.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool call the assistant asked to have performed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object (already serialized, not re-parsed here).
    pub arguments: String,
}

/// The outcome of a previously requested tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
}

/// A single turn in the conversation.
///
/// Invariant (spec §3): a message may carry `tool_calls` **or**
/// `tool_results`, never both. [`Message::new`] enforces this at
/// construction; there is no way to build a message that violates it other
/// than mutating the fields directly, which callers should not do.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: Option<Role>,
    pub text: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolResult>>,
    pub images: Option<Vec<ImagePart>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Some(Role::User), text: Some(text.into()), ..Default::default() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Some(Role::Assistant), text: Some(text.into()), ..Default::default() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Some(Role::System), text: Some(text.into()), ..Default::default() }
    }

    /// Assistant turn carrying one or more tool calls (and optionally text).
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Some(Role::Assistant),
            text,
            tool_calls: Some(calls),
            ..Default::default()
        }
    }

    /// Synthetic user turn carrying one or more tool results.
    pub fn user_tool_results(results: Vec<ToolResult>) -> Self {
        Self { role: Some(Role::User), tool_results: Some(results), ..Default::default() }
    }

    pub fn with_images(mut self, images: Vec<ImagePart>) -> Self {
        if !images.is_empty() {
            self.images = Some(images);
        }
        self
    }

    pub fn is_tool_call_carrier(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn is_tool_result_carrier(&self) -> bool {
        self.tool_results.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Approximate token count, used by the local-estimator token-accounting
    /// fallback (SPEC_FULL.md §10.4) when the upstream did not report
    /// `context_usage`.
    pub fn approx_chars(&self) -> usize {
        let mut n = self.text.as_deref().map(str::len).unwrap_or(0);
        if let Some(calls) = &self.tool_calls {
            n += calls.iter().map(|c| c.name.len() + c.arguments.len()).sum::<usize>();
        }
        if let Some(results) = &self.tool_results {
            n += results.iter().map(|r| r.content.len()).sum::<usize>();
        }
        // Images are cheap in character terms but expensive in tokens; the
        // caller (gate-proto's estimator) adds a flat per-image surcharge
        // on top of this, matching the teacher's OpenAI detail-level table.
        n
    }
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input object.
    pub input_schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_has_no_tool_fields() {
        let m = Message::user("hi");
        assert_eq!(m.role, Some(Role::User));
        assert_eq!(m.text.as_deref(), Some("hi"));
        assert!(!m.is_tool_call_carrier());
        assert!(!m.is_tool_result_carrier());
    }

    #[test]
    fn assistant_tool_calls_excludes_tool_results() {
        let m = Message::assistant_tool_calls(
            None,
            vec![ToolCall { id: "t1".into(), name: "search".into(), arguments: "{}".into() }],
        );
        assert!(m.is_tool_call_carrier());
        assert!(!m.is_tool_result_carrier());
    }

    #[test]
    fn data_url_round_trip() {
        let part = ImagePart::from_url("data:image/png;base64,QUJD");
        assert_eq!(part.media_type, "image/png");
        assert_eq!(part.data, "QUJD");
    }

    #[test]
    fn non_data_url_preserved_verbatim() {
        let part = ImagePart::from_url("https://example.com/cat.png");
        assert_eq!(part.media_type, "");
        assert_eq!(part.data, "https://example.com/cat.png");
    }

    #[test]
    fn approx_chars_sums_text_and_tool_payloads() {
        let m = Message::assistant_tool_calls(
            Some("ok".into()),
            vec![ToolCall { id: "1".into(), name: "ab".into(), arguments: "cd".into() }],
        );
        assert_eq!(m.approx_chars(), 2 + 2 + 2);
    }
}
