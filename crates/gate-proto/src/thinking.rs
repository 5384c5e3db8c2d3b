// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Thinking Parser (C3): splits the content-event stream into a regular
//! content channel and a "thinking" channel by watching for opening/closing
//! tags like `<thinking>...</thinking>`.
//!
//! There is no upstream document describing this split — it is inferred
//! entirely from the tag text itself, so the parser has to buffer a small
//! prefix before it can decide whether a stream opens with a thinking block.

const DEFAULT_OPENING_TAGS: &[(&str, &str)] =
    &[("<thinking>", "</thinking>"), ("<think>", "</think>"), ("<reasoning>", "</reasoning>"), ("<thought>", "</thought>")];

const DEFAULT_PREFIX_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    /// Emit thinking text on a separate channel (`reasoning_content`).
    AsReasoningContent,
    /// Keep the text, drop only the tags.
    StripTags,
    /// Drop thinking text entirely.
    Remove,
    /// Emit the tags and text verbatim into the regular content channel.
    Pass,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingEvent {
    Content(String),
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Buffering the prefix, deciding whether a thinking tag opens the stream.
    Sniffing,
    /// Inside a thinking block; watching for the closing tag.
    InThinking,
    /// Past any thinking block (or detection disabled); pass content through.
    Regular,
}

pub struct ThinkingParser {
    enabled: bool,
    mode: ThinkingMode,
    prefix_limit: usize,
    state: State,
    prefix_buf: String,
    closing_tag: Option<&'static str>,
    pending_close_buf: String,
}

impl ThinkingParser {
    pub fn new(enabled: bool, mode: ThinkingMode) -> Self {
        Self {
            enabled,
            mode,
            prefix_limit: DEFAULT_PREFIX_LIMIT,
            state: if enabled { State::Sniffing } else { State::Regular },
            prefix_buf: String::new(),
            closing_tag: None,
            pending_close_buf: String::new(),
        }
    }

    /// Feed one content event, returning zero or more downstream events.
    pub fn feed(&mut self, content: &str) -> Vec<ThinkingEvent> {
        if !self.enabled {
            return vec![ThinkingEvent::Content(content.to_string())];
        }
        match self.state {
            State::Sniffing => self.feed_sniffing(content),
            State::InThinking => self.feed_in_thinking(content),
            State::Regular => vec![ThinkingEvent::Content(content.to_string())],
        }
    }

    fn feed_sniffing(&mut self, content: &str) -> Vec<ThinkingEvent> {
        self.prefix_buf.push_str(content);

        for (open, close) in DEFAULT_OPENING_TAGS {
            if let Some(pos) = self.prefix_buf.find(open) {
                // Tag found (possibly preceded by whitespace only). Anything
                // before the tag flushes as regular content.
                let before = self.prefix_buf[..pos].to_string();
                let after = self.prefix_buf[pos + open.len()..].to_string();
                self.state = State::InThinking;
                self.closing_tag = Some(close);
                self.prefix_buf.clear();

                let mut out = Vec::new();
                if !before.is_empty() {
                    out.push(ThinkingEvent::Content(before));
                }
                out.extend(self.feed_in_thinking(&after));
                return out;
            }
        }

        if self.prefix_buf.len() >= self.prefix_limit {
            self.state = State::Regular;
            let flushed = std::mem::take(&mut self.prefix_buf);
            return vec![ThinkingEvent::Content(flushed)];
        }
        Vec::new()
    }

    fn feed_in_thinking(&mut self, content: &str) -> Vec<ThinkingEvent> {
        self.pending_close_buf.push_str(content);
        let close = self.closing_tag.expect("InThinking state always has a closing tag");

        if let Some(pos) = self.pending_close_buf.find(close) {
            let thinking_text = self.pending_close_buf[..pos].to_string();
            let rest = self.pending_close_buf[pos + close.len()..].to_string();
            self.pending_close_buf.clear();
            self.state = State::Regular;
            self.closing_tag = None;

            let mut out = Vec::new();
            if !thinking_text.is_empty() {
                out.extend(self.emit_thinking(thinking_text));
            }
            if !rest.is_empty() {
                out.push(ThinkingEvent::Content(rest));
            }
            out
        } else {
            // No closing tag yet; hold everything except a safety margin
            // equal to the tag length, in case it straddles a chunk boundary.
            let hold_back = close.len().saturating_sub(1);
            if self.pending_close_buf.len() > hold_back {
                let split_at = self.pending_close_buf.len() - hold_back;
                let emit_now = self.pending_close_buf[..split_at].to_string();
                self.pending_close_buf.drain(..split_at);
                self.emit_thinking(emit_now)
            } else {
                Vec::new()
            }
        }
    }

    fn emit_thinking(&self, text: String) -> Vec<ThinkingEvent> {
        match self.mode {
            ThinkingMode::AsReasoningContent => vec![ThinkingEvent::Thinking(text)],
            ThinkingMode::StripTags => vec![ThinkingEvent::Content(text)],
            ThinkingMode::Remove => Vec::new(),
            ThinkingMode::Pass => vec![ThinkingEvent::Content(text)],
        }
    }

    /// Flush any buffered state at end of stream (e.g. a prefix that never
    /// matched and was below the limit, or an unterminated thinking block).
    pub fn finish(&mut self) -> Vec<ThinkingEvent> {
        let mut out = Vec::new();
        if self.state == State::Sniffing && !self.prefix_buf.is_empty() {
            out.push(ThinkingEvent::Content(std::mem::take(&mut self.prefix_buf)));
        }
        if self.state == State::InThinking && !self.pending_close_buf.is_empty() {
            out.extend(self.emit_thinking(std::mem::take(&mut self.pending_close_buf)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_parser_passes_through_unchanged() {
        let mut p = ThinkingParser::new(false, ThinkingMode::AsReasoningContent);
        assert_eq!(p.feed("<thinking>hmm</thinking>ok"), vec![ThinkingEvent::Content("<thinking>hmm</thinking>ok".into())]);
    }

    #[test]
    fn routes_thinking_block_to_reasoning_channel() {
        let mut p = ThinkingParser::new(true, ThinkingMode::AsReasoningContent);
        let mut events = p.feed("<thinking>let me think</thinking>answer");
        events.extend(p.finish());
        assert!(events.contains(&ThinkingEvent::Thinking("let me think".into())));
        assert!(events.contains(&ThinkingEvent::Content("answer".into())));
    }

    #[test]
    fn strip_tags_mode_keeps_text_as_content() {
        let mut p = ThinkingParser::new(true, ThinkingMode::StripTags);
        let events = p.feed("<think>reasoning here</think>answer");
        assert!(events.iter().any(|e| matches!(e, ThinkingEvent::Content(t) if t == "reasoning here")));
        assert!(events.iter().any(|e| matches!(e, ThinkingEvent::Content(t) if t == "answer")));
    }

    #[test]
    fn remove_mode_drops_thinking_text() {
        let mut p = ThinkingParser::new(true, ThinkingMode::Remove);
        let events = p.feed("<thinking>secret</thinking>answer");
        assert_eq!(events, vec![ThinkingEvent::Content("answer".into())]);
    }

    #[test]
    fn no_tag_within_prefix_limit_flushes_as_regular_content() {
        let mut p = ThinkingParser::new(true, ThinkingMode::AsReasoningContent);
        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(p.feed("hello "));
        }
        events.extend(p.finish());
        let joined: String = events
            .iter()
            .map(|e| match e {
                ThinkingEvent::Content(t) => t.as_str(),
                ThinkingEvent::Thinking(t) => t.as_str(),
            })
            .collect();
        assert_eq!(joined, "hello hello hello hello hello ");
    }

    #[test]
    fn tag_split_across_chunks_is_still_detected() {
        let mut p = ThinkingParser::new(true, ThinkingMode::AsReasoningContent);
        let mut events = p.feed("<thin");
        events.extend(p.feed("king>reasoning</thinking>done"));
        events.extend(p.finish());
        assert!(events.contains(&ThinkingEvent::Thinking("reasoning".into())));
        assert!(events.contains(&ThinkingEvent::Content("done".into())));
    }
}
