// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Truncation Recovery Store (C10, spec §4.10): remembers which tool calls
//! and assistant messages were truncated mid-stream so the next client
//! request can be rewritten to ask the model to retry more narrowly.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ToolTruncationEntry {
    pub tool_name: String,
    pub reason: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ContentTruncationEntry {
    pub message_hash: String,
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct Tables {
    by_tool_call_id: HashMap<String, ToolTruncationEntry>,
    by_content_hash: HashMap<String, ContentTruncationEntry>,
}

/// Process-wide, feature-flagged. Disabled entirely when `enabled` is false,
/// in which case every write and read is a no-op.
pub struct TruncationRecoveryStore {
    enabled: bool,
    tables: Mutex<Tables>,
}

impl TruncationRecoveryStore {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, tables: Mutex::new(Tables::default()) }
    }

    pub fn record_tool_truncation(&self, tool_use_id: &str, tool_name: &str, reason: &str, size_bytes: usize) {
        if !self.enabled {
            return;
        }
        self.tables.lock().unwrap().by_tool_call_id.insert(
            tool_use_id.to_string(),
            ToolTruncationEntry { tool_name: tool_name.to_string(), reason: reason.to_string(), size_bytes },
        );
    }

    pub fn record_content_truncation(&self, assistant_text: &str) {
        if !self.enabled {
            return;
        }
        let hash = hash_text(assistant_text);
        self.tables.lock().unwrap().by_content_hash.insert(hash.clone(), ContentTruncationEntry { message_hash: hash });
    }

    /// Consumes (removes) and returns the entry for a tool-result id, if any.
    pub fn take_tool_truncation(&self, tool_use_id: &str) -> Option<ToolTruncationEntry> {
        if !self.enabled {
            return None;
        }
        self.tables.lock().unwrap().by_tool_call_id.remove(tool_use_id)
    }

    /// Consumes (removes) and returns whether an assistant message's text
    /// matches a recorded truncation.
    pub fn take_content_truncation(&self, assistant_text: &str) -> Option<ContentTruncationEntry> {
        if !self.enabled {
            return None;
        }
        let hash = hash_text(assistant_text);
        self.tables.lock().unwrap().by_content_hash.remove(&hash)
    }

    /// The synthetic notice prepended to a tool_result whose id was
    /// previously flagged as truncated.
    pub fn tool_notice(entry: &ToolTruncationEntry) -> String {
        format!(
            "[SYSTEM NOTICE: the previous call to '{}' was truncated ({}, {} bytes). \
             Retry with narrower arguments if you need the full output.]\n\n",
            entry.tool_name, entry.reason, entry.size_bytes
        )
    }

    /// The synthetic user message inserted after an assistant turn whose
    /// text matched a recorded truncation.
    pub fn content_notice() -> &'static str {
        "[SYSTEM NOTICE: your previous response was truncated. Please continue from where you left off.]"
    }
}
