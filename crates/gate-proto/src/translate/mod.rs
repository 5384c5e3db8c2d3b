// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request Translators (C4): dialect-specific JSON → unified request, and
//! unified request → upstream payload.

pub mod anthropic;
pub mod openai;
pub mod upstream;

use gate_model::{Message, Tool};

/// A request after dialect-specific decoding, before upstream translation.
#[derive(Debug, Clone)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<Tool>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
}
