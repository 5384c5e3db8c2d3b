// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared orchestration steps (spec §2's component-interaction chain) common
//! to both dialect routes: account selection, upstream payload construction,
//! the HTTP call, and the bookkeeping that happens on completion or error.
//! The dialect-specific parts — decoding the client body and framing the
//! response — live in [`super::chat`] and [`super::messages`].

use std::sync::Arc;
use std::time::Duration;

use gate_auth::{Account, AuthManager};
use gate_core::{GatewayError, HttpClientWithRetry, RetryPolicy, TokenProvider};
use gate_model::Message;
use gate_proto::{FirstByteOutcome, TranslateError, UnifiedRequest, UpstreamBuildInput};
use serde_json::Value;

use crate::errors::account_unhealthy;
use crate::state::AppState;

/// Everything needed to issue the upstream call and interpret its response,
/// resolved once per request before the HTTP round trip begins.
pub struct PreparedCall {
    pub account_id: i64,
    pub http: HttpClientWithRetry,
    pub url: String,
    pub payload: Value,
    pub model_id: String,
    pub max_input_tokens: u64,
    pub request_chars: usize,
}

/// Rewrites `messages` in place against the truncation-recovery store (spec
/// §4.10): previously-truncated tool results get a synthetic notice
/// prepended, and assistant turns that were truncated get a synthetic
/// continuation request inserted right after them.
///
/// Applied here, after dialect decoding but before the upstream payload is
/// built — the store's keys (tool-call ids, content hashes) are only
/// meaningful once the dialect-specific body has been reduced to the unified
/// message shape, so this runs one step later than the data-flow summary's
/// ordering suggests, without changing what gets rewritten.
pub fn apply_truncation_rewrite(store: &gate_core::TruncationRecoveryStore, messages: Vec<Message>) -> Vec<Message> {
    use gate_core::TruncationRecoveryStore as Store;
    use gate_model::Role;

    let mut out = Vec::with_capacity(messages.len());
    for mut msg in messages {
        if let Some(results) = msg.tool_results.as_mut() {
            for result in results.iter_mut() {
                if let Some(entry) = store.take_tool_truncation(&result.tool_call_id) {
                    result.content = format!("{}{}", Store::tool_notice(&entry), result.content);
                }
            }
        }
        let continuation = match (msg.role, msg.text.as_deref()) {
            (Some(Role::Assistant), Some(text)) => store.take_content_truncation(text).is_some(),
            _ => false,
        };
        out.push(msg);
        if continuation {
            out.push(Message::user(Store::content_notice()));
        }
    }
    out
}

/// Selects an account, builds the retry-aware HTTP client for it, and
/// assembles the upstream payload. Returns the account's manager alongside
/// so the caller can report health back to the pool once the call finishes.
pub async fn prepare(
    state: &AppState,
    unified: &UnifiedRequest,
    streaming: bool,
) -> Result<(PreparedCall, Arc<AuthManager>, Account), GatewayError> {
    let (account, manager) =
        state.account_pool.get_account().await.map_err(|_| account_unhealthy())?;

    let resolution = state.model_resolver.resolve(&unified.model);
    let max_input_tokens =
        gate_model::max_input_tokens(&resolution.internal_id, 200_000) as u64;

    let token_provider: Arc<dyn TokenProvider> = manager.clone();
    let retry_policy = RetryPolicy {
        max_retries: state.config.retry.max_retries,
        base_retry_delay: Duration::from_millis(state.config.retry.base_retry_delay_ms),
        connect_timeout: Duration::from_secs(state.config.streaming.connect_timeout_secs),
        read_timeout: Duration::from_secs(if streaming {
            state.config.streaming.streaming_read_timeout_secs
        } else {
            state.config.streaming.request_timeout_secs
        }),
    };
    let http = HttpClientWithRetry::new(state.http.clone(), token_provider, retry_policy);

    let conversation_id = uuid::Uuid::new_v4().to_string();
    let payload = gate_proto::build_upstream_payload(UpstreamBuildInput {
        messages: &unified.messages,
        system: unified.system.as_deref(),
        model_id: &resolution.internal_id,
        tools: &unified.tools,
        conversation_id: &conversation_id,
        profile_arn: account.profile_arn.as_deref(),
        inject_thinking: state.config.fake_reasoning.enabled,
        max_thinking_length: state.config.fake_reasoning.max_tokens,
        tool_description_max_length: state.config.tools.tool_description_max_length,
    })
    .map_err(|TranslateError::InvalidRequest(msg)| GatewayError::InvalidRequest(msg))?;

    let request_chars: usize = unified.messages.iter().map(Message::approx_chars).sum();

    Ok((
        PreparedCall {
            account_id: account.id,
            http,
            url: state.config.upstream.chat_url(&account.region),
            payload,
            model_id: resolution.internal_id,
            max_input_tokens,
            request_chars,
        },
        manager,
        account,
    ))
}

/// Reqwest stream-read error, classified the same way a send error is.
pub fn chunk_error(err: reqwest::Error) -> GatewayError {
    let info = gate_core::classify_transport_error(&err);
    GatewayError::Upstream(gate_core::format_transport_error(&info))
}

/// A response whose first byte has already arrived, ready for the caller to
/// keep draining with `response.chunk()`.
pub struct StartedStream {
    pub response: reqwest::Response,
    pub first_chunk: bytes::Bytes,
}

/// First-token-retry loop (spec §4.5): issues the upstream POST, waits up to
/// `first_token_timeout` for the first body byte, and on timeout closes the
/// response and tries again, up to `max_retries` times. A transport error
/// during send or the first read is returned immediately — it already went
/// through [`gate_core::HttpClientWithRetry`]'s own 403/429/5xx ladder.
pub async fn first_byte_or_retry(
    prepared: &PreparedCall,
    first_token_timeout: Duration,
    max_retries: u32,
) -> Result<FirstByteOutcome<StartedStream>, GatewayError> {
    gate_proto::retry_until_first_byte(max_retries, || async {
        let mut response = prepared.http.post_streaming(&prepared.url, &prepared.payload).await?;
        match tokio::time::timeout(first_token_timeout, response.chunk()).await {
            Ok(Ok(Some(first_chunk))) => Ok(Some(StartedStream { response, first_chunk })),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(err)) => Err(chunk_error(err)),
            Err(_elapsed) => {
                tracing::warn!("no bytes from upstream within first-token timeout, retrying");
                Ok(None)
            }
        }
    })
    .await
}

/// Records a finalized tool call's truncation flag, if any, in the recovery
/// store (spec §4.10 "writes on stream completion").
pub fn record_tool_truncations(store: &gate_core::TruncationRecoveryStore, tool_calls: &[gate_proto::ToolCall]) {
    for call in tool_calls {
        if let Some(info) = &call.truncated {
            store.record_tool_truncation(&call.id, &call.name, &info.reason, info.size_bytes);
        }
    }
}
