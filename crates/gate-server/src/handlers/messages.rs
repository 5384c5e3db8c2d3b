// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `POST /v1/messages` — Anthropic dialect entry point.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use futures::StreamExt;
use gate_core::{calculate_cost, GatewayError, UsageRecord};
use gate_proto::{
    finalize_usage, pre_estimate_tokens, AnthropicEmitter, AwsEventStreamParser, FinishReason,
    FirstByteOutcome, ThinkingEvent, ThinkingMode, ThinkingParser,
};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::{Dialect, DialectError};
use crate::handlers::pipeline::{self, PreparedCall};
use crate::middleware::AuthenticatedKey;
use crate::state::AppState;

const DIALECT: Dialect = Dialect::Anthropic;
const ENDPOINT: &str = "/v1/messages";

pub async fn messages(
    State(state): State<AppState>,
    Extension(api_key): Extension<AuthenticatedKey>,
    body: Bytes,
) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => return DialectError::new(DIALECT, GatewayError::InvalidRequest(err.to_string())).into_response(),
    };

    if let Err(err) = state.api_keys.check_usage_limits_for(api_key.id, api_key.usage_limit_tokens, api_key.usage_limit_requests).await {
        return DialectError::new(DIALECT, err).into_response();
    }

    let unified = match gate_proto::from_anthropic_request(&request) {
        Ok(u) => u,
        Err(gate_proto::TranslateError::InvalidRequest(msg)) => {
            return DialectError::new(DIALECT, GatewayError::InvalidRequest(msg)).into_response()
        }
    };
    let mut unified = unified;
    unified.messages = pipeline::apply_truncation_rewrite(&state.truncation, std::mem::take(&mut unified.messages));

    if unified.stream {
        stream_response(state, api_key, unified).await
    } else {
        buffered_response(state, api_key, unified).await
    }
}

async fn stream_response(state: AppState, api_key: AuthenticatedKey, unified: gate_proto::UnifiedRequest) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(32);

    tokio::spawn(async move {
        run_stream(&state, &api_key, unified, &tx).await;
    });

    let body_stream = ReceiverStream::new(rx).map(|frame| Ok::<_, std::io::Error>(Bytes::from(frame)));
    let body = axum::body::Body::from_stream(body_stream);

    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .header(axum::http::header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap()
}

async fn run_stream(
    state: &AppState,
    api_key: &AuthenticatedKey,
    unified: gate_proto::UnifiedRequest,
    tx: &tokio::sync::mpsc::Sender<String>,
) {
    let permit = state.rate_limiter.acquire().await;
    let request_start = std::time::Instant::now();

    let prepared = match pipeline::prepare(state, &unified, true).await {
        Ok(p) => p,
        Err(err) => {
            let _ = tx.send(AnthropicEmitter::error_event(err.code(), &err.to_string())).await;
            permit.release().await;
            return;
        }
    };
    let (prepared, manager, account) = prepared;
    let _ = manager;

    let first_token_timeout = std::time::Duration::from_secs(state.config.streaming.first_token_timeout_secs);
    let outcome = pipeline::first_byte_or_retry(&prepared, first_token_timeout, state.config.streaming.first_token_max_retries).await;

    let started = match outcome {
        Ok(FirstByteOutcome::Delivered(started)) => started,
        Ok(FirstByteOutcome::TimedOut) => {
            let _ = state.account_pool.report_error(prepared.account_id).await;
            let _ = tx
                .send(AnthropicEmitter::error_event("timeout_error", "no response from upstream after retrying the request"))
                .await;
            permit.release().await;
            record_usage(state, api_key, &prepared, 504, request_start, estimated_prompt_tokens(state, &prepared), 0, None).await;
            return;
        }
        Err(err) => {
            if matches!(err, GatewayError::RateLimited(_)) {
                state.rate_limiter.on_429_received().await;
            }
            let _ = state.account_pool.report_error(prepared.account_id).await;
            let status = err.http_status();
            let _ = tx.send(AnthropicEmitter::error_event(err.code(), &err.to_string())).await;
            permit.release().await;
            record_usage(state, api_key, &prepared, status, request_start, estimated_prompt_tokens(state, &prepared), 0, None).await;
            return;
        }
    };
    permit.release().await;

    let mut emitter = AnthropicEmitter::new(format!("msg_{}", uuid::Uuid::new_v4()), prepared.model_id.clone());
    let mut parser = AwsEventStreamParser::new();
    let mut thinking = ThinkingParser::new(state.config.fake_reasoning.enabled, thinking_mode(&state.config.fake_reasoning.handling));

    let _ = tx.send(emitter.message_start()).await;

    let mut completion_text = String::new();
    let mut context_usage_pct: Option<f64> = None;
    let mut response = started.response;
    let mut chunk = Some(started.first_chunk);
    let mut text_index: Option<u32> = None;
    let mut truncated_mid_stream = false;

    loop {
        let bytes = match chunk.take() {
            Some(b) => b,
            None => match response.chunk().await {
                Ok(Some(b)) => b,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "upstream stream read failed mid-stream");
                    truncated_mid_stream = true;
                    break;
                }
            },
        };

        for event in parser.feed(&bytes) {
            match event {
                gate_proto::ParsedEvent::Content(text) => {
                    completion_text.push_str(&text);
                    for te in thinking.feed(&text) {
                        match te {
                            ThinkingEvent::Thinking(t) => {
                                if !emitter.is_thinking_open() {
                                    let _ = tx.send(emitter.open_thinking_block()).await;
                                }
                                let _ = tx.send(emitter.thinking_delta(&t)).await;
                            }
                            ThinkingEvent::Content(t) => {
                                if emitter.is_thinking_open() {
                                    let _ = tx.send(emitter.close_thinking_block()).await;
                                }
                                if text_index.is_none() {
                                    let (idx, frame) = emitter.open_text_block();
                                    let _ = tx.send(frame).await;
                                    text_index = Some(idx);
                                }
                                let idx = text_index.unwrap();
                                let _ = tx.send(emitter.text_delta(idx, &t)).await;
                            }
                        }
                    }
                }
                gate_proto::ParsedEvent::Usage(_) => {}
                gate_proto::ParsedEvent::ContextUsage(pct) => context_usage_pct = Some(pct),
            }
        }
    }

    for te in thinking.finish() {
        match te {
            ThinkingEvent::Thinking(t) => {
                let _ = tx.send(emitter.thinking_delta(&t)).await;
            }
            ThinkingEvent::Content(t) => {
                if text_index.is_none() {
                    let (idx, frame) = emitter.open_text_block();
                    let _ = tx.send(frame).await;
                    text_index = Some(idx);
                }
                let idx = text_index.unwrap();
                let _ = tx.send(emitter.text_delta(idx, &t)).await;
            }
        }
    }

    if emitter.is_thinking_open() {
        let _ = tx.send(emitter.close_thinking_block()).await;
    }
    if let Some(idx) = text_index {
        let _ = tx.send(emitter.close_block(idx)).await;
    }

    let tool_calls = parser.finish(&completion_text);
    pipeline::record_tool_truncations(&state.truncation, &tool_calls);
    if truncated_mid_stream && !completion_text.is_empty() {
        state.truncation.record_content_truncation(&completion_text);
    }

    for call in &tool_calls {
        let (_, [start, delta, stop]) = emitter.tool_use_block(call);
        let _ = tx.send(start).await;
        let _ = tx.send(delta).await;
        let _ = tx.send(stop).await;
    }

    if truncated_mid_stream {
        let _ = tx.send(AnthropicEmitter::error_event("upstream_error", "the response was truncated mid-stream")).await;
        let _ = tx.send(emitter.message_stop()).await;
        let _ = state.account_pool.report_error(prepared.account_id).await;
        let partial = finalize_usage(
            context_usage_pct,
            prepared.max_input_tokens,
            &completion_text,
            prepared.request_chars,
            state.config.token_estimate.chars_per_token,
            state.config.token_estimate.post_hoc_correction,
        );
        record_usage(state, api_key, &prepared, 502, request_start, partial.prompt_tokens, partial.completion_tokens, None).await;
        return;
    }

    let usage = finalize_usage(
        context_usage_pct,
        prepared.max_input_tokens,
        &completion_text,
        prepared.request_chars,
        state.config.token_estimate.chars_per_token,
        state.config.token_estimate.post_hoc_correction,
    );
    let finish_reason = FinishReason::from_tool_calls_present(!tool_calls.is_empty());
    let _ = tx.send(emitter.message_delta(finish_reason, usage)).await;
    let _ = tx.send(emitter.message_stop()).await;

    let _ = state.account_pool.report_success(prepared.account_id).await;
    record_usage(state, api_key, &prepared, 200, request_start, usage.prompt_tokens, usage.completion_tokens, Some(&prepared.model_id)).await;
    let _ = account;
}

async fn buffered_response(state: AppState, api_key: AuthenticatedKey, unified: gate_proto::UnifiedRequest) -> Response {
    let permit = state.rate_limiter.acquire().await;
    let request_start = std::time::Instant::now();

    let (prepared, _manager, account) = match pipeline::prepare(&state, &unified, false).await {
        Ok(p) => p,
        Err(err) => {
            permit.release().await;
            return DialectError::new(DIALECT, err).into_response();
        }
    };
    let _ = account;

    let response = prepared.http.post_with_retry(&prepared.url, &prepared.payload).await;
    permit.release().await;

    let response = match response {
        Ok(r) => r,
        Err(err) => {
            if matches!(err, GatewayError::RateLimited(_)) {
                state.rate_limiter.on_429_received().await;
            }
            let _ = state.account_pool.report_error(prepared.account_id).await;
            let status = err.http_status();
            record_usage(&state, &api_key, &prepared, status, request_start, estimated_prompt_tokens(&state, &prepared), 0, None).await;
            return DialectError::new(DIALECT, err).into_response();
        }
    };

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(err) => {
            let _ = state.account_pool.report_error(prepared.account_id).await;
            let transport_err = pipeline::chunk_error(err);
            record_usage(&state, &api_key, &prepared, transport_err.http_status(), request_start, estimated_prompt_tokens(&state, &prepared), 0, None).await;
            return DialectError::new(DIALECT, transport_err).into_response();
        }
    };

    let mut parser = AwsEventStreamParser::new();
    let mut completion_text = String::new();
    let mut context_usage_pct: Option<f64> = None;
    for event in parser.feed(&body) {
        match event {
            gate_proto::ParsedEvent::Content(text) => completion_text.push_str(&text),
            gate_proto::ParsedEvent::Usage(_) => {}
            gate_proto::ParsedEvent::ContextUsage(pct) => context_usage_pct = Some(pct),
        }
    }
    let tool_calls = parser.finish(&completion_text);
    pipeline::record_tool_truncations(&state.truncation, &tool_calls);

    let usage = finalize_usage(
        context_usage_pct,
        prepared.max_input_tokens,
        &completion_text,
        prepared.request_chars,
        state.config.token_estimate.chars_per_token,
        state.config.token_estimate.post_hoc_correction,
    );

    let _ = state.account_pool.report_success(prepared.account_id).await;
    record_usage(&state, &api_key, &prepared, 200, request_start, usage.prompt_tokens, usage.completion_tokens, Some(&prepared.model_id)).await;

    let mut content = Vec::new();
    if !completion_text.is_empty() {
        content.push(json!({ "type": "text", "text": completion_text }));
    }
    for call in &tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Object(Default::default()));
        content.push(json!({ "type": "tool_use", "id": call.id, "name": call.name, "input": input }));
    }

    let stop_reason = if tool_calls.is_empty() { "end_turn" } else { "tool_use" };

    axum::Json(json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": prepared.model_id,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        },
    }))
    .into_response()
}

fn thinking_mode(handling: &str) -> ThinkingMode {
    match handling {
        "strip_tags" => ThinkingMode::StripTags,
        "remove" => ThinkingMode::Remove,
        "pass" => ThinkingMode::Pass,
        _ => ThinkingMode::AsReasoningContent,
    }
}

async fn record_usage(
    state: &AppState,
    api_key: &AuthenticatedKey,
    prepared: &PreparedCall,
    status_code: u16,
    request_start: std::time::Instant,
    input_tokens: u64,
    output_tokens: u64,
    cost_model: Option<&str>,
) {
    let estimated_cost_usd = cost_model.and_then(|model| calculate_cost(model, input_tokens, output_tokens).total_cost);
    state
        .usage
        .record(UsageRecord {
            api_key_id: api_key.id,
            account_id: prepared.account_id,
            model: prepared.model_id.clone(),
            endpoint: ENDPOINT.to_string(),
            input_tokens,
            output_tokens,
            status_code,
            request_duration_ms: request_start.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
            estimated_cost_usd,
        })
        .await;
}

fn estimated_prompt_tokens(state: &AppState, prepared: &PreparedCall) -> u64 {
    pre_estimate_tokens(prepared.request_chars, state.config.token_estimate.chars_per_token, state.config.token_estimate.pre_estimate_correction)
}
