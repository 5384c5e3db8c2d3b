// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dialect-specific error shaping (spec §6 "Error shapes", §7 "Error
//! handling design"). `GatewayError` (gate-core) carries the dialect-neutral
//! category and HTTP status; this module renders it, or a transport-error
//! classification with its own suggested status, into whichever JSON
//! envelope the requesting route's dialect expects.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gate_core::{GatewayError, TransportErrorInfo};
use serde_json::json;

/// Which wire dialect a route's error responses must be shaped as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    /// `/v1/messages` is the only Anthropic-dialect route; every other
    /// route (including `/v1/models` and the health checks) renders errors
    /// in the OpenAI shape, matching spec §6's client-authentication table.
    pub fn for_path(path: &str) -> Self {
        if path.starts_with("/v1/messages") {
            Dialect::Anthropic
        } else {
            Dialect::OpenAi
        }
    }
}

/// A fully-resolved error ready to render: status code, machine-readable
/// `code`, and a client-facing `message`. `GatewayError` and
/// `TransportErrorInfo` both convert into this.
pub struct DialectError {
    dialect: Dialect,
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl DialectError {
    pub fn new(dialect: Dialect, error: GatewayError) -> Self {
        Self {
            dialect,
            status: StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: error.code(),
            message: error.to_string(),
        }
    }

    /// Builds a response directly from a transport-error classification
    /// (§7 "Propagation"), preserving its own `suggested_http_code` (502 for
    /// connect failures, 504 for timeouts) rather than `GatewayError`'s
    /// fixed 502-for-`Upstream` mapping.
    pub fn from_transport(dialect: Dialect, info: &TransportErrorInfo) -> Self {
        Self {
            dialect,
            status: StatusCode::from_u16(info.suggested_http_code).unwrap_or(StatusCode::BAD_GATEWAY),
            code: "upstream_transport",
            message: gate_core::format_transport_error(info),
        }
    }

    /// `first_token_timeout` exhaustion (§4.5, §7): retries ran out before
    /// a single byte reached the client.
    pub fn first_token_timeout(dialect: Dialect) -> Self {
        Self {
            dialect,
            status: StatusCode::GATEWAY_TIMEOUT,
            code: "first_token_timeout",
            message: "No response from upstream after retrying the request.".to_string(),
        }
    }
}

impl IntoResponse for DialectError {
    fn into_response(self) -> Response {
        let body = match self.dialect {
            Dialect::OpenAi => json!({
                "error": {
                    "message": self.message,
                    "type": self.code,
                    "code": self.code,
                    "param": null,
                }
            }),
            Dialect::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.code,
                    "message": self.message,
                }
            }),
        };

        (self.status, axum::Json(body)).into_response()
    }
}

/// `account_unhealthy` (§7): the pool has no account to hand out.
pub fn account_unhealthy() -> GatewayError {
    GatewayError::AccountUnhealthy("no active, healthy upstream account is available".to_string())
}
