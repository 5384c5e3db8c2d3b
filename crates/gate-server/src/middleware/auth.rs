// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Client API-key authentication (spec §6 "Client authentication"). Adapted
//! from the teacher's `http::auth` bearer-token middleware: same per-IP
//! governor lockout on repeated failures, same loopback exemption, same
//! "only failed attempts consume a rate-limit token" rule — but validating
//! against [`gate_core::ApiKeyManager`] instead of a single stored token
//! hash, and accepting either `Authorization: Bearer sk-...` or
//! `x-api-key: sk-...` (the Anthropic dialect's header).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tracing::warn;

use crate::errors::DialectError;
use crate::state::AppState;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Per-IP auth-failure lockout: 5 failed attempts per minute, burst of 2,
/// matching the teacher's default.
pub fn build_limiter() -> Arc<IpLimiter> {
    let quota = Quota::per_minute(NonZeroU32::new(5).unwrap()).allow_burst(NonZeroU32::new(2).unwrap());
    Arc::new(RateLimiter::keyed(quota))
}

/// Identifies the validated caller to downstream handlers (usage recording,
/// per-key limit enforcement) via a request extension.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub id: i64,
    pub key_id: String,
    pub name: String,
    pub usage_limit_tokens: Option<u64>,
    pub usage_limit_requests: Option<u64>,
}

/// Axum middleware validating the client's API key. Applied to every
/// `/v1/*` route; dialect-correct 401 bodies are chosen from the request
/// path so a misrouted Anthropic client never sees an OpenAI-shaped error.
pub async fn api_key_auth_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let dialect = crate::errors::Dialect::for_path(req.uri().path());
    let ip = addr.ip();

    match extract_key(req.headers(), &state.config.proxy_api_key) {
        Some(Provided::Legacy) => {
            req.extensions_mut().insert(AuthenticatedKey {
                id: 0,
                key_id: "legacy".to_string(),
                name: "legacy-proxy-api-key".to_string(),
                usage_limit_tokens: None,
                usage_limit_requests: None,
            });
            next.run(req).await
        }
        Some(Provided::Key(plaintext)) => match state.api_keys.validate_key(&plaintext).await {
            Ok(record) => {
                req.extensions_mut().insert(AuthenticatedKey {
                    id: record.id,
                    key_id: record.key_id,
                    name: record.name,
                    usage_limit_tokens: record.usage_limit_tokens,
                    usage_limit_requests: record.usage_limit_requests,
                });
                next.run(req).await
            }
            Err(err) => reject(&state, ip, dialect, err).await,
        },
        None => {
            reject(&state, ip, dialect, gate_core::GatewayError::Authentication("missing API key".into())).await
        }
    }
}

enum Provided {
    Legacy,
    Key(String),
}

fn extract_key(headers: &HeaderMap, proxy_api_key: &Option<String>) -> Option<Provided> {
    let candidate = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })?;

    if let Some(legacy) = proxy_api_key {
        if &candidate == legacy {
            return Some(Provided::Legacy);
        }
    }
    Some(Provided::Key(candidate))
}

async fn reject(
    state: &AppState,
    ip: IpAddr,
    dialect: crate::errors::Dialect,
    err: gate_core::GatewayError,
) -> Response {
    if !is_loopback(ip) && state.auth_limiter.check_key(&ip).is_err() {
        warn!(%ip, "rate limit exceeded after repeated API key failures");
        return (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            [(axum::http::header::RETRY_AFTER, "60")],
            "Too Many Requests",
        )
            .into_response();
    }
    warn!(%ip, "API key authentication failed");
    DialectError::new(dialect, err).into_response()
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_key_prefers_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-abc".parse().unwrap());
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer sk-def".parse().unwrap());
        let provided = extract_key(&headers, &None);
        assert!(matches!(provided, Some(Provided::Key(k)) if k == "sk-abc"));
    }

    #[test]
    fn extract_key_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer sk-def".parse().unwrap());
        let provided = extract_key(&headers, &None);
        assert!(matches!(provided, Some(Provided::Key(k)) if k == "sk-def"));
    }

    #[test]
    fn extract_key_missing_both_headers() {
        let headers = HeaderMap::new();
        assert!(extract_key(&headers, &None).is_none());
    }

    #[test]
    fn extract_key_matches_legacy_proxy_key() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer legacy-token".parse().unwrap());
        let provided = extract_key(&headers, &Some("legacy-token".to_string()));
        assert!(matches!(provided, Some(Provided::Legacy)));
    }

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("192.168.1.1".parse().unwrap()));
    }
}
