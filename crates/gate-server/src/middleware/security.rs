// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Security response headers, applied to every response regardless of
//! route or dialect. Carried over near-verbatim from the teacher's
//! `http::security::security_headers` — this gateway has no cookie/browser
//! session model, so the teacher's companion `csrf_guard` (which defends a
//! same-origin control UI) has no counterpart here and was dropped.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

static HSTS: HeaderValue = HeaderValue::from_static("max-age=31536000; includeSubDomains");
static NO_SNIFF: HeaderValue = HeaderValue::from_static("nosniff");
static DENY_FRAME: HeaderValue = HeaderValue::from_static("DENY");
static NO_REFERRER: HeaderValue = HeaderValue::from_static("no-referrer");
static PERMISSIONS: HeaderValue = HeaderValue::from_static("camera=(), microphone=(), geolocation=()");

/// Append security headers to every outgoing response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(axum::http::header::STRICT_TRANSPORT_SECURITY, HSTS.clone());
    h.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.clone());
    h.insert(axum::http::header::X_FRAME_OPTIONS, DENY_FRAME.clone());
    h.insert(axum::http::header::REFERRER_POLICY, NO_REFERRER.clone());
    h.insert("permissions-policy", PERMISSIONS.clone());
    resp
}
