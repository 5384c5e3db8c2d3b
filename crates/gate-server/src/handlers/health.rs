// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /` and `GET /health` — liveness (spec §6). Unauthenticated: a load
//! balancer or orchestrator probing this route never carries a client key.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let accounts = state.account_pool.list_accounts().await.unwrap_or_default();
    let active_accounts = accounts.iter().filter(|a| a.active).count();

    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accounts_total": accounts.len(),
        "accounts_active": active_accounts,
    }))
    .into_response()
}
