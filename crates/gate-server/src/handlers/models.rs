// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /v1/models` — flat model listing (spec §4.1 "Listing endpoint",
//! §6). Authenticated the same way as the chat routes.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Response {
    let models: Vec<_> = state
        .model_resolver
        .available_models()
        .into_iter()
        .map(|id| {
            let description = gate_model::max_input_tokens(&id, 0);
            json!({
                "id": id,
                "owned_by": "gateway",
                "description": if description > 0 {
                    format!("{} token context window", description)
                } else {
                    String::new()
                },
            })
        })
        .collect();

    axum::Json(json!({ "object": "list", "data": models })).into_response()
}
