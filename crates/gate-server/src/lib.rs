// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP surface for the API-compatibility gateway (spec §6): route wiring,
//! authentication and security-header middleware, and the top-level
//! `serve` entry point the binary crate calls. Grounded on
//! `sven-gateway::gateway::run`'s construct-then-serve shape, adapted to
//! axum's own `Router`/`serve` pair instead of a hand-rolled listener loop.

pub mod bootstrap;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use gate_config::GatewayConfig;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Request bodies larger than this are rejected before translation even
/// starts; generous enough for large tool catalogs and multimodal content,
/// far below anything that would let a client exhaust memory.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Builds the full route tree: the two dialect routes plus `/v1/models`
/// behind client-API-key authentication, and unauthenticated liveness
/// routes, all wrapped in the security-header layer.
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/chat/completions", post(handlers::chat::chat_completions))
        .route("/v1/messages", post(handlers::messages::messages))
        .route("/v1/models", get(handlers::models::list_models))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::api_key_auth_mw));

    let public = Router::new()
        .route("/", get(handlers::health::health))
        .route("/health", get(handlers::health::health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assembles [`AppState`] from a loaded [`GatewayConfig`] and serves the
/// router until the process receives a shutdown signal. The binary crate
/// (`src/main.rs`) owns config loading and logging setup; this is the one
/// entry point it calls to actually run the gateway.
pub async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let bind = config.http_bind.clone();
    let state = AppState::new(config).await?;
    let app = router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM so in-flight streams get a chance to flush
/// their usage rows (spec §5 "Cancellation") before the listener closes.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
