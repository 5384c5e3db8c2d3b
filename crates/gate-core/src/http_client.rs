// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP Client with Retry (C8, spec §4.8): 403 triggers a forced token
//! refresh, 429/5xx/timeouts back off exponentially. Grounded on the
//! upstream's `KiroHttpClient.request_with_retry`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::network_errors::{classify_transport_error, format_transport_error};

/// The seam `gate-auth`'s `AuthManager` implements: obtain the current
/// access token (refreshing proactively if near expiry) and force an
/// unconditional refresh after a 403. Kept here, not in `gate-auth`, so this
/// crate never needs to depend back on it.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_access_token(&self) -> anyhow::Result<String>;
    async fn force_refresh(&self) -> anyhow::Result<()>;
    /// Extra headers this account's credential family wants on every
    /// request (e.g. a fingerprint or profile header).
    fn extra_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
        }
    }
}

pub struct HttpClientWithRetry {
    client: reqwest::Client,
    token_provider: std::sync::Arc<dyn TokenProvider>,
    policy: RetryPolicy,
}

impl HttpClientWithRetry {
    pub fn new(client: reqwest::Client, token_provider: std::sync::Arc<dyn TokenProvider>, policy: RetryPolicy) -> Self {
        Self { client, token_provider, policy }
    }

    /// Non-streaming POST with the full retry ladder: 403 → forced refresh,
    /// 429/5xx → exponential backoff, network/timeout errors → classified
    /// and retried if the classification says so.
    pub async fn post_with_retry(&self, url: &str, body: &Value) -> Result<reqwest::Response, GatewayError> {
        self.send_with_retry(&self.client, url, body, false).await
    }

    /// Streaming POST (spec §4.8): a fresh per-request client instead of the
    /// shared pooled one, so a half-closed connection from a network
    /// transition during a long-lived stream never lingers in the shared
    /// pool, plus `Connection: close` so the upstream doesn't try to keep it
    /// alive either. Runs the same retry ladder as [`Self::post_with_retry`]
    /// up through the first response headers; the read-timeout-driven
    /// first-token retry (spec §4.5) is a layer above this, built around
    /// [`crate::rate_limiter`]-style reattempts of this whole call.
    pub async fn post_streaming(&self, url: &str, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.policy.connect_timeout)
            .timeout(self.policy.read_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(e.into()))?;
        self.send_with_retry(&client, url, body, true).await
    }

    async fn send_with_retry(
        &self,
        client: &reqwest::Client,
        url: &str,
        body: &Value,
        connection_close: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..self.policy.max_retries {
            let token = self
                .token_provider
                .get_access_token()
                .await
                .map_err(|e| GatewayError::Authentication(e.to_string()))?;

            let mut req = client.post(url).bearer_auth(token).json(body);
            if connection_close {
                req = req.header(reqwest::header::CONNECTION, "close");
            }
            for (k, v) in self.token_provider.extra_headers() {
                req = req.header(k, v);
            }

            match req.send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => return Ok(response),
                Ok(response) if response.status() == reqwest::StatusCode::FORBIDDEN => {
                    tracing::warn!(attempt, "received 403, forcing token refresh");
                    last_error = Some(GatewayError::Authentication(
                        "upstream rejected credentials with 403 after forced token refresh".into(),
                    ));
                    self.token_provider.force_refresh().await.map_err(|e| GatewayError::Authentication(e.to_string()))?;
                    continue;
                }
                Ok(response) if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let delay = self.policy.base_retry_delay * 2u32.pow(attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "received 429, backing off");
                    last_error = Some(GatewayError::RateLimited("upstream rate limit".into()));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    let delay = self.policy.base_retry_delay * 2u32.pow(attempt);
                    tracing::warn!(attempt, %status, delay_ms = delay.as_millis() as u64, "upstream server error, backing off");
                    last_error = Some(GatewayError::Upstream(format!("upstream returned {status}")));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    let info = classify_transport_error(&err);
                    let message = format_transport_error(&info);
                    last_error = Some(GatewayError::Upstream(message));
                    if !info.retryable {
                        break;
                    }
                    if attempt + 1 < self.policy.max_retries {
                        let delay = self.policy.base_retry_delay * 2u32.pow(attempt);
                        tracing::warn!(attempt, category = info.category.as_str(), "transport error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Upstream("request failed after all retries".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedTokenProvider;

    #[async_trait]
    impl TokenProvider for FixedTokenProvider {
        async fn get_access_token(&self) -> anyhow::Result<String> {
            Ok("test-token".into())
        }
        async fn force_refresh(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_response_returns_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateAssistantResponse"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpClientWithRetry::new(
            reqwest::Client::new(),
            std::sync::Arc::new(FixedTokenProvider),
            RetryPolicy::default(),
        );
        let response = client
            .post_with_retry(&format!("{}/generateAssistantResponse", server.uri()), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn exhausting_retries_on_persistent_5xx_surfaces_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut policy = RetryPolicy::default();
        policy.max_retries = 2;
        policy.base_retry_delay = Duration::from_millis(1);
        let client = HttpClientWithRetry::new(reqwest::Client::new(), std::sync::Arc::new(FixedTokenProvider), policy);
        let err = client.post_with_retry(&format!("{}/x", server.uri()), &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
    }

    #[tokio::test]
    async fn exhausting_retries_on_persistent_403_surfaces_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let mut policy = RetryPolicy::default();
        policy.max_retries = 2;
        policy.base_retry_delay = Duration::from_millis(1);
        let client = HttpClientWithRetry::new(reqwest::Client::new(), std::sync::Arc::new(FixedTokenProvider), policy);
        let err = client.post_with_retry(&format!("{}/x", server.uri()), &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[tokio::test]
    async fn streaming_post_sets_connection_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .and(wiremock::matchers::header("connection", "close"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpClientWithRetry::new(
            reqwest::Client::new(),
            std::sync::Arc::new(FixedTokenProvider),
            RetryPolicy::default(),
        );
        let response =
            client.post_streaming(&format!("{}/stream", server.uri()), &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
