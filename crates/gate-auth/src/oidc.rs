// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OIDC onboarding (spec §4.6 "Adding an OIDC account"): dynamic client
//! registration plus the PKCE (S256) authorization-code dance used to add
//! a new account to the pool. Grounded on the upstream reference
//! implementation's `OAuthFlowManager` (`oauth_flow.py`) — client
//! registration, PKCE pair generation, the authorization URL, and the
//! state-keyed pending-flow store with single-use code exchange are all
//! carried over from there.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long an authorization attempt may sit unfinished before its state
/// token is rejected as expired (matches the upstream reference's 10
/// minutes).
const PENDING_FLOW_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub region: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ExchangedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Orchestrates onboarding a new OIDC account: register a dynamic client,
/// build an authorization URL with a fresh PKCE pair, then exchange the
/// returned code for tokens once the user completes the browser flow.
pub struct OidcOnboarding {
    http: reqwest::Client,
    register_url_template: String,
    authorize_url_template: String,
    token_url_template: String,
    pending: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
}

impl OidcOnboarding {
    pub fn new(
        http: reqwest::Client,
        register_url_template: String,
        authorize_url_template: String,
        token_url_template: String,
    ) -> Self {
        Self {
            http,
            register_url_template,
            authorize_url_template,
            token_url_template,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn render(template: &str, region: &str) -> String {
        template.replace("{region}", region)
    }

    /// Registers a new dynamic OIDC client for `region`, per the wire
    /// contract in spec §4.6: POST a client metadata document, expect
    /// `clientId`/`clientSecret` back.
    pub async fn register_client(&self, region: &str, redirect_uri: &str) -> anyhow::Result<RegisteredClient> {
        let url = Self::render(&self.register_url_template, region);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "clientName": "llmgate",
                "redirectUris": [redirect_uri],
                "grantTypes": ["authorization_code", "refresh_token"],
                "responseTypes": ["code"],
            }))
            .send()
            .await?
            .error_for_status()?;
        let data: Value = response.json().await?;
        let client_id = data
            .get("clientId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("client registration response missing clientId"))?
            .to_string();
        let client_secret = data
            .get("clientSecret")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("client registration response missing clientSecret"))?
            .to_string();
        Ok(RegisteredClient { client_id, client_secret })
    }

    /// Generates an S256 PKCE pair: a 32-byte random verifier and its
    /// base64url (no padding) SHA-256 challenge.
    pub fn generate_pkce_pair() -> (String, String) {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        (verifier, challenge)
    }

    /// Builds the authorization URL the user is redirected to, and records
    /// a pending flow keyed by a fresh `state` token so the later callback
    /// can be matched back to its PKCE verifier and client credentials.
    pub async fn build_authorization_url(
        &self,
        region: &str,
        client: &RegisteredClient,
        redirect_uri: &str,
    ) -> anyhow::Result<String> {
        let (verifier, challenge) = Self::generate_pkce_pair();
        let state = Uuid::new_v4().to_string();

        self.pending.lock().await.insert(
            state.clone(),
            PendingAuthorization {
                state: state.clone(),
                code_verifier: verifier,
                region: region.to_string(),
                client_id: client.client_id.clone(),
                client_secret: client.client_secret.clone(),
                redirect_uri: redirect_uri.to_string(),
                created_at: Utc::now(),
            },
        );

        let base = Self::render(&self.authorize_url_template, region);
        let url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("response_type", "code"),
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("state", state.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )?;
        Ok(url.to_string())
    }

    /// Completes onboarding: validates and single-use-pops the pending
    /// flow for `state`, then exchanges `code` for tokens using the
    /// recorded PKCE verifier and client credentials.
    pub async fn exchange_code_for_tokens(&self, state: &str, code: &str) -> anyhow::Result<ExchangedTokens> {
        let pending = {
            let mut guard = self.pending.lock().await;
            guard.remove(state).ok_or_else(|| anyhow::anyhow!("unknown or already-used authorization state"))?
        };

        if Utc::now() - pending.created_at > ChronoDuration::minutes(PENDING_FLOW_TTL_MINUTES) {
            anyhow::bail!("authorization flow expired, please restart login");
        }

        let url = Self::render(&self.token_url_template, &pending.region);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grantType": "authorization_code",
                "clientId": pending.client_id,
                "clientSecret": pending.client_secret,
                "code": code,
                "redirectUri": pending.redirect_uri,
                "codeVerifier": pending.code_verifier,
            }))
            .send()
            .await?
            .error_for_status()?;
        let data: Value = response.json().await?;

        let access_token = data
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("token exchange response missing accessToken"))?
            .to_string();
        let refresh_token = data
            .get("refreshToken")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("token exchange response missing refreshToken"))?
            .to_string();
        let expires_in = data.get("expiresIn").and_then(Value::as_i64).unwrap_or(3600);

        Ok(ExchangedTokens { access_token, refresh_token, expires_in })
    }

    /// Sweeps out authorization flows that were never completed, matching
    /// the TTL enforced at exchange time. Intended to be called on a
    /// periodic timer so abandoned logins don't accumulate in memory.
    pub async fn cleanup_expired_flows(&self) -> usize {
        let mut guard = self.pending.lock().await;
        let before = guard.len();
        let cutoff = Utc::now() - ChronoDuration::minutes(PENDING_FLOW_TTL_MINUTES);
        guard.retain(|_, flow| flow.created_at > cutoff);
        before - guard.len()
    }

    pub async fn pending_flow_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn pkce_pair_challenge_is_derived_from_verifier() {
        let (verifier, challenge) = OidcOnboarding::generate_pkce_pair();
        let digest = Sha256::digest(verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(challenge, expected);
        assert!(!verifier.contains('='));
    }

    #[test]
    fn pkce_pairs_are_not_reused() {
        let (v1, c1) = OidcOnboarding::generate_pkce_pair();
        let (v2, c2) = OidcOnboarding::generate_pkce_pair();
        assert_ne!(v1, v2);
        assert_ne!(c1, c2);
    }

    #[tokio::test]
    async fn authorization_url_contains_pkce_and_state_params() {
        let onboarding = OidcOnboarding::new(
            reqwest::Client::new(),
            "http://unused/register".into(),
            "http://example.test/{region}/authorize".into(),
            "http://unused/token".into(),
        );
        let client = RegisteredClient { client_id: "cid".into(), client_secret: "secret".into() };
        let url = onboarding
            .build_authorization_url("us-east-1", &client, "http://localhost/callback")
            .await
            .unwrap();
        assert!(url.starts_with("http://example.test/us-east-1/authorize"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("client_id=cid"));
        assert_eq!(onboarding.pending_flow_count().await, 1);
    }

    #[tokio::test]
    async fn exchange_is_single_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "at",
                "refreshToken": "rt",
                "expiresIn": 3600,
            })))
            .mount(&server)
            .await;

        let onboarding = OidcOnboarding::new(
            reqwest::Client::new(),
            "http://unused/register".into(),
            "http://unused/{region}/authorize".into(),
            format!("{}/token", server.uri()),
        );
        let client = RegisteredClient { client_id: "cid".into(), client_secret: "secret".into() };
        let url = onboarding
            .build_authorization_url("us-east-1", &client, "http://localhost/callback")
            .await
            .unwrap();
        let state = reqwest::Url::parse(&url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .unwrap()
            .1
            .to_string();

        let tokens = onboarding.exchange_code_for_tokens(&state, "auth-code").await.unwrap();
        assert_eq!(tokens.access_token, "at");

        let err = onboarding.exchange_code_for_tokens(&state, "auth-code").await.unwrap_err();
        assert!(err.to_string().contains("unknown or already-used"));
    }

    #[tokio::test]
    async fn cleanup_expired_flows_removes_stale_entries() {
        let onboarding = OidcOnboarding::new(
            reqwest::Client::new(),
            "http://unused/register".into(),
            "http://unused/{region}/authorize".into(),
            "http://unused/token".into(),
        );
        let client = RegisteredClient { client_id: "cid".into(), client_secret: "secret".into() };
        onboarding
            .build_authorization_url("us-east-1", &client, "http://localhost/callback")
            .await
            .unwrap();
        {
            let mut guard = onboarding.pending.lock().await;
            for flow in guard.values_mut() {
                flow.created_at = Utc::now() - ChronoDuration::minutes(PENDING_FLOW_TTL_MINUTES + 1);
            }
        }
        let removed = onboarding.cleanup_expired_flows().await;
        assert_eq!(removed, 1);
        assert_eq!(onboarding.pending_flow_count().await, 0);
    }
}
