// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Auth Manager (C6, spec §4.6): the in-memory object that owns and
//! refreshes one account's upstream tokens. Grounded on the upstream
//! reference implementation's `KiroAuthManager` (`auth.py`), carrying over
//! its six-step `get_access_token` algorithm, its two refresh wire
//! contracts, and its origin-preserving write-back rule.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gate_core::{CredentialCipher, TokenProvider};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::pool::AccountStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    SimpleRefresh,
    Oidc,
}

// `serde` isn't otherwise used in this module; pull in the derive macros
// directly rather than adding a workspace-wide `serde::{Serialize,
// Deserialize}` import for one enum.
use serde::{Deserialize, Serialize};

/// Where a loaded credential set came from, and therefore where a
/// successful refresh must be written back to (spec §4.6 write-back rule).
#[derive(Debug, Clone)]
pub enum CredentialOrigin {
    /// A JSON file on disk; other keys in the file are preserved on write.
    File { path: PathBuf },
    /// An embedded key/value store (e.g. a CLI's local sqlite database).
    /// `loaded_key` is the key the credentials were actually found under,
    /// tried first on write-back; `fallback_keys` are tried in order if
    /// that fails (the upstream reference implementation supports several
    /// login methods sharing one schema).
    KeyValueStore { db_path: PathBuf, loaded_key: Option<String>, fallback_keys: Vec<String> },
    /// The account pool's own encrypted columns, keyed by account id.
    Pool { account_id: i64 },
}

#[derive(Debug, Clone, Default)]
struct AuthState {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    /// OIDC region may differ from the account's API region (spec §4.6).
    oidc_region: Option<String>,
    scopes: Option<Vec<String>>,
    profile_arn: Option<String>,
}

pub struct AuthManager {
    auth_kind: AuthKind,
    region: String,
    origin: CredentialOrigin,
    state: Mutex<AuthState>,
    http: reqwest::Client,
    refresh_threshold: ChronoDuration,
    refresh_url_template: String,
    oidc_token_url_template: String,
    /// Only present when `origin` is `Pool`; used to re-encrypt tokens for
    /// write-back without this crate depending on a concrete store impl.
    pool_store: Option<Arc<dyn AccountStore>>,
    cipher: Option<Arc<CredentialCipher>>,
}

struct SimpleRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    profile_arn: Option<String>,
}

struct OidcRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

impl AuthManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth_kind: AuthKind,
        region: String,
        refresh_token: String,
        access_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        client_id: Option<String>,
        client_secret: Option<String>,
        profile_arn: Option<String>,
        origin: CredentialOrigin,
        http: reqwest::Client,
        refresh_threshold_secs: i64,
        refresh_url_template: String,
        oidc_token_url_template: String,
    ) -> Self {
        Self {
            auth_kind,
            region,
            origin,
            state: Mutex::new(AuthState {
                access_token,
                expires_at,
                refresh_token,
                client_id,
                client_secret,
                oidc_region: None,
                scopes: None,
                profile_arn,
            }),
            http,
            refresh_threshold: ChronoDuration::seconds(refresh_threshold_secs),
            refresh_url_template,
            oidc_token_url_template,
            pool_store: None,
            cipher: None,
        }
    }

    /// Attaches the pool store + cipher this manager writes refreshed
    /// tokens back through, for `CredentialOrigin::Pool`.
    pub fn with_pool_writeback(mut self, store: Arc<dyn AccountStore>, cipher: Arc<CredentialCipher>) -> Self {
        self.pool_store = Some(store);
        self.cipher = Some(cipher);
        self
    }

    pub fn profile_arn_sync(&self) -> Option<String> {
        // Best-effort synchronous snapshot for log lines; callers that need
        // correctness under concurrent refresh should go through
        // `get_access_token` instead.
        self.state.try_lock().ok().and_then(|s| s.profile_arn.clone())
    }

    fn refresh_url(&self) -> String {
        self.refresh_url_template.replace("{region}", &self.region)
    }

    /// OIDC token endpoint, built against `state.oidc_region` when set
    /// (spec §4.6: "OIDC region may differ from the account's API
    /// region"), falling back to the account's own region otherwise.
    fn oidc_token_url(&self, state: &AuthState) -> String {
        let region = state.oidc_region.as_deref().unwrap_or(&self.region);
        self.oidc_token_url_template.replace("{region}", region)
    }

    /// Records the OIDC region discovered during client registration or
    /// onboarding, so subsequent refreshes target the right token endpoint
    /// even when it differs from the account's API region.
    pub async fn set_oidc_region(&self, region: String) {
        self.state.lock().await.oidc_region = Some(region);
    }

    fn is_expiring_soon(state: &AuthState, threshold: ChronoDuration) -> bool {
        match state.expires_at {
            None => true,
            Some(exp) => exp <= Utc::now() + threshold,
        }
    }

    fn is_expired(state: &AuthState) -> bool {
        match state.expires_at {
            None => true,
            Some(exp) => Utc::now() >= exp,
        }
    }

    /// Reloads credentials from a mutable external store (`KeyValueStore`
    /// origin only). No-op for `File`/`Pool` origins, which are never
    /// mutated by a sibling process.
    async fn reload_from_external_store(&self, state: &mut AuthState) {
        let CredentialOrigin::KeyValueStore { db_path, loaded_key, fallback_keys } = &self.origin else {
            return;
        };
        let keys: Vec<String> =
            loaded_key.iter().cloned().chain(fallback_keys.iter().cloned()).collect();
        match reload_kv_store(db_path, &keys) {
            Ok(Some((access_token, refresh_token, expires_at))) => {
                state.access_token = Some(access_token);
                state.refresh_token = refresh_token;
                state.expires_at = expires_at;
                tracing::debug!(db = %db_path.display(), "reloaded credentials from external store");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(db = %db_path.display(), error = %err, "failed reloading external credential store"),
        }
    }

    async fn dispatch_refresh(&self, state: &mut AuthState) -> anyhow::Result<()> {
        match self.auth_kind {
            AuthKind::SimpleRefresh => self.refresh_simple(state).await,
            AuthKind::Oidc => self.refresh_oidc(state).await,
        }
    }

    async fn refresh_simple(&self, state: &mut AuthState) -> anyhow::Result<()> {
        if state.refresh_token.is_empty() {
            anyhow::bail!("auth_required: no refresh token available, re-login required");
        }
        let url = self.refresh_url();
        let response = self
            .http
            .post(&url)
            .json(&json!({ "refreshToken": state.refresh_token }))
            .send()
            .await?
            .error_for_status()?;
        let data: Value = response.json().await?;
        let parsed = parse_simple_refresh(&data)?;
        self.apply_simple(state, parsed);
        self.write_back(state).await;
        Ok(())
    }

    async fn refresh_oidc(&self, state: &mut AuthState) -> anyhow::Result<()> {
        match self.do_oidc_refresh(state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if is_http_400(&err) {
                    if let CredentialOrigin::KeyValueStore { .. } = &self.origin {
                        tracing::warn!("OIDC refresh failed with 400, reloading external store and retrying once");
                        self.reload_from_external_store(state).await;
                        return self.do_oidc_refresh(state).await;
                    }
                }
                Err(err)
            }
        }
    }

    async fn do_oidc_refresh(&self, state: &mut AuthState) -> anyhow::Result<()> {
        let client_id = state
            .client_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("auth_required: OIDC account missing client_id"))?;
        let client_secret = state
            .client_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("auth_required: OIDC account missing client_secret"))?;
        if state.refresh_token.is_empty() {
            anyhow::bail!("auth_required: no refresh token available, re-login required");
        }

        let url = self.oidc_token_url(state);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grantType": "refresh_token",
                "clientId": client_id,
                "clientSecret": client_secret,
                "refreshToken": state.refresh_token,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(Http400Marker(status.as_u16()));
        }
        let data: Value = response.json().await?;
        let parsed = parse_oidc_refresh(&data)?;
        self.apply_oidc(state, parsed);
        self.write_back(state).await;
        Ok(())
    }

    fn apply_simple(&self, state: &mut AuthState, parsed: SimpleRefreshResponse) {
        state.access_token = Some(parsed.access_token);
        if let Some(rt) = parsed.refresh_token {
            state.refresh_token = rt;
        }
        if let Some(arn) = parsed.profile_arn {
            state.profile_arn = Some(arn);
        }
        state.expires_at = Some(Utc::now() + ChronoDuration::seconds(parsed.expires_in - 60));
    }

    fn apply_oidc(&self, state: &mut AuthState, parsed: OidcRefreshResponse) {
        state.access_token = Some(parsed.access_token);
        if let Some(rt) = parsed.refresh_token {
            state.refresh_token = rt;
        }
        state.expires_at = Some(Utc::now() + ChronoDuration::seconds(parsed.expires_in - 60));
    }

    /// Persists refreshed tokens through whichever origin they came from.
    /// Failures are logged, never propagated — a write-back failure must
    /// not fail the refresh the caller is waiting on (spec §4.6).
    async fn write_back(&self, state: &AuthState) {
        match &self.origin {
            CredentialOrigin::File { path } => {
                if let Err(err) = write_back_file(path, state) {
                    tracing::warn!(path = %path.display(), error = %err, "failed writing refreshed credentials to file");
                }
            }
            CredentialOrigin::KeyValueStore { db_path, loaded_key, fallback_keys } => {
                let keys: Vec<String> =
                    loaded_key.iter().cloned().chain(fallback_keys.iter().cloned()).collect();
                if let Err(err) = write_back_kv_store(db_path, &keys, state) {
                    tracing::warn!(db = %db_path.display(), error = %err, "failed writing refreshed credentials to external store");
                }
            }
            CredentialOrigin::Pool { account_id } => {
                let (Some(store), Some(cipher)) = (self.pool_store.as_ref(), self.cipher.as_ref()) else {
                    tracing::warn!(account_id, "pool credential origin missing store/cipher wiring, skipping write-back");
                    return;
                };
                let access_enc = state.access_token.as_deref().and_then(|t| cipher.encrypt(t).ok());
                let refresh_enc = cipher.encrypt(&state.refresh_token).ok();
                let Some(refresh_enc) = refresh_enc else {
                    tracing::warn!(account_id, "failed encrypting refreshed token, skipping write-back");
                    return;
                };
                if let Err(err) =
                    store.update_tokens(*account_id, refresh_enc, access_enc, state.expires_at).await
                {
                    tracing::warn!(account_id, error = %err, "failed writing refreshed credentials to pool store");
                }
            }
        }
    }
}

/// Marker used to tag an OIDC refresh failure with its HTTP status so the
/// 400-triggers-reload-and-retry rule (spec §4.6 step 4) can recognize it
/// without round-tripping through `reqwest::Error`'s more limited surface.
#[derive(Debug, thiserror::Error)]
#[error("oidc refresh returned HTTP {0}")]
struct Http400Marker(u16);

fn is_http_400(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Http400Marker>().is_some_and(|m| m.0 == 400)
}

fn parse_simple_refresh(data: &Value) -> anyhow::Result<SimpleRefreshResponse> {
    let access_token = data
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("refresh response missing accessToken"))?
        .to_string();
    Ok(SimpleRefreshResponse {
        access_token,
        refresh_token: data.get("refreshToken").and_then(Value::as_str).map(str::to_string),
        expires_in: data.get("expiresIn").and_then(Value::as_i64).unwrap_or(3600),
        profile_arn: data.get("profileArn").and_then(Value::as_str).map(str::to_string),
    })
}

fn parse_oidc_refresh(data: &Value) -> anyhow::Result<OidcRefreshResponse> {
    let access_token = data
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("OIDC refresh response missing accessToken"))?
        .to_string();
    Ok(OidcRefreshResponse {
        access_token,
        refresh_token: data.get("refreshToken").and_then(Value::as_str).map(str::to_string),
        expires_in: data.get("expiresIn").and_then(Value::as_i64).unwrap_or(3600),
    })
}

fn write_back_file(path: &PathBuf, state: &AuthState) -> anyhow::Result<()> {
    let mut existing: Value = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(path)?)?
    } else {
        json!({})
    };
    let obj = existing.as_object_mut().ok_or_else(|| anyhow::anyhow!("credentials file is not a JSON object"))?;
    obj.insert("accessToken".into(), json!(state.access_token));
    obj.insert("refreshToken".into(), json!(state.refresh_token));
    if let Some(exp) = state.expires_at {
        obj.insert("expiresAt".into(), json!(exp.to_rfc3339()));
    }
    if let Some(arn) = &state.profile_arn {
        obj.insert("profileArn".into(), json!(arn));
    }
    std::fs::write(path, serde_json::to_string_pretty(&existing)?)?;
    Ok(())
}

fn reload_kv_store(
    db_path: &PathBuf,
    keys: &[String],
) -> anyhow::Result<Option<(String, String, Option<DateTime<Utc>>)>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = rusqlite::Connection::open(db_path)?;
    for key in keys {
        let row: Option<String> = conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |r| r.get(0))
            .ok();
        if let Some(raw) = row {
            let data: Value = serde_json::from_str(&raw)?;
            let access = data.get("access_token").and_then(Value::as_str).unwrap_or_default().to_string();
            let refresh = data.get("refresh_token").and_then(Value::as_str).unwrap_or_default().to_string();
            let expires_at = data
                .get("expires_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            return Ok(Some((access, refresh, expires_at)));
        }
    }
    Ok(None)
}

fn write_back_kv_store(db_path: &PathBuf, keys: &[String], state: &AuthState) -> anyhow::Result<()> {
    if !db_path.exists() {
        anyhow::bail!("external credential store not found at {}", db_path.display());
    }
    let conn = rusqlite::Connection::open(db_path)?;
    let payload = json!({
        "access_token": state.access_token,
        "refresh_token": state.refresh_token,
        "expires_at": state.expires_at.map(|e| e.to_rfc3339()),
    })
    .to_string();
    for key in keys {
        let updated = conn.execute("UPDATE auth_kv SET value = ?1 WHERE key = ?2", rusqlite::params![payload, key])?;
        if updated > 0 {
            return Ok(());
        }
    }
    anyhow::bail!("no matching key found in external store to write back to");
}

#[async_trait]
impl TokenProvider for AuthManager {
    /// The six-step algorithm from spec §4.6: fresh-token fast path,
    /// external-store reload-before-refresh, refresh dispatch, OIDC-400
    /// reload-and-retry (handled inside `refresh_oidc`), graceful
    /// degradation, terminal failure.
    async fn get_access_token(&self) -> anyhow::Result<String> {
        let mut state = self.state.lock().await;

        if let Some(token) = &state.access_token {
            if !Self::is_expiring_soon(&state, self.refresh_threshold) {
                return Ok(token.clone());
            }
        }

        if matches!(self.origin, CredentialOrigin::KeyValueStore { .. }) {
            self.reload_from_external_store(&mut state).await;
            if let Some(token) = &state.access_token {
                if !Self::is_expiring_soon(&state, self.refresh_threshold) {
                    tracing::debug!("external store reload provided a fresh token, skipping refresh");
                    return Ok(token.clone());
                }
            }
        }

        match self.dispatch_refresh(&mut state).await {
            Ok(()) => state
                .access_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("auth_required: refresh completed without an access token")),
            Err(err) => {
                if state.access_token.is_some() && !Self::is_expired(&state) {
                    tracing::warn!(error = %err, "token refresh failed, falling back to existing unexpired access token");
                    Ok(state.access_token.clone().unwrap())
                } else {
                    Err(anyhow::anyhow!("auth_required: token refresh failed and no valid token remains: {err}"))
                }
            }
        }
    }

    async fn force_refresh(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.dispatch_refresh(&mut state).await
    }

    fn extra_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager_with_url(auth_kind: AuthKind, url_template: String, refresh_token: &str) -> AuthManager {
        AuthManager::new(
            auth_kind,
            "us-east-1".into(),
            refresh_token.into(),
            None,
            None,
            Some("client-id".into()),
            Some("client-secret".into()),
            None,
            CredentialOrigin::File { path: PathBuf::from("/nonexistent/creds.json") },
            reqwest::Client::new(),
            600,
            url_template.clone(),
            url_template,
        )
    }

    #[tokio::test]
    async fn fresh_token_short_circuits_refresh() {
        let manager = manager_with_url(AuthKind::SimpleRefresh, "http://unused".into(), "rt");
        manager.state.lock().await.access_token = Some("still-good".into());
        manager.state.lock().await.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "still-good");
    }

    #[tokio::test]
    async fn simple_refresh_updates_token_and_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "new-access",
                "refreshToken": "new-refresh",
                "expiresIn": 3600,
            })))
            .mount(&server)
            .await;

        let manager =
            manager_with_url(AuthKind::SimpleRefresh, format!("{}/refreshToken", server.uri()), "old-refresh");
        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "new-access");
        assert_eq!(manager.state.lock().await.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn expired_refresh_failure_with_no_existing_token_is_auth_required() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let manager =
            manager_with_url(AuthKind::SimpleRefresh, format!("{}/refreshToken", server.uri()), "old-refresh");
        let err = manager.get_access_token().await.unwrap_err();
        assert!(err.to_string().contains("auth_required"));
    }

    #[tokio::test]
    async fn refresh_failure_degrades_gracefully_to_existing_unexpired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let manager =
            manager_with_url(AuthKind::SimpleRefresh, format!("{}/refreshToken", server.uri()), "old-refresh");
        manager.state.lock().await.access_token = Some("soon-to-expire".into());
        manager.state.lock().await.expires_at = Some(Utc::now() + ChronoDuration::seconds(30));

        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "soon-to-expire");
    }

    #[tokio::test]
    async fn set_oidc_region_overrides_token_endpoint_region() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oidc/eu-west-1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "new-access",
                "expiresIn": 3600,
            })))
            .mount(&server)
            .await;

        let manager = AuthManager::new(
            AuthKind::Oidc,
            "us-east-1".into(),
            "rt".into(),
            None,
            None,
            Some("client-id".into()),
            Some("client-secret".into()),
            None,
            CredentialOrigin::File { path: PathBuf::from("/nonexistent/creds.json") },
            reqwest::Client::new(),
            600,
            "http://unused/{region}".into(),
            format!("{}/oidc/{{region}}/token", server.uri()),
        );
        // The account's own region is us-east-1; without set_oidc_region the
        // request would target a path the mock never registered and fail.
        manager.set_oidc_region("eu-west-1".into()).await;
        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "new-access");
    }

    #[tokio::test]
    async fn oidc_refresh_without_client_credentials_fails_clearly() {
        let mut manager = manager_with_url(AuthKind::Oidc, "http://unused/token".into(), "rt");
        manager.state.get_mut().client_id = None;
        let err = manager.force_refresh().await.unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }
}
