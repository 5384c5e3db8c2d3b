// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared application state (spec §5 "component interaction"): the one
//! object every route handler and the orchestration pipeline is built
//! against. Grounded on `sven-gateway`'s `ControlService`/`AgentHandle`
//! pattern of a single cloneable handle wrapping `Arc`-ed subsystems,
//! adapted to the gateway's own set of subsystems.

use std::sync::Arc;
use std::time::Duration;

use gate_auth::{AccountPool, AccountPoolConfig, InMemoryAccountStore};
use gate_config::GatewayConfig;
use gate_core::{
    ApiKeyManager, CredentialCipher, GlobalRateLimiter, InMemoryApiKeyStore, InMemoryUsageStore,
    TruncationRecoveryStore, UsageRecorder,
};
use gate_model::{ModelCache, ModelResolver, ResolverConfig};
use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::RateLimiter;

/// Keyed by client IP; guards [`crate::middleware::auth::api_key_auth_mw`]
/// against repeated authentication failures.
type IpLimiter = RateLimiter<std::net::IpAddr, DashMapStateStore<std::net::IpAddr>, DefaultClock>;

/// How many usage rows accumulate before `UsageRecorder` flushes to the
/// store on its own, independent of the explicit post-request flush.
const USAGE_BATCH_SIZE: usize = 20;

/// Everything a request handler needs, cloned cheaply per request (every
/// field is an `Arc` or copy-free handle).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub http: reqwest::Client,
    pub account_pool: Arc<AccountPool>,
    pub api_keys: Arc<ApiKeyManager<InMemoryApiKeyStore>>,
    pub usage: Arc<UsageRecorder<InMemoryUsageStore>>,
    pub rate_limiter: Arc<GlobalRateLimiter>,
    pub truncation: Arc<TruncationRecoveryStore>,
    pub model_resolver: Arc<ModelResolver>,
    pub auth_limiter: Arc<IpLimiter>,
}

impl AppState {
    /// Builds every subsystem from a loaded [`GatewayConfig`]. Accounts,
    /// API keys, and usage rows all start from the in-memory store
    /// implementations (§10.6's resolved default); a durable backend is a
    /// drop-in replacement behind the same `AccountStore`/`ApiKeyStore`/
    /// `UsageStore` traits.
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let http = build_http_client(&config)?;
        let cipher = Arc::new(build_cipher(&config)?);

        let account_pool = Arc::new(AccountPool::new(
            Arc::new(InMemoryAccountStore::new()),
            cipher.clone(),
            http.clone(),
            AccountPoolConfig {
                refresh_url_template: config.upstream.refresh_url_template.clone(),
                oidc_token_url_template: config.upstream.oidc_token_url_template.clone(),
                token_refresh_threshold_secs: config.auth.token_refresh_threshold_secs,
                error_threshold: config.account_error_threshold,
            },
        ));

        crate::bootstrap::seed_single_tenant_account(
            &config.credentials,
            &config.region,
            &cipher,
            &account_pool,
        )
        .await?;

        let api_keys = Arc::new(ApiKeyManager::new(InMemoryApiKeyStore::default()));
        let usage = Arc::new(UsageRecorder::new(InMemoryUsageStore::default(), USAGE_BATCH_SIZE));

        let rate_limiter = Arc::new(GlobalRateLimiter::new(
            config.rate_limit.max_concurrent as usize,
            Duration::from_secs_f64(config.rate_limit.min_interval_secs),
            Duration::from_secs_f64(config.rate_limit.backoff_429_secs),
        ));

        let truncation = Arc::new(TruncationRecoveryStore::new(config.truncation_recovery));

        let resolver_config = ResolverConfig {
            aliases: config.model.aliases.clone(),
            hidden_models: config.model.hidden_models.clone(),
            hidden_from_list: config.model.hidden_from_list.iter().cloned().collect(),
        };
        let model_resolver = Arc::new(ModelResolver::new(resolver_config, ModelCache::fallback()));

        let auth_limiter = crate::middleware::auth::build_limiter();

        Ok(Self {
            config: Arc::new(config),
            http,
            account_pool,
            api_keys,
            usage,
            rate_limiter,
            truncation,
            model_resolver,
            auth_limiter,
        })
    }
}

/// Builds the shared `reqwest::Client` every upstream call (refresh, OIDC,
/// chat, model list) goes through, wiring the configured connection pool
/// and timeout budget (spec §4.8, §10.1's `HttpPoolConfig`/`StreamingConfig`).
fn build_http_client(config: &GatewayConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool.max_keepalive_connections as usize)
        .pool_idle_timeout(Duration::from_secs(config.http_pool.keepalive_expiry_secs))
        .connect_timeout(Duration::from_secs(config.streaming.connect_timeout_secs))
        .timeout(Duration::from_secs(config.streaming.request_timeout_secs));

    if let Some(proxy_url) = &config.vpn_proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }

    Ok(builder.build()?)
}

/// Resolves the credential-encryption key from `credential_encryption_key_hex`.
/// When unset, generates a random ephemeral key for the life of this process
/// and logs a warning — acceptable only because the in-memory default
/// `AccountStore` never survives a restart either; a durable deployment must
/// set this explicitly so refreshed tokens written back to persistent
/// storage remain decryptable.
fn build_cipher(config: &GatewayConfig) -> anyhow::Result<CredentialCipher> {
    match &config.credential_encryption_key_hex {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key).map_err(|e| anyhow::anyhow!("invalid credential_encryption_key_hex: {e}"))?;
            CredentialCipher::new(&bytes).map_err(|e| anyhow::anyhow!("invalid credential encryption key: {e}"))
        }
        None => {
            tracing::warn!(
                "no credential_encryption_key_hex configured, generating an ephemeral key; \
                 set one explicitly for any deployment that persists accounts across restarts"
            );
            use rand::RngCore;
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            CredentialCipher::new(&key).map_err(|e| anyhow::anyhow!("failed building ephemeral cipher: {e}"))
        }
    }
}
