// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration surface for the gateway (spec §6, expanded in SPEC_FULL.md
//! §10.3). Every environment variable in the distilled spec's configuration
//! table maps onto a field here via [`GatewayConfig::apply_env_overrides`];
//! the same struct can be populated from a layered YAML file (loader.rs) or
//! left at its built-in defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// `PROXY_API_KEY` — legacy single-tenant shared bearer. When set, the
    /// gateway accepts this value as a valid key in addition to whatever is
    /// in the API-key store. Superseded by the per-key store in multi-tenant
    /// mode, never required.
    #[serde(default)]
    pub proxy_api_key: Option<String>,

    /// `REGION` — default upstream region for accounts that don't specify one.
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub credentials: CredentialSourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub http_pool: HttpPoolConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tools: ToolTranslationConfig,
    #[serde(default)]
    pub token_estimate: TokenEstimateConfig,

    /// `TRUNCATION_RECOVERY` — master switch for C10.
    #[serde(default = "default_true")]
    pub truncation_recovery: bool,

    #[serde(default)]
    pub fake_reasoning: FakeReasoningConfig,

    /// `VPN_PROXY_URL` — outbound proxy used for every upstream call.
    #[serde(default)]
    pub vpn_proxy_url: Option<String>,

    #[serde(default)]
    pub model: ModelResolutionConfig,

    /// Ambient server bind address; not part of the distilled spec's table
    /// (the HTTP server framework is out of scope per §1) but needed to
    /// actually start `axum`.
    #[serde(default = "default_bind")]
    pub http_bind: String,

    /// Path to the sqlite-backed default store (C17). Out of scope per §1
    /// beyond this trait seam's concrete default.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Error-count threshold before an account is deactivated (§4.7).
    #[serde(default = "default_error_threshold")]
    pub account_error_threshold: u32,

    /// Upstream wire-contract hosts (§6: "consumed, not implemented"). Every
    /// template takes `{region}` as its only substitution point.
    #[serde(default)]
    pub upstream: UpstreamEndpointsConfig,

    /// 32-byte key (hex-encoded) for the at-rest credential cipher (C16).
    /// Out of scope per §1 beyond "any authenticated symmetric cipher is
    /// acceptable"; read from config/env rather than generated, since a
    /// freshly generated key would make previously-encrypted columns
    /// unreadable across restarts.
    #[serde(default)]
    pub credential_encryption_key_hex: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_api_key: None,
            region: default_region(),
            credentials: CredentialSourceConfig::default(),
            retry: RetryConfig::default(),
            streaming: StreamingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            http_pool: HttpPoolConfig::default(),
            auth: AuthConfig::default(),
            tools: ToolTranslationConfig::default(),
            token_estimate: TokenEstimateConfig::default(),
            truncation_recovery: true,
            fake_reasoning: FakeReasoningConfig::default(),
            vpn_proxy_url: None,
            model: ModelResolutionConfig::default(),
            http_bind: default_bind(),
            database_path: default_database_path(),
            account_error_threshold: default_error_threshold(),
            upstream: UpstreamEndpointsConfig::default(),
            credential_encryption_key_hex: None,
        }
    }
}

/// Host templates for the single upstream provider's wire contract (§6).
/// `{region}` is substituted verbatim; callers needing the literal text
/// `{region}` in a template that doesn't vary by region simply omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEndpointsConfig {
    #[serde(default = "default_refresh_url_template")]
    pub refresh_url_template: String,
    #[serde(default = "default_oidc_token_url_template")]
    pub oidc_token_url_template: String,
    #[serde(default = "default_oidc_register_url_template")]
    pub oidc_register_url_template: String,
    #[serde(default = "default_oidc_authorize_url_template")]
    pub oidc_authorize_url_template: String,
    #[serde(default = "default_chat_url_template")]
    pub chat_url_template: String,
    #[serde(default = "default_model_list_url_template")]
    pub model_list_url_template: String,
}
impl Default for UpstreamEndpointsConfig {
    fn default() -> Self {
        Self {
            refresh_url_template: default_refresh_url_template(),
            oidc_token_url_template: default_oidc_token_url_template(),
            oidc_register_url_template: default_oidc_register_url_template(),
            oidc_authorize_url_template: default_oidc_authorize_url_template(),
            chat_url_template: default_chat_url_template(),
            model_list_url_template: default_model_list_url_template(),
        }
    }
}
impl UpstreamEndpointsConfig {
    fn render(template: &str, region: &str) -> String {
        template.replace("{region}", region)
    }
    pub fn refresh_url(&self, region: &str) -> String {
        Self::render(&self.refresh_url_template, region)
    }
    pub fn oidc_token_url(&self, region: &str) -> String {
        Self::render(&self.oidc_token_url_template, region)
    }
    pub fn oidc_register_url(&self, region: &str) -> String {
        Self::render(&self.oidc_register_url_template, region)
    }
    pub fn oidc_authorize_url(&self, region: &str) -> String {
        Self::render(&self.oidc_authorize_url_template, region)
    }
    pub fn chat_url(&self, region: &str) -> String {
        Self::render(&self.chat_url_template, region)
    }
    pub fn model_list_url(&self, region: &str) -> String {
        Self::render(&self.model_list_url_template, region)
    }
}
fn default_refresh_url_template() -> String {
    "https://prod.{region}.auth.upstream-provider.example/refreshToken".to_string()
}
fn default_oidc_token_url_template() -> String {
    "https://oidc.{region}.upstream-provider.example/token".to_string()
}
fn default_oidc_register_url_template() -> String {
    "https://oidc.{region}.upstream-provider.example/client/register".to_string()
}
fn default_oidc_authorize_url_template() -> String {
    "https://oidc.{region}.upstream-provider.example/authorize".to_string()
}
fn default_chat_url_template() -> String {
    "https://api.{region}.upstream-provider.example/generateAssistantResponse".to_string()
}
fn default_model_list_url_template() -> String {
    "https://q.{region}.upstream-provider.example/ListAvailableModels".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/llmgate/gateway.sqlite3")
}
fn default_error_threshold() -> u32 {
    3
}

/// `REFRESH_TOKEN` / `KIRO_CREDS_FILE` / `KIRO_CLI_DB_FILE` — origin of
/// single-tenant credentials used to seed the account pool when no
/// multi-tenant admin-managed accounts exist yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSourceConfig {
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub creds_file: Option<PathBuf>,
    #[serde(default)]
    pub cli_db_file: Option<PathBuf>,
}

/// `MAX_RETRIES`, `BASE_RETRY_DELAY` — non-streaming retry (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: default_max_retries(), base_retry_delay_ms: default_base_retry_delay_ms() }
    }
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_retry_delay_ms() -> u64 {
    1000
}

/// `FIRST_TOKEN_TIMEOUT`, `FIRST_TOKEN_MAX_RETRIES`, `STREAMING_READ_TIMEOUT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_first_token_timeout_secs")]
    pub first_token_timeout_secs: u64,
    #[serde(default = "default_first_token_max_retries")]
    pub first_token_max_retries: u32,
    #[serde(default = "default_streaming_read_timeout_secs")]
    pub streaming_read_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}
impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            first_token_timeout_secs: default_first_token_timeout_secs(),
            first_token_max_retries: default_first_token_max_retries(),
            streaming_read_timeout_secs: default_streaming_read_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
fn default_first_token_timeout_secs() -> u64 {
    15
}
fn default_first_token_max_retries() -> u32 {
    3
}
fn default_streaming_read_timeout_secs() -> u64 {
    300
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    300
}

/// `RATE_LIMIT_MAX_CONCURRENT`, `RATE_LIMIT_MIN_INTERVAL`, `RATE_LIMIT_429_BACKOFF`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 0 disables the concurrency cap.
    #[serde(default)]
    pub max_concurrent: u32,
    /// Seconds; 0 disables the interval throttle.
    #[serde(default)]
    pub min_interval_secs: f64,
    /// Seconds; 0 disables the 429 backoff window.
    #[serde(default)]
    pub backoff_429_secs: f64,
}

/// `HTTP_MAX_CONNECTIONS`, `HTTP_MAX_KEEPALIVE_CONNECTIONS`,
/// `HTTP_KEEPALIVE_EXPIRY`, `HTTP_POOL_TIMEOUT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_keepalive")]
    pub max_keepalive_connections: usize,
    #[serde(default = "default_keepalive_expiry_secs")]
    pub keepalive_expiry_secs: u64,
    #[serde(default = "default_pool_timeout_secs")]
    pub pool_timeout_secs: u64,
}
impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_keepalive_connections: default_max_keepalive(),
            keepalive_expiry_secs: default_keepalive_expiry_secs(),
            pool_timeout_secs: default_pool_timeout_secs(),
        }
    }
}
fn default_max_connections() -> usize {
    100
}
fn default_max_keepalive() -> usize {
    20
}
fn default_keepalive_expiry_secs() -> u64 {
    30
}
fn default_pool_timeout_secs() -> u64 {
    10
}

/// `TOKEN_REFRESH_THRESHOLD` — seconds before expiry that a refresh is
/// triggered proactively (§4.6 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_refresh_threshold_secs")]
    pub token_refresh_threshold_secs: i64,
}
impl Default for AuthConfig {
    fn default() -> Self {
        Self { token_refresh_threshold_secs: default_token_refresh_threshold_secs() }
    }
}
fn default_token_refresh_threshold_secs() -> i64 {
    600
}

/// `TOOL_DESCRIPTION_MAX_LENGTH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTranslationConfig {
    #[serde(default = "default_tool_description_max_length")]
    pub tool_description_max_length: usize,
}
impl Default for ToolTranslationConfig {
    fn default() -> Self {
        Self { tool_description_max_length: default_tool_description_max_length() }
    }
}
fn default_tool_description_max_length() -> usize {
    10_000
}

/// `TOKEN_ESTIMATE_CORRECTION` — pre-request token estimate multiplier
/// (SPEC_FULL.md §10.4: pre-estimate ×0.95, post-hoc ×1.15).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEstimateConfig {
    #[serde(default = "default_pre_estimate_correction")]
    pub pre_estimate_correction: f64,
    #[serde(default = "default_post_hoc_correction")]
    pub post_hoc_correction: f64,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}
impl Default for TokenEstimateConfig {
    fn default() -> Self {
        Self {
            pre_estimate_correction: default_pre_estimate_correction(),
            post_hoc_correction: default_post_hoc_correction(),
            chars_per_token: default_chars_per_token(),
        }
    }
}
fn default_pre_estimate_correction() -> f64 {
    0.95
}
fn default_post_hoc_correction() -> f64 {
    1.15
}
fn default_chars_per_token() -> f64 {
    4.0
}

/// `FAKE_REASONING_ENABLED`, `FAKE_REASONING_MAX_TOKENS`,
/// `FAKE_REASONING_HANDLING`, `FAKE_REASONING_OPEN_TAGS`,
/// `FAKE_REASONING_INITIAL_BUFFER_SIZE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeReasoningConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fake_reasoning_max_tokens")]
    pub max_tokens: u32,
    /// One of `as_reasoning_content` | `strip_tags` | `remove` | `pass`.
    #[serde(default = "default_fake_reasoning_handling")]
    pub handling: String,
    #[serde(default = "default_fake_reasoning_open_tags")]
    pub open_tags: Vec<String>,
    #[serde(default = "default_fake_reasoning_buffer_size")]
    pub initial_buffer_size: usize,
}
impl Default for FakeReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: default_fake_reasoning_max_tokens(),
            handling: default_fake_reasoning_handling(),
            open_tags: default_fake_reasoning_open_tags(),
            initial_buffer_size: default_fake_reasoning_buffer_size(),
        }
    }
}
fn default_fake_reasoning_max_tokens() -> u32 {
    4096
}
fn default_fake_reasoning_handling() -> String {
    "as_reasoning_content".to_string()
}
fn default_fake_reasoning_open_tags() -> Vec<String> {
    vec!["<thinking>".into(), "<think>".into(), "<reasoning>".into(), "<thought>".into()]
}
fn default_fake_reasoning_buffer_size() -> usize {
    20
}

/// `HIDDEN_MODELS`, `MODEL_ALIASES`, `HIDDEN_FROM_LIST`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResolutionConfig {
    #[serde(default)]
    pub hidden_models: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub aliases: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub hidden_from_list: Vec<String>,
}

impl GatewayConfig {
    /// Overlay every environment variable named in the distilled spec's
    /// configuration table on top of whatever was loaded from YAML (or the
    /// built-in defaults). Env vars always win: this lets the whole
    /// configuration surface work standalone with no config file present.
    pub fn apply_env_overrides(&mut self) {
        use std::env;

        if let Ok(v) = env::var("PROXY_API_KEY") {
            self.proxy_api_key = Some(v);
        }
        if let Ok(v) = env::var("REGION") {
            self.region = v;
        }
        if let Ok(v) = env::var("REFRESH_TOKEN") {
            self.credentials.refresh_token = Some(v);
        }
        if let Ok(v) = env::var("KIRO_CREDS_FILE") {
            self.credentials.creds_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("KIRO_CLI_DB_FILE") {
            self.credentials.cli_db_file = Some(PathBuf::from(v));
        }
        apply_parsed(&mut self.retry.max_retries, "MAX_RETRIES");
        apply_parsed(&mut self.retry.base_retry_delay_ms, "BASE_RETRY_DELAY");
        apply_parsed(&mut self.streaming.first_token_timeout_secs, "FIRST_TOKEN_TIMEOUT");
        apply_parsed(&mut self.streaming.first_token_max_retries, "FIRST_TOKEN_MAX_RETRIES");
        apply_parsed(&mut self.streaming.streaming_read_timeout_secs, "STREAMING_READ_TIMEOUT");
        apply_parsed(&mut self.rate_limit.max_concurrent, "RATE_LIMIT_MAX_CONCURRENT");
        apply_parsed(&mut self.rate_limit.min_interval_secs, "RATE_LIMIT_MIN_INTERVAL");
        apply_parsed(&mut self.rate_limit.backoff_429_secs, "RATE_LIMIT_429_BACKOFF");
        apply_parsed(&mut self.http_pool.max_connections, "HTTP_MAX_CONNECTIONS");
        apply_parsed(&mut self.http_pool.max_keepalive_connections, "HTTP_MAX_KEEPALIVE_CONNECTIONS");
        apply_parsed(&mut self.http_pool.keepalive_expiry_secs, "HTTP_KEEPALIVE_EXPIRY");
        apply_parsed(&mut self.http_pool.pool_timeout_secs, "HTTP_POOL_TIMEOUT");
        apply_parsed(&mut self.auth.token_refresh_threshold_secs, "TOKEN_REFRESH_THRESHOLD");
        apply_parsed(&mut self.tools.tool_description_max_length, "TOOL_DESCRIPTION_MAX_LENGTH");
        apply_parsed(&mut self.token_estimate.pre_estimate_correction, "TOKEN_ESTIMATE_CORRECTION");
        apply_parsed(&mut self.truncation_recovery, "TRUNCATION_RECOVERY");
        apply_parsed(&mut self.fake_reasoning.enabled, "FAKE_REASONING_ENABLED");
        apply_parsed(&mut self.fake_reasoning.max_tokens, "FAKE_REASONING_MAX_TOKENS");
        if let Ok(v) = env::var("FAKE_REASONING_HANDLING") {
            self.fake_reasoning.handling = v;
        }
        if let Ok(v) = env::var("FAKE_REASONING_OPEN_TAGS") {
            self.fake_reasoning.open_tags = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        apply_parsed(&mut self.fake_reasoning.initial_buffer_size, "FAKE_REASONING_INITIAL_BUFFER_SIZE");
        if let Ok(v) = env::var("VPN_PROXY_URL") {
            self.vpn_proxy_url = Some(v);
        }
        if let Ok(v) = env::var("HIDDEN_MODELS") {
            self.model.hidden_models = parse_kv_list(&v);
        }
        if let Ok(v) = env::var("MODEL_ALIASES") {
            self.model.aliases = parse_kv_list(&v);
        }
        if let Ok(v) = env::var("HIDDEN_FROM_LIST") {
            self.model.hidden_from_list = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("CREDENTIAL_ENCRYPTION_KEY") {
            self.credential_encryption_key_hex = Some(v);
        }
    }
}

fn apply_parsed<T: std::str::FromStr>(field: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(parsed) = raw.parse() {
            *field = parsed;
        } else {
            tracing::warn!(var, raw, "could not parse environment variable override");
        }
    }
}

/// Parses `"a=b,c=d"` into a map, matching the shape of `HIDDEN_MODELS` /
/// `MODEL_ALIASES` env vars.
fn parse_kv_list(raw: &str) -> std::collections::HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.streaming.first_token_timeout_secs, 15);
        assert_eq!(cfg.streaming.streaming_read_timeout_secs, 300);
        assert!(cfg.truncation_recovery);
    }

    #[test]
    fn parse_kv_list_splits_pairs() {
        let map = parse_kv_list("claude-sonnet-4.5=claude-sonnet-4.5-1m, auto=claude-haiku-4.5");
        assert_eq!(map.get("claude-sonnet-4.5").unwrap(), "claude-sonnet-4.5-1m");
        assert_eq!(map.get("auto").unwrap(), "claude-haiku-4.5");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("MAX_RETRIES", "7");
        let mut cfg = GatewayConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.retry.max_retries, 7);
        std::env::remove_var("MAX_RETRIES");
    }
}
