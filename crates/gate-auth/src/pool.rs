// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Account Pool (C7, spec §4.7): the multi-tenant set of upstream accounts
//! the gateway rotates across. Grounded on the upstream reference
//! implementation's `AccountPool` (`account_pool.py`) — round-robin
//! selection over healthy accounts, lazy per-account `AuthManager`
//! construction, and error-threshold deactivation are all carried over
//! from there; only the synchronization primitive (`tokio::sync::Mutex`
//! instead of `asyncio.Lock`) and the persistence seam (`AccountStore`,
//! mirroring gate-core's `ApiKeyStore`/`UsageStore` trait shape) are new.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gate_core::{CredentialCipher, TokenProvider};
use tokio::sync::Mutex;

use crate::manager::{AuthKind, AuthManager, CredentialOrigin};

/// One upstream account row (spec §3 Account). Token fields are encrypted
/// at rest; this struct holds them exactly as stored, decrypted on demand
/// by [`AccountPool::get_account`].
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub auth_kind: AuthKind,
    pub region: String,
    pub encrypted_refresh_token: String,
    pub encrypted_access_token: Option<String>,
    pub encrypted_client_id: Option<String>,
    pub encrypted_client_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
    pub active: bool,
    pub error_count: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for accounts (C17), mirroring the shape of gate-core's
/// `ApiKeyStore`/`UsageStore` traits so the default `rusqlite` backend can
/// implement all three with one connection pool.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_accounts(&self) -> anyhow::Result<Vec<Account>>;
    async fn get_account(&self, id: i64) -> anyhow::Result<Option<Account>>;
    async fn insert_account(&self, account: Account) -> anyhow::Result<i64>;
    async fn delete_account(&self, id: i64) -> anyhow::Result<()>;
    async fn record_error(&self, id: i64, error_count: u32, active: bool) -> anyhow::Result<()>;
    async fn record_success(&self, id: i64) -> anyhow::Result<()>;
    async fn update_tokens(
        &self,
        id: i64,
        encrypted_refresh_token: String,
        encrypted_access_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;
}

/// In-process `AccountStore` used by tests and as a zero-config fallback
/// when no persistent store is configured.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<i64, Account>>,
    next_id: Mutex<i64>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self { accounts: Mutex::new(HashMap::new()), next_id: Mutex::new(1) }
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn list_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self.accounts.lock().await.values().cloned().collect())
    }

    async fn get_account(&self, id: i64) -> anyhow::Result<Option<Account>> {
        Ok(self.accounts.lock().await.get(&id).cloned())
    }

    async fn insert_account(&self, mut account: Account) -> anyhow::Result<i64> {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        account.id = id;
        self.accounts.lock().await.insert(id, account);
        Ok(id)
    }

    async fn delete_account(&self, id: i64) -> anyhow::Result<()> {
        self.accounts.lock().await.remove(&id);
        Ok(())
    }

    async fn record_error(&self, id: i64, error_count: u32, active: bool) -> anyhow::Result<()> {
        if let Some(acct) = self.accounts.lock().await.get_mut(&id) {
            acct.error_count = error_count;
            acct.active = active;
        }
        Ok(())
    }

    async fn record_success(&self, id: i64) -> anyhow::Result<()> {
        if let Some(acct) = self.accounts.lock().await.get_mut(&id) {
            acct.error_count = 0;
        }
        Ok(())
    }

    async fn update_tokens(
        &self,
        id: i64,
        encrypted_refresh_token: String,
        encrypted_access_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        if let Some(acct) = self.accounts.lock().await.get_mut(&id) {
            acct.encrypted_refresh_token = encrypted_refresh_token;
            acct.encrypted_access_token = encrypted_access_token;
            acct.expires_at = expires_at;
        }
        Ok(())
    }
}

/// Ties everything together at runtime: which upstream hosts to refresh
/// against, how many consecutive errors deactivate an account, and the
/// cipher used to open encrypted columns lazily.
pub struct AccountPoolConfig {
    pub refresh_url_template: String,
    pub oidc_token_url_template: String,
    pub token_refresh_threshold_secs: i64,
    pub error_threshold: u32,
}

/// The account pool (spec §4.7): rotates across healthy accounts and
/// lazily constructs one [`AuthManager`] per account, cached for the
/// life of the pool.
pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    cipher: Arc<CredentialCipher>,
    http: reqwest::Client,
    config: AccountPoolConfig,
    /// Guards both the round-robin cursor and the managers cache so
    /// selection and construction happen atomically, matching the
    /// upstream reference's single `asyncio.Lock` around `get_account`.
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    cursor: usize,
    managers: HashMap<i64, Arc<AuthManager>>,
}

impl AccountPool {
    pub fn new(
        store: Arc<dyn AccountStore>,
        cipher: Arc<CredentialCipher>,
        http: reqwest::Client,
        config: AccountPoolConfig,
    ) -> Self {
        Self { store, cipher, http, config, state: Mutex::new(PoolState::default()) }
    }

    /// Selects the next healthy account round-robin and returns its
    /// (lazily constructed) `AuthManager`. Despite the upstream reference
    /// implementation's `_select_next` docstring calling this "weighted",
    /// the actual selection is plain modulo round-robin over accounts
    /// ordered by priority descending then id ascending — ties are broken
    /// deterministically, but there is no probability weighting (DESIGN.md
    /// records this as a resolved Open Question).
    pub async fn get_account(&self) -> anyhow::Result<(Account, Arc<AuthManager>)> {
        let accounts = self.store.list_accounts().await?;
        let mut healthy: Vec<Account> = accounts.into_iter().filter(|a| a.active).collect();
        if healthy.is_empty() {
            anyhow::bail!("no_accounts_available: account pool has no active accounts");
        }
        healthy.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut state = self.state.lock().await;
        let idx = state.cursor % healthy.len();
        state.cursor = state.cursor.wrapping_add(1);
        let account = healthy[idx].clone();

        if let Some(manager) = state.managers.get(&account.id) {
            return Ok((account, manager.clone()));
        }

        let manager = Arc::new(self.build_manager(&account)?);
        state.managers.insert(account.id, manager.clone());
        Ok((account, manager))
    }

    fn build_manager(&self, account: &Account) -> anyhow::Result<AuthManager> {
        let refresh_token = self.cipher.decrypt(&account.encrypted_refresh_token)?;
        let access_token = match &account.encrypted_access_token {
            Some(enc) => Some(self.cipher.decrypt(enc)?),
            None => None,
        };
        let client_id = match &account.encrypted_client_id {
            Some(enc) => Some(self.cipher.decrypt(enc)?),
            None => None,
        };
        let client_secret = match &account.encrypted_client_secret {
            Some(enc) => Some(self.cipher.decrypt(enc)?),
            None => None,
        };

        let manager = AuthManager::new(
            account.auth_kind,
            account.region.clone(),
            refresh_token,
            access_token,
            account.expires_at,
            client_id,
            client_secret,
            account.profile_arn.clone(),
            CredentialOrigin::Pool { account_id: account.id },
            self.http.clone(),
            self.config.token_refresh_threshold_secs,
            self.config.refresh_url_template.clone(),
            self.config.oidc_token_url_template.clone(),
        )
        .with_pool_writeback(self.store.clone(), self.cipher.clone());

        Ok(manager)
    }

    /// Records an upstream failure against an account, deactivating it
    /// once `error_threshold` consecutive errors accumulate (spec §4.7).
    /// Eviction of the cached manager forces the next `get_account` call
    /// for this id to rebuild from freshly-loaded store state.
    pub async fn report_error(&self, account_id: i64) -> anyhow::Result<()> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(());
        };
        let error_count = account.error_count + 1;
        let active = error_count < self.config.error_threshold;
        self.store.record_error(account_id, error_count, active).await?;
        if !active {
            tracing::warn!(account_id, error_count, "account deactivated after repeated errors");
            self.state.lock().await.managers.remove(&account_id);
        }
        Ok(())
    }

    pub async fn report_success(&self, account_id: i64) -> anyhow::Result<()> {
        self.store.record_success(account_id).await
    }

    pub async fn list_accounts(&self) -> anyhow::Result<Vec<Account>> {
        self.store.list_accounts().await
    }

    /// Adds an account directly to the backing store, e.g. for admin
    /// onboarding or single-tenant startup bootstrap from `REFRESH_TOKEN`/
    /// `KIRO_CREDS_FILE`/`KIRO_CLI_DB_FILE` (spec §6). The cipher used to
    /// encrypt `account`'s credential fields is the caller's responsibility.
    pub async fn insert_account(&self, account: Account) -> anyhow::Result<i64> {
        self.store.insert_account(account).await
    }

    pub async fn delete_account(&self, account_id: i64) -> anyhow::Result<()> {
        self.store.delete_account(account_id).await?;
        self.state.lock().await.managers.remove(&account_id);
        Ok(())
    }

    /// Forces a refresh on the named account's manager, e.g. from an admin
    /// endpoint or a startup health check.
    pub async fn refresh_account_token(&self, account_id: i64) -> anyhow::Result<()> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("account {account_id} not found"))?;
        let manager = {
            let mut state = self.state.lock().await;
            if let Some(m) = state.managers.get(&account_id) {
                m.clone()
            } else {
                let m = Arc::new(self.build_manager(&account)?);
                state.managers.insert(account_id, m.clone());
                m
            }
        };
        manager.force_refresh().await
    }
}
