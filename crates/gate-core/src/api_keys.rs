// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! API-Key Manager (C11, spec §4.11): client-facing key lifecycle, distinct
//! from the upstream account credentials `gate-auth` manages. Grounded on
//! the upstream's `APIKeyManager`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_id: String,
    pub key_hash: String,
    pub name: String,
    pub is_active: bool,
    pub usage_limit_tokens: Option<u64>,
    pub usage_limit_requests: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyUsageTotals {
    pub total_requests: u64,
    pub total_tokens: u64,
}

/// Persistence seam (C17) for API keys: swap in a real backend without
/// touching key-generation or validation logic.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert(&self, record: ApiKeyRecord) -> anyhow::Result<ApiKeyRecord>;
    async fn find_by_key_id(&self, key_id: &str) -> anyhow::Result<Option<ApiKeyRecord>>;
    async fn touch_last_used(&self, id: i64) -> anyhow::Result<()>;
    async fn set_active(&self, id: i64, active: bool) -> anyhow::Result<bool>;
    async fn delete(&self, id: i64) -> anyhow::Result<bool>;
    async fn usage_totals(&self, id: i64) -> anyhow::Result<ApiKeyUsageTotals>;
}

/// In-memory `ApiKeyStore`, used in tests and as a reference implementation.
#[derive(Default)]
pub struct InMemoryApiKeyStore {
    keys: tokio::sync::Mutex<Vec<ApiKeyRecord>>,
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert(&self, mut record: ApiKeyRecord) -> anyhow::Result<ApiKeyRecord> {
        let mut keys = self.keys.lock().await;
        record.id = keys.len() as i64 + 1;
        keys.push(record.clone());
        Ok(record)
    }

    async fn find_by_key_id(&self, key_id: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        Ok(self.keys.lock().await.iter().find(|k| k.key_id == key_id).cloned())
    }

    async fn touch_last_used(&self, id: i64) -> anyhow::Result<()> {
        if let Some(k) = self.keys.lock().await.iter_mut().find(|k| k.id == id) {
            k.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_active(&self, id: i64, active: bool) -> anyhow::Result<bool> {
        if let Some(k) = self.keys.lock().await.iter_mut().find(|k| k.id == id) {
            k.is_active = active;
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        let mut keys = self.keys.lock().await;
        let before = keys.len();
        keys.retain(|k| k.id != id);
        Ok(keys.len() != before)
    }

    async fn usage_totals(&self, _id: i64) -> anyhow::Result<ApiKeyUsageTotals> {
        Ok(ApiKeyUsageTotals::default())
    }
}

const BCRYPT_COST: u32 = 12;
const KEY_PREFIX_LEN: usize = 15;

pub struct ApiKeyManager<S: ApiKeyStore> {
    store: S,
}

impl<S: ApiKeyStore> ApiKeyManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Generates `"sk-" + 32 url-safe-random bytes`, stores `{prefix, hash}`
    /// and metadata, and returns the plaintext key exactly once.
    pub async fn create_key(
        &self,
        name: &str,
        usage_limit_tokens: Option<u64>,
        usage_limit_requests: Option<u64>,
    ) -> anyhow::Result<(String, ApiKeyRecord)> {
        let mut random_bytes = [0u8; 32];
        random_bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        random_bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        use base64::Engine;
        let suffix = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
        let plaintext = format!("sk-{suffix}");
        let key_id: String = plaintext.chars().take(KEY_PREFIX_LEN).collect();
        let key_hash = bcrypt::hash(&plaintext, BCRYPT_COST)?;

        let record = self
            .store
            .insert(ApiKeyRecord {
                id: 0,
                key_id,
                key_hash,
                name: name.to_string(),
                is_active: true,
                usage_limit_tokens,
                usage_limit_requests,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await?;

        Ok((plaintext, record))
    }

    /// Rejects keys missing the `sk-` prefix, unknown prefixes, bcrypt
    /// mismatches, and inactive keys; stamps `last_used_at` on success.
    pub async fn validate_key(&self, plaintext: &str) -> Result<ApiKeyRecord, GatewayError> {
        if !plaintext.starts_with("sk-") {
            return Err(GatewayError::Authentication("invalid API key".into()));
        }
        let key_id: String = plaintext.chars().take(KEY_PREFIX_LEN).collect();

        let record = self
            .store
            .find_by_key_id(&key_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Authentication("invalid API key".into()))?;

        let matches = bcrypt::verify(plaintext, &record.key_hash).map_err(|e| GatewayError::Internal(e.into()))?;
        if !matches {
            return Err(GatewayError::Authentication("invalid API key".into()));
        }
        if !record.is_active {
            return Err(GatewayError::Authentication("API key is deactivated".into()));
        }

        self.store.touch_last_used(record.id).await.map_err(GatewayError::Internal)?;
        Ok(record)
    }

    pub async fn deactivate_key(&self, id: i64) -> anyhow::Result<bool> {
        self.store.set_active(id, false).await
    }

    pub async fn delete_key(&self, id: i64) -> anyhow::Result<bool> {
        self.store.delete(id).await
    }

    /// Compares summed historical usage (C12) against configured limits.
    pub async fn check_usage_limits(&self, record: &ApiKeyRecord) -> Result<(), GatewayError> {
        self.check_usage_limits_for(record.id, record.usage_limit_tokens, record.usage_limit_requests).await
    }

    /// Same check as [`Self::check_usage_limits`], addressed by the key's
    /// numeric id and limits directly rather than a freshly reloaded
    /// [`ApiKeyRecord`] — what a request handler has on hand after
    /// middleware validation, via [`crate::GatewayError`] alone.
    pub async fn check_usage_limits_for(
        &self,
        id: i64,
        usage_limit_tokens: Option<u64>,
        usage_limit_requests: Option<u64>,
    ) -> Result<(), GatewayError> {
        if usage_limit_tokens.is_none() && usage_limit_requests.is_none() {
            return Ok(());
        }
        let totals = self.store.usage_totals(id).await.map_err(GatewayError::Internal)?;
        if let Some(limit) = usage_limit_tokens {
            if totals.total_tokens >= limit {
                return Err(GatewayError::RateLimited(format!(
                    "token limit exceeded ({}/{})",
                    totals.total_tokens, limit
                )));
            }
        }
        if let Some(limit) = usage_limit_requests {
            if totals.total_requests >= limit {
                return Err(GatewayError::RateLimited(format!(
                    "request limit exceeded ({}/{})",
                    totals.total_requests, limit
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_key_round_trips_through_validate() {
        let manager = ApiKeyManager::new(InMemoryApiKeyStore::default());
        let (plaintext, record) = manager.create_key("test key", None, None).await.unwrap();
        assert!(plaintext.starts_with("sk-"));
        let validated = manager.validate_key(&plaintext).await.unwrap();
        assert_eq!(validated.id, record.id);
        assert!(validated.last_used_at.is_some());
    }

    #[tokio::test]
    async fn missing_prefix_is_rejected() {
        let manager = ApiKeyManager::new(InMemoryApiKeyStore::default());
        let err = manager.validate_key("not-a-key").await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[tokio::test]
    async fn deactivated_key_is_rejected() {
        let manager = ApiKeyManager::new(InMemoryApiKeyStore::default());
        let (plaintext, record) = manager.create_key("test key", None, None).await.unwrap();
        manager.deactivate_key(record.id).await.unwrap();
        let err = manager.validate_key(&plaintext).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[tokio::test]
    async fn tampered_key_fails_bcrypt_verification() {
        let manager = ApiKeyManager::new(InMemoryApiKeyStore::default());
        let (plaintext, _) = manager.create_key("test key", None, None).await.unwrap();
        let mut tampered = plaintext.clone();
        tampered.push('x');
        let err = manager.validate_key(&tampered).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }
}
