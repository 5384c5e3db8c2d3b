// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single-tenant startup bootstrap (spec §6: `REFRESH_TOKEN` /
//! `KIRO_CREDS_FILE` / `KIRO_CLI_DB_FILE`). Seeds exactly one account into
//! the pool from whichever credential source is configured, so a
//! single-operator deployment never has to go through account-admin
//! onboarding. Grounded on the upstream reference implementation's
//! `KiroAuthManager.__init__` credential-source priority
//! (`sqlite_db` > `creds_file` > bare `refresh_token`) and its
//! `SQLITE_TOKEN_KEYS` search order (`auth.py`).

use chrono::{DateTime, Utc};
use gate_auth::{AccountPool, AuthKind};
use gate_config::CredentialSourceConfig;
use gate_core::CredentialCipher;
use serde_json::Value;

/// Token keys tried in priority order when loading from a kiro-cli sqlite
/// database, matching the original implementation's `SQLITE_TOKEN_KEYS`.
const SQLITE_TOKEN_KEYS: [&str; 3] =
    ["kirocli:social:token", "kirocli:odic:token", "codewhisperer:odic:token"];

struct LoadedCredentials {
    refresh_token: String,
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    profile_arn: Option<String>,
}

/// Seeds the pool with one `simple_refresh` account if any single-tenant
/// credential source is configured. A no-op when `credentials` is empty
/// (multi-tenant mode, accounts managed entirely through admin onboarding).
pub async fn seed_single_tenant_account(
    credentials: &CredentialSourceConfig,
    region: &str,
    cipher: &CredentialCipher,
    pool: &AccountPool,
) -> anyhow::Result<()> {
    let Some(loaded) = load_credentials(credentials)? else {
        return Ok(());
    };

    let encrypted_access_token =
        loaded.access_token.as_deref().map(|t| cipher.encrypt(t)).transpose()?;

    pool.insert_account(gate_auth::Account {
        id: 0,
        name: "single-tenant".to_string(),
        auth_kind: AuthKind::SimpleRefresh,
        region: region.to_string(),
        encrypted_refresh_token: cipher.encrypt(&loaded.refresh_token)?,
        encrypted_access_token,
        encrypted_client_id: None,
        encrypted_client_secret: None,
        expires_at: loaded.expires_at,
        profile_arn: loaded.profile_arn,
        active: true,
        error_count: 0,
        priority: 0,
        created_at: Utc::now(),
    })
    .await?;

    tracing::info!("seeded single-tenant account from configured credential source");
    Ok(())
}

/// `sqlite_db` takes priority over `creds_file`, which takes priority over
/// a bare `refresh_token`, matching the original's constructor order.
fn load_credentials(credentials: &CredentialSourceConfig) -> anyhow::Result<Option<LoadedCredentials>> {
    if let Some(db_path) = &credentials.cli_db_file {
        if db_path.exists() {
            return load_from_sqlite(db_path);
        }
        tracing::warn!(path = %db_path.display(), "configured cli_db_file does not exist, skipping");
    }

    if let Some(file_path) = &credentials.creds_file {
        if file_path.exists() {
            return load_from_file(file_path);
        }
        tracing::warn!(path = %file_path.display(), "configured creds_file does not exist, skipping");
    }

    if let Some(token) = &credentials.refresh_token {
        return Ok(Some(LoadedCredentials {
            refresh_token: token.clone(),
            access_token: None,
            expires_at: None,
            profile_arn: None,
        }));
    }

    Ok(None)
}

fn load_from_file(path: &std::path::Path) -> anyhow::Result<Option<LoadedCredentials>> {
    let text = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&text)?;
    let Some(refresh_token) = data.get("refreshToken").and_then(Value::as_str) else {
        anyhow::bail!("creds_file {} missing refreshToken", path.display());
    };
    Ok(Some(LoadedCredentials {
        refresh_token: refresh_token.to_string(),
        access_token: data.get("accessToken").and_then(Value::as_str).map(str::to_string),
        expires_at: data
            .get("expiresAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        profile_arn: data.get("profileArn").and_then(Value::as_str).map(str::to_string),
    }))
}

fn load_from_sqlite(path: &std::path::Path) -> anyhow::Result<Option<LoadedCredentials>> {
    let conn = rusqlite::Connection::open(path)?;
    for key in SQLITE_TOKEN_KEYS {
        let row: Option<String> =
            conn.query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |r| r.get(0)).ok();
        let Some(raw) = row else { continue };
        let data: Value = serde_json::from_str(&raw)?;
        let Some(refresh_token) = data.get("refresh_token").and_then(Value::as_str) else { continue };
        tracing::debug!(key, "loaded single-tenant credentials from cli_db_file");
        return Ok(Some(LoadedCredentials {
            refresh_token: refresh_token.to_string(),
            access_token: data.get("access_token").and_then(Value::as_str).map(str::to_string),
            expires_at: data
                .get("expires_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            profile_arn: data.get("profile_arn").and_then(Value::as_str).map(str::to_string),
        }));
    }
    Ok(None)
}
