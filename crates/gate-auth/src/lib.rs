// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential lifecycle (C6) and account pool (C7). Grounded on the
//! upstream reference implementation's `auth.py`, `account_pool.py`, and
//! `oauth_flow.py` — there is no direct teacher analog for a multi-tenant
//! credential pool, so the algorithms are carried over verbatim and
//! expressed in the teacher's general Rust idiom (per-instance
//! `tokio::sync::Mutex`, `async_trait` at the seam gate-core defines).

pub mod manager;
pub mod oidc;
pub mod pool;

pub use manager::{AuthKind, AuthManager, CredentialOrigin};
pub use oidc::{ExchangedTokens, OidcOnboarding, PendingAuthorization, RegisteredClient};
pub use pool::{Account, AccountPool, AccountPoolConfig, AccountStore, InMemoryAccountStore};
