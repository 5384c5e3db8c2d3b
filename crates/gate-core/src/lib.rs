// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ambient gateway machinery shared by every inbound dialect: transport,
//! retry, rate limiting, key management, usage accounting, pricing, and the
//! persistence seams each of those is built against.

pub mod api_keys;
pub mod cipher;
pub mod error;
pub mod http_client;
pub mod network_errors;
pub mod pricing;
pub mod rate_limiter;
pub mod truncation;
pub mod usage;

pub use api_keys::{ApiKeyManager, ApiKeyRecord, ApiKeyStore, ApiKeyUsageTotals, InMemoryApiKeyStore};
pub use cipher::{CipherError, CredentialCipher};
pub use error::GatewayError;
pub use http_client::{HttpClientWithRetry, RetryPolicy, TokenProvider};
pub use network_errors::{classify_transport_error, format_transport_error, ErrorCategory, TransportErrorInfo};
pub use pricing::{calculate_cost, CostEstimate};
pub use rate_limiter::{GlobalRateLimiter, Permit, RateLimiterStats};
pub use truncation::{ContentTruncationEntry, ToolTruncationEntry, TruncationRecoveryStore};
pub use usage::{InMemoryUsageStore, UsageAggregate, UsageRecord, UsageRecorder, UsageStore};
