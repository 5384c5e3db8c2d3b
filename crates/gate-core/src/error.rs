// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Public error surface (SPEC_FULL.md §7). Every component-specific error
//! type eventually converts into a [`GatewayError`] at the HTTP boundary;
//! anything unexpected is folded into `Internal` via `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("authentication_error: {0}")]
    Authentication(String),

    #[error("rate_limited: {0}")]
    RateLimited(String),

    #[error("upstream_error: {0}")]
    Upstream(String),

    #[error("not_found: {0}")]
    NotFound(String),

    /// `account_unhealthy` (spec §7): the account pool has no active,
    /// under-threshold account to hand out.
    #[error("account_unhealthy: {0}")]
    AccountUnhealthy(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// The HTTP status this error should surface as, independent of dialect.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Authentication(_) => 401,
            GatewayError::RateLimited(_) => 429,
            GatewayError::Upstream(_) => 502,
            GatewayError::NotFound(_) => 404,
            GatewayError::AccountUnhealthy(_) => 503,
            GatewayError::Internal(_) => 500,
        }
    }

    /// A short machine-readable code, used by both dialects' error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::AccountUnhealthy(_) => "account_unhealthy",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(GatewayError::RateLimited("too many".into()).http_status(), 429);
    }

    #[test]
    fn anyhow_error_becomes_internal_via_from() {
        let err: GatewayError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(err.http_status(), 500);
    }
}
