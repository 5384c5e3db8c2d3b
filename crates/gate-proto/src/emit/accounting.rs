// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token accounting (spec §4.5 "Token accounting"): turns either an
//! upstream-reported `context_usage` percentage or a local character-count
//! heuristic into prompt/completion/total token figures, tagging which path
//! was used so callers can log provenance.

/// Which path produced a [`UsageTotals`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSource {
    /// Computed from an upstream-reported `context_usage` percentage.
    ContextPercentage,
    /// No `context_usage` was received; derived from local character counts
    /// with the configured correction factors (SPEC_FULL.md §10.4).
    LocalEstimate,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub source: UsageSource,
}

/// Rough per-character-to-token ratio used by both the pre-request estimate
/// and this post-hoc fallback; overridden by [`GatewayConfig::token_estimate`]
/// in practice (not referenced here to keep this crate config-agnostic).
fn estimate_tokens(chars: usize, chars_per_token: f64) -> u64 {
    if chars_per_token <= 0.0 {
        return 0;
    }
    (chars as f64 / chars_per_token).ceil() as u64
}

/// Computes completion tokens locally from the concatenated emitted text,
/// then either:
/// - derives `total_tokens` from the upstream's `context_usage` percentage
///   and the model's `max_input_tokens`, or
/// - falls back to a local estimate over the original request's characters,
///   corrected by `post_hoc_correction`.
pub fn finalize_usage(
    context_usage_pct: Option<f64>,
    max_input_tokens: u64,
    completion_text: &str,
    request_chars: usize,
    chars_per_token: f64,
    post_hoc_correction: f64,
) -> UsageTotals {
    let completion_tokens = estimate_tokens(completion_text.len(), chars_per_token);

    if let Some(pct) = context_usage_pct {
        let total_tokens = ((pct / 100.0) * max_input_tokens as f64).round() as u64;
        let prompt_tokens = total_tokens.saturating_sub(completion_tokens);
        return UsageTotals { prompt_tokens, completion_tokens, total_tokens, source: UsageSource::ContextPercentage };
    }

    let raw_prompt_tokens = estimate_tokens(request_chars, chars_per_token);
    let prompt_tokens = (raw_prompt_tokens as f64 * post_hoc_correction).round() as u64;
    UsageTotals {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        source: UsageSource::LocalEstimate,
    }
}

/// Pre-request estimate (SPEC_FULL.md §10.4): applied before the request is
/// even sent, to size a truncation budget or pre-flight check. Deliberately
/// conservative (`pre_estimate_correction` defaults to 0.95, i.e. slightly
/// under actual) so truncation decisions err toward sending more, not less.
pub fn pre_estimate_tokens(chars: usize, chars_per_token: f64, pre_estimate_correction: f64) -> u64 {
    (estimate_tokens(chars, chars_per_token) as f64 * pre_estimate_correction).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_percentage_path_is_tagged_and_subtracts_completion() {
        let usage = finalize_usage(Some(50.0), 200_000, "ok", 0, 4.0, 1.15);
        assert_eq!(usage.source, UsageSource::ContextPercentage);
        assert_eq!(usage.total_tokens, 100_000);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.prompt_tokens, 99_999);
    }

    #[test]
    fn local_estimate_path_applies_post_hoc_correction() {
        let usage = finalize_usage(None, 200_000, "", 400, 4.0, 1.15);
        assert_eq!(usage.source, UsageSource::LocalEstimate);
        // 400 chars / 4 chars-per-token = 100 tokens, *1.15 = 115.
        assert_eq!(usage.prompt_tokens, 115);
        assert_eq!(usage.total_tokens, 115);
    }

    #[test]
    fn pre_estimate_applies_conservative_correction() {
        let tokens = pre_estimate_tokens(400, 4.0, 0.95);
        assert_eq!(tokens, 95);
    }
}
