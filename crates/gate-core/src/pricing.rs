// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pricing / Cost Estimation (C18, spec §4.18): best-effort cost estimates
//! for logging and usage reporting, not used to enforce or bill anything.
//! Grounded on the upstream's `pricing.py`.

use std::sync::OnceLock;

use regex::Regex;

/// (input $ / 1M tokens, output $ / 1M tokens), keyed by short family name.
static MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("opus-4.6", 15.0, 75.0),
    ("opus-4.5", 15.0, 75.0),
    ("opus-4", 15.0, 75.0),
    ("opus-3", 15.0, 75.0),
    ("sonnet-4.5", 3.0, 15.0),
    ("sonnet-4", 3.0, 15.0),
    ("sonnet-3.7", 3.0, 15.0),
    ("sonnet-3.5", 3.0, 15.0),
    ("sonnet-3", 3.0, 15.0),
    ("haiku-4.5", 1.0, 5.0),
    ("haiku-3.5", 0.8, 4.0),
    ("haiku-3", 0.25, 1.25),
];

fn normalize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[._]").unwrap())
}

fn legacy_date_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-\d{8}$").unwrap())
}

fn legacy_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)-(\d)-(sonnet|haiku|opus)").unwrap())
}

#[derive(Debug, Clone, Default)]
pub struct CostEstimate {
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub total_cost: Option<f64>,
}

/// Normalizes dashes/dots and rewrites legacy `"3-5-sonnet"`-style naming to
/// `"sonnet-3.5"` before substring-matching against the pricing table.
fn normalize_model_id(model: &str) -> String {
    let lower = model.to_lowercase();
    let rewritten = legacy_version_re().replace(&lower, "$3-$1.$2").to_string();
    let without_date = legacy_date_suffix_re().replace(&rewritten, "").to_string();
    normalize_re().replace_all(&without_date, "-").to_string()
}

fn match_model(model: &str) -> Option<(f64, f64)> {
    let normalized = normalize_model_id(model);
    MODEL_PRICING
        .iter()
        .find(|(family, _, _)| normalized.contains(family))
        .map(|(_, input, output)| (*input, *output))
}

/// Returns `None` fields when the model id doesn't match any known family,
/// rather than guessing — callers log the estimate as unavailable.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> CostEstimate {
    let Some((input_rate, output_rate)) = match_model(model) else {
        return CostEstimate::default();
    };
    let input_cost = (input_tokens as f64 / 1_000_000.0) * input_rate;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * output_rate;
    CostEstimate { input_cost: Some(input_cost), output_cost: Some(output_cost), total_cost: Some(input_cost + output_cost) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_plain_family_name() {
        let estimate = calculate_cost("claude-sonnet-4-5-20250929", 1_000_000, 1_000_000);
        assert_eq!(estimate.input_cost, Some(3.0));
        assert_eq!(estimate.output_cost, Some(15.0));
        assert_eq!(estimate.total_cost, Some(18.0));
    }

    #[test]
    fn matches_legacy_dashed_version_naming() {
        let estimate = calculate_cost("claude-3-5-sonnet-20241022", 1_000_000, 0);
        assert_eq!(estimate.input_cost, Some(3.0));
    }

    #[test]
    fn unmatched_model_returns_none_fields() {
        let estimate = calculate_cost("some-unknown-model", 1000, 1000);
        assert!(estimate.input_cost.is_none());
        assert!(estimate.total_cost.is_none());
    }

    #[test]
    fn zero_tokens_yields_zero_cost_for_matched_model() {
        let estimate = calculate_cost("claude-haiku-3", 0, 0);
        assert_eq!(estimate.total_cost, Some(0.0));
    }
}
