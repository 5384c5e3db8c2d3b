// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static catalog of canonical model identifiers and their context windows.
//!
//! Used by the token-accounting step in `gate-proto`'s re-emitters (spec
//! §4.5): `total_tokens = round(context_usage_percentage/100 *
//! max_input_tokens(model))`. The catalog is bundled as YAML, the same
//! `include_str!` pattern the teacher uses for its own model metadata.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Canonical (post-resolution) model identifier, e.g. `claude-sonnet-4.5-1m`.
    pub id: String,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Entries from the bundled static catalog.
pub fn static_catalog() -> &'static [ModelCatalogEntry] {
    static CATALOG: std::sync::OnceLock<Vec<ModelCatalogEntry>> = std::sync::OnceLock::new();
    CATALOG.get_or_init(|| {
        let yaml = include_str!("../models.yaml");
        let catalog: CatalogFile =
            serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
        catalog.models
    })
}

/// Look up a canonical model id in the static catalog.
pub fn lookup(model_id: &str) -> Option<&'static ModelCatalogEntry> {
    static_catalog().iter().find(|e| e.id == model_id)
}

/// Max input tokens for `model_id`, falling back to `default` when the model
/// is not in the bundled catalog (e.g. it was resolved via passthrough to an
/// identifier the upstream knows about but this gateway does not).
pub fn max_input_tokens(model_id: &str, default: u32) -> u32 {
    lookup(model_id).map(|e| e.max_input_tokens).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn sonnet_1m_variant_present() {
        let e = lookup("claude-sonnet-4.5-1m").expect("1m variant must be catalogued");
        assert!(e.max_input_tokens >= 1_000_000);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(max_input_tokens("no-such-model", 200_000), 200_000);
    }
}
