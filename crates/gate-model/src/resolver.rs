// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model Resolver (C1): normalizes client-supplied model names into the
//! upstream's canonical identifiers, with alias and hidden-model layers.
//!
//! Resolution never fails (spec §4.1) — an unresolved name is passed through
//! verbatim and the upstream is the final arbiter of whether it exists.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Alias,
    Hidden,
    Cache,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub internal_id: String,
    pub source: ResolutionSource,
    pub normalized: String,
    pub is_verified: bool,
}

/// Static configuration for the resolver: the alias map, the hidden-model
/// map (display name → opaque upstream id, e.g. the 1M auto-upgrade table),
/// and the set of ids to exclude from `/v1/models` even though they resolve.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub aliases: HashMap<String, String>,
    pub hidden_models: HashMap<String, String>,
    pub hidden_from_list: HashSet<String>,
}

/// The dynamic cache populated from the upstream's model-list endpoint at
/// startup (spec §4.1 layer 4), with a built-in fallback list on failure.
pub struct ModelCache {
    known: HashSet<String>,
}

impl ModelCache {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self { known: known.into_iter().collect() }
    }

    /// The built-in fallback list used when the upstream's model-list call
    /// fails at startup (spec §4.1: "with a built-in fallback list on
    /// failure").
    pub fn fallback() -> Self {
        Self::new(
            [
                "claude-opus-4.6",
                "claude-sonnet-4.5",
                "claude-sonnet-4.5-1m",
                "claude-haiku-4.5",
                "claude-3.7-sonnet",
                "claude-3.5-sonnet",
            ]
            .map(String::from),
        )
    }

    pub fn is_valid(&self, normalized: &str) -> bool {
        self.known.contains(normalized)
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.known.iter().cloned().collect()
    }
}

pub struct ModelResolver {
    config: ResolverConfig,
    cache: ModelCache,
}

impl ModelResolver {
    pub fn new(config: ResolverConfig, cache: ModelCache) -> Self {
        Self { config, cache }
    }

    /// Resolve an external model name. Never fails.
    pub fn resolve(&self, external_model: &str) -> Resolution {
        // Layer 0: alias.
        let aliased = self
            .config
            .aliases
            .get(external_model)
            .map(String::as_str)
            .unwrap_or(external_model);

        // Layer 1: normalize.
        let normalized = normalize_model_name(aliased);

        // Layer 2: hidden-model map (checked before the cache so redirects
        // like the 1M auto-upgrade take priority over a cache hit).
        if let Some(internal_id) = self.config.hidden_models.get(&normalized) {
            return Resolution {
                internal_id: internal_id.clone(),
                source: ResolutionSource::Hidden,
                normalized,
                is_verified: true,
            };
        }

        // Layer 3: dynamic cache.
        if self.cache.is_valid(&normalized) {
            return Resolution {
                internal_id: normalized.clone(),
                source: ResolutionSource::Cache,
                normalized,
                is_verified: true,
            };
        }

        // Layer 4: passthrough.
        Resolution {
            internal_id: normalized.clone(),
            source: ResolutionSource::Passthrough,
            normalized,
            is_verified: false,
        }
    }

    /// Union of (cache ∪ hidden) minus hidden-from-list, plus alias keys
    /// (spec §4.1 "Listing endpoint").
    pub fn available_models(&self) -> Vec<String> {
        let mut models: HashSet<String> = self.cache.all_ids().into_iter().collect();
        models.extend(self.config.hidden_models.keys().cloned());
        for hidden in &self.config.hidden_from_list {
            models.remove(hidden);
        }
        models.extend(self.config.aliases.keys().cloned());
        let mut sorted: Vec<String> = models.into_iter().collect();
        sorted.sort();
        sorted
    }
}

struct Patterns {
    standard: Regex,
    no_minor: Regex,
    legacy: Regex,
    dot_with_date: Regex,
    inverted_with_suffix: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // claude-{family}-{major}(-{minor 1-2 digits})?(-1m)?(-{date|latest|trailing})?
        standard: Regex::new(
            r"^(claude-(?:haiku|sonnet|opus)-\d+)-(\d{1,2})(?:-(1m))?(?:-(?:\d{8}|latest|\d+))?$",
        )
        .unwrap(),
        no_minor: Regex::new(r"^(claude-(?:haiku|sonnet|opus)-\d+)(?:-\d{8})?$").unwrap(),
        legacy: Regex::new(
            r"^(claude)-(\d+)-(\d+)-(haiku|sonnet|opus)(?:-(?:\d{8}|latest|\d+))?$",
        )
        .unwrap(),
        dot_with_date: Regex::new(
            r"^(claude-(?:\d+\.\d+-)?(?:haiku|sonnet|opus)(?:-\d+\.\d+)?)-\d{8}$",
        )
        .unwrap(),
        inverted_with_suffix: Regex::new(r"^claude-(\d+)\.(\d+)-(haiku|sonnet|opus)-(.+)$")
            .unwrap(),
    })
}

/// Normalize a client-supplied model name into the upstream's canonical
/// dotted form. Pure function, order-sensitive (spec §4.1): five patterns
/// tried in the fixed order below, first match wins.
pub fn normalize_model_name(name: &str) -> String {
    if name.is_empty() {
        return name.to_string();
    }
    let lower = name.to_lowercase();
    let p = patterns();

    if let Some(caps) = p.standard.captures(&lower) {
        let base = &caps[1];
        let minor = &caps[2];
        let suffix = caps.get(3).map(|m| format!("-{}", m.as_str())).unwrap_or_default();
        return format!("{base}.{minor}{suffix}");
    }
    if let Some(caps) = p.no_minor.captures(&lower) {
        return caps[1].to_string();
    }
    if let Some(caps) = p.legacy.captures(&lower) {
        let prefix = &caps[1];
        let major = &caps[2];
        let minor = &caps[3];
        let family = &caps[4];
        return format!("{prefix}-{major}.{minor}-{family}");
    }
    if let Some(caps) = p.dot_with_date.captures(&lower) {
        return caps[1].to_string();
    }
    if let Some(caps) = p.inverted_with_suffix.captures(&lower) {
        let major = &caps[1];
        let minor = &caps[2];
        let family = &caps[3];
        return format!("claude-{family}-{major}.{minor}");
    }
    lower
}

/// Extract `haiku`/`sonnet`/`opus` from a model name, if present. Used to
/// keep suggestion lists family-scoped.
pub fn extract_model_family(model_name: &str) -> Option<&'static str> {
    let lower = model_name.to_lowercase();
    for family in ["haiku", "sonnet", "opus"] {
        if lower.contains(family) {
            return Some(family);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dash_to_dot_minor() {
        assert_eq!(normalize_model_name("claude-haiku-4-5"), "claude-haiku-4.5");
    }

    #[test]
    fn strips_trailing_date_suffix() {
        assert_eq!(normalize_model_name("claude-haiku-4-5-20251001"), "claude-haiku-4.5");
    }

    #[test]
    fn strips_trailing_latest_suffix() {
        assert_eq!(normalize_model_name("claude-haiku-4-5-latest"), "claude-haiku-4.5");
    }

    #[test]
    fn preserves_1m_suffix() {
        assert_eq!(normalize_model_name("claude-sonnet-4-5-1m"), "claude-sonnet-4.5-1m");
    }

    #[test]
    fn preserves_1m_suffix_with_date() {
        assert_eq!(
            normalize_model_name("claude-sonnet-4-5-1m-20251001"),
            "claude-sonnet-4.5-1m"
        );
    }

    #[test]
    fn no_minor_version_strips_date_only() {
        assert_eq!(normalize_model_name("claude-sonnet-4-20250514"), "claude-sonnet-4");
    }

    #[test]
    fn legacy_family_last_form() {
        assert_eq!(normalize_model_name("claude-3-7-sonnet"), "claude-3.7-sonnet");
    }

    #[test]
    fn legacy_family_last_form_with_date() {
        assert_eq!(
            normalize_model_name("claude-3-7-sonnet-20250219"),
            "claude-3.7-sonnet"
        );
    }

    #[test]
    fn dot_form_with_trailing_date_is_stripped() {
        assert_eq!(normalize_model_name("claude-3.7-sonnet-20250219"), "claude-3.7-sonnet");
    }

    #[test]
    fn inverted_form_with_qualifier() {
        assert_eq!(normalize_model_name("claude-4.5-opus-high"), "claude-opus-4.5");
    }

    #[test]
    fn inverted_form_with_different_qualifier() {
        assert_eq!(normalize_model_name("claude-4.5-sonnet-low"), "claude-sonnet-4.5");
    }

    #[test]
    fn unrecognized_names_pass_through_lowercased() {
        assert_eq!(normalize_model_name("GPT-4o"), "gpt-4o");
    }

    #[test]
    fn empty_name_returned_as_is() {
        assert_eq!(normalize_model_name(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        // Property 1 (spec §8): resolve(resolve(m).normalized).normalized == resolve(m).normalized
        for input in [
            "claude-haiku-4-5-20251001",
            "claude-3-7-sonnet",
            "claude-4.5-opus-high",
            "auto",
            "gpt-4o",
        ] {
            let once = normalize_model_name(input);
            let twice = normalize_model_name(&once);
            assert_eq!(once, twice, "normalization must be idempotent for {input}");
        }
    }

    fn resolver_with_hidden_upgrade() -> ModelResolver {
        let mut hidden = HashMap::new();
        hidden.insert("claude-sonnet-4.5".to_string(), "claude-sonnet-4.5-1m".to_string());
        hidden.insert(
            "claude-3.7-sonnet".to_string(),
            "CLAUDE_3_7_SONNET_20250219_V1_0".to_string(),
        );
        let config = ResolverConfig { aliases: HashMap::new(), hidden_models: hidden, hidden_from_list: HashSet::new() };
        ModelResolver::new(config, ModelCache::fallback())
    }

    #[test]
    fn hidden_model_wins_over_cache() {
        let resolver = resolver_with_hidden_upgrade();
        let r = resolver.resolve("claude-sonnet-4-5");
        assert_eq!(r.source, ResolutionSource::Hidden);
        assert_eq!(r.internal_id, "claude-sonnet-4.5-1m");
    }

    #[test]
    fn legacy_name_resolves_through_hidden_map() {
        let resolver = resolver_with_hidden_upgrade();
        let r = resolver.resolve("claude-3-7-sonnet-20250219");
        assert_eq!(r.internal_id, "CLAUDE_3_7_SONNET_20250219_V1_0");
        assert!(r.is_verified);
    }

    #[test]
    fn unknown_model_passes_through_unverified() {
        let resolver = resolver_with_hidden_upgrade();
        let r = resolver.resolve("some-future-model");
        assert_eq!(r.source, ResolutionSource::Passthrough);
        assert!(!r.is_verified);
        assert_eq!(r.internal_id, "some-future-model");
    }

    #[test]
    fn alias_is_resolved_before_normalization() {
        let mut aliases = HashMap::new();
        aliases.insert("auto-kiro".to_string(), "claude-sonnet-4-5".to_string());
        let mut hidden = HashMap::new();
        hidden.insert("claude-sonnet-4.5".to_string(), "claude-sonnet-4.5-1m".to_string());
        let config = ResolverConfig { aliases, hidden_models: hidden, hidden_from_list: HashSet::new() };
        let resolver = ModelResolver::new(config, ModelCache::fallback());
        let r = resolver.resolve("auto-kiro");
        assert_eq!(r.internal_id, "claude-sonnet-4.5-1m");
    }

    #[test]
    fn available_models_excludes_hidden_from_list() {
        let mut hidden = HashMap::new();
        hidden.insert("auto".to_string(), "claude-sonnet-4.5".to_string());
        let mut hidden_from_list = HashSet::new();
        hidden_from_list.insert("auto".to_string());
        let config = ResolverConfig { aliases: HashMap::new(), hidden_models: hidden, hidden_from_list };
        let resolver = ModelResolver::new(config, ModelCache::fallback());
        assert!(!resolver.available_models().contains(&"auto".to_string()));
    }

    #[test]
    fn family_extraction_scopes_suggestions() {
        assert_eq!(extract_model_family("claude-haiku-4.5"), Some("haiku"));
        assert_eq!(extract_model_family("claude-sonnet-4-5"), Some("sonnet"));
        assert_eq!(extract_model_family("gpt-4"), None);
    }
}
