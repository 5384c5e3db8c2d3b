// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::GatewayConfig;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/llmgate/config.yaml"));
    paths.push(PathBuf::from("/etc/llmgate/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/llmgate/config.yaml"));
        paths.push(home.join(".config/llmgate/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("llmgate/config.yaml"));
        paths.push(cfg.join("llmgate/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".llmgate/config.yaml"));
    paths.push(PathBuf::from(".llmgate/config.yml"));
    paths.push(PathBuf::from(".llmgate.yaml"));
    paths.push(PathBuf::from(".llmgate.yml"));
    paths.push(PathBuf::from("llmgate.yaml"));
    paths.push(PathBuf::from("llmgate.yml"));

    paths
}

/// Loads configuration by merging all discovered YAML files, then overlays
/// every environment variable in the configuration surface (env always
/// wins, see [`GatewayConfig::apply_env_overrides`]).
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: GatewayConfig = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        GatewayConfig::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    config.apply_env_overrides();
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("retry:\n  max_retries: 3\n  base_retry_delay_ms: 1000");
        let src = val("retry:\n  max_retries: 5");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["retry"]["max_retries"].as_i64(), Some(5));
        assert_eq!(dst["retry"]["base_retry_delay_ms"].as_i64(), Some(1000));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/llmgate_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.region, "us-east-1");
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "region: eu-west-1\nretry:\n  max_retries: 9").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.region, "eu-west-1");
        assert_eq!(cfg.retry.max_retries, 9);
    }
}
