// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/swarm/config.yaml"));
    paths.push(PathBuf::from("/etc/swarm/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/swarm/config.yaml"));
        paths.push(home.join(".config/swarm/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("swarm/config.yaml"));
        paths.push(cfg.join("swarm/config.yml"));
    }

    paths.push(PathBuf::from(".swarm/config.yaml"));
    paths.push(PathBuf::from(".swarm/config.yml"));
    paths.push(PathBuf::from("swarm.yaml"));
    paths.push(PathBuf::from("swarm.yml"));

    paths
}

/// Load configuration by merging every discovered YAML layer in priority
/// order. `extra` may supply an explicit path (the orchestrator's
/// `--config` flag), applied last so it always wins.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
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
    fn merge_nested_tables() {
        let mut dst = val("orchestrator:\n  model:\n    model: a\n    temperature: 0.1");
        let src = val("orchestrator:\n  model:\n    model: b");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["orchestrator"]["model"]["model"].as_str(), Some("b"));
        assert_eq!(dst["orchestrator"]["model"]["temperature"].as_f64(), Some(0.1));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/swarm_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "orchestrator:\n  model:\n    model: gpt-4o-mini\n").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.orchestrator.model.model, "gpt-4o-mini");
    }
}
