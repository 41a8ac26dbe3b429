// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::Config;

/// Invalid or contradictory configuration.  Fatal at startup; every other
/// error in the system is scoped to a single instance.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid override {key:?}: {reason}")]
    BadOverride { key: String, reason: String },
}

/// Resolve a config path against `CONFIG_ROOT` when it is relative and does
/// not exist as given.
fn resolve_config_path(path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }
    match std::env::var("CONFIG_ROOT") {
        Ok(root) => {
            let expanded = shellexpand::tilde(&root).into_owned();
            Path::new(&expanded).join(path)
        }
        Err(_) => path.to_path_buf(),
    }
}

/// Load configuration by deep-merging the given YAML files in order, then
/// applying dotted-path overrides (`a.b.c=v`) on top.  Later layers win.
pub fn load(files: &[PathBuf], overrides: &[(String, String)]) -> Result<Config, ConfigError> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in files {
        let path = resolve_config_path(path);
        debug!(path = %path.display(), "loading config layer");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        merge_yaml(&mut merged, layer);
    }

    for (key, value) in overrides {
        apply_override(&mut merged, key, value)?;
    }

    apply_env_overrides(&mut merged)?;

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
    };
    validate(&config)?;
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
pub fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
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

/// Set `a.b.c` in the YAML tree to `value`, creating intermediate mappings.
/// The value string is parsed as YAML so numbers and booleans keep their type.
pub fn apply_override(
    tree: &mut serde_yaml::Value,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    if key.is_empty() || key.split('.').any(|seg| seg.is_empty()) {
        return Err(ConfigError::BadOverride {
            key: key.into(),
            reason: "empty path segment".into(),
        });
    }
    // Scalars keep their YAML type (numbers, booleans); anything that would
    // parse as a mapping or list — e.g. free text containing a colon — is
    // taken literally as a string.
    let parsed: serde_yaml::Value = match serde_yaml::from_str::<serde_yaml::Value>(value) {
        Ok(
            v @ (serde_yaml::Value::Null
            | serde_yaml::Value::Bool(_)
            | serde_yaml::Value::Number(_)
            | serde_yaml::Value::String(_)),
        ) => v,
        _ => serde_yaml::Value::String(value.to_string()),
    };

    let mut node = tree;
    let segments: Vec<&str> = key.split('.').collect();
    for seg in &segments[..segments.len() - 1] {
        if !matches!(node, serde_yaml::Value::Mapping(_)) {
            *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let serde_yaml::Value::Mapping(map) = node else {
            unreachable!()
        };
        node = map
            .entry(serde_yaml::Value::String((*seg).into()))
            .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    if !matches!(node, serde_yaml::Value::Mapping(_)) {
        *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    let serde_yaml::Value::Mapping(map) = node else {
        unreachable!()
    };
    map.insert(
        serde_yaml::Value::String(segments[segments.len() - 1].into()),
        parsed,
    );
    Ok(())
}

/// Numeric environment-variable overrides recognised across the system.
fn apply_env_overrides(tree: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    let numeric = [
        ("ENV_LONG_TIMEOUT", "env.long_action_timeout_secs"),
        ("ACTION_TIMEOUT", "env.action_timeout_secs"),
        ("ACTION_NO_OUTPUT_TIMEOUT", "env.no_output_timeout_secs"),
        ("MODEL_MAX_RETRIES", "agent.model.max_retries"),
    ];
    for (var, key) in numeric {
        if let Ok(raw) = std::env::var(var) {
            raw.parse::<u64>().map_err(|_| ConfigError::BadOverride {
                key: var.into(),
                reason: format!("expected an integer, got {raw:?}"),
            })?;
            apply_override(tree, key, &raw)?;
        }
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.num_workers == 0 {
        return Err(ConfigError::Invalid("num_workers must be at least 1".into()));
    }
    if config.env.repo.source_count() > 1 {
        return Err(ConfigError::Invalid(
            "env.repo: github_url, path, and image_path are mutually exclusive".into(),
        ));
    }
    if config.agent.model.per_instance_cost_limit < 0.0 || config.agent.model.total_cost_limit < 0.0
    {
        return Err(ConfigError::Invalid("cost limits must be non-negative".into()));
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
