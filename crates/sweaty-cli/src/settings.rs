//! Config file loading: `config.yaml`, then `config.local.yaml`, then env.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_yaml::Value;
use sweaty_core::config::Config;
use sweaty_core::Source;
use tracing::{debug, info};

pub const LOCAL_OVERRIDE_FILE: &str = "config.local.yaml";

/// Sibling override file for `path`.
pub fn local_override_path(path: &Path) -> PathBuf {
    path.with_file_name(LOCAL_OVERRIDE_FILE)
}

pub fn load_config(path: &Path) -> Result<Config> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Same as [`load_config`] with an injectable environment.
pub fn load_config_with<F>(path: &Path, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = read_yaml(path)?.unwrap_or_else(|| {
        info!(path = %path.display(), "config file not found; using defaults");
        Value::Mapping(Default::default())
    });
    let local = local_override_path(path);
    if let Some(overlay) = read_yaml(&local)? {
        debug!(path = %local.display(), "applying local config overrides");
        merge_yaml(&mut merged, overlay);
    }

    let mut config: Config = serde_yaml::from_value(merged)
        .with_context(|| format!("parsing {}", path.display()))?;
    apply_env_overrides(&mut config, env)?;
    config
        .validate(Utc::now())
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

fn read_yaml(path: &Path) -> Result<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value: Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    // an empty file parses as null
    Ok(Some(match value {
        Value::Null => Value::Mapping(Default::default()),
        other => other,
    }))
}

/// Deep-merge mappings; any other overlay value replaces the base wholesale.
pub fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = env("SWEATY_SOURCE").filter(|v| !v.trim().is_empty()) {
        config.source = raw.parse::<Source>().context("SWEATY_SOURCE")?;
    }
    if let Some(raw) = env("GARMIN_STRICT_TOKEN_ONLY") {
        config.garmin.strict_token_only = matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use sweaty_core::config::DayBoundary;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config_with(&dir.path().join("config.yaml"), env(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn local_file_deep_merges_over_base() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "source: strava\nsync:\n  recent_days: 3\n  per_page: 50\nactivities:\n  exclude_types: [Yoga, Pilates]\n",
        )
        .unwrap();
        std::fs::write(
            local_override_path(&path),
            "sync:\n  recent_days: 10\nactivities:\n  exclude_types: [Yoga]\nheatmaps:\n  day_boundary: utc\n",
        )
        .unwrap();

        let config = load_config_with(&path, env(&[])).unwrap();
        assert_eq!(config.sync.recent_days, 10);
        assert_eq!(config.sync.per_page, 50);
        assert_eq!(config.activities.exclude_types, vec!["Yoga".to_string()]);
        assert_eq!(config.heatmaps.day_boundary, DayBoundary::Utc);
    }

    #[test]
    fn env_overrides_source_and_garmin_strictness() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "source: strava\n").unwrap();

        let config = load_config_with(
            &path,
            env(&[("SWEATY_SOURCE", "Garmin"), ("GARMIN_STRICT_TOKEN_ONLY", "true")]),
        )
        .unwrap();
        assert_eq!(config.source, Source::Garmin);
        assert!(config.garmin.strict_token_only);

        let err = load_config_with(&path, env(&[("SWEATY_SOURCE", "polar")])).unwrap_err();
        assert!(format!("{err:#}").contains("polar"));
    }

    #[test]
    fn example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config.example.yaml");
        let config = load_config_with(&path, env(&[])).unwrap();
        assert_eq!(config.sync.lookback_years, Some(5));
        assert!(config.rate_limits.policy(Source::Garmin).is_unconstrained());
        assert!(!config.rate_limits.policy(Source::Strava).is_unconstrained());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  per_page: 0\n").unwrap();
        assert!(load_config_with(&path, env(&[])).is_err());

        std::fs::write(&path, "").unwrap();
        assert!(load_config_with(&path, env(&[])).is_ok());
    }
}
