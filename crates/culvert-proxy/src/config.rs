// Proxy defaults with environment and optional YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Hard safety cap for any single READ allocation.
///
/// The `read-size` header is attacker-controlled from the proxy's point of
/// view; without a cap a single message could demand an enormous buffer.
/// Override with `CULVERT_MAX_READ_SIZE`.
pub(crate) const DEFAULT_MAX_READ_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Largest READ buffer the proxy will allocate per request.
    pub max_read_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ProxyConfigOverride {
    max_read_size: Option<usize>,
}

impl ProxyConfig {
    /// Environment defaults, then an optional YAML override file (explicit
    /// path or `CULVERT_PROXY_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("CULVERT_PROXY_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read proxy config: {path}"))?;
            let override_cfg: ProxyConfigOverride =
                serde_yaml::from_str(&contents).context("parse proxy config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("CULVERT_MAX_READ_SIZE") {
            config.max_read_size = value;
        }
        config
    }
}

impl ProxyConfigOverride {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(value) = self.max_read_size
            && value > 0
        {
            config.max_read_size = value;
        }
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_read_size, DEFAULT_MAX_READ_SIZE);
    }

    #[test]
    fn override_applies_positive_values_only() {
        let mut config = ProxyConfig::default();
        ProxyConfigOverride {
            max_read_size: Some(0),
        }
        .apply(&mut config);
        assert_eq!(config.max_read_size, DEFAULT_MAX_READ_SIZE);

        ProxyConfigOverride {
            max_read_size: Some(4096),
        }
        .apply(&mut config);
        assert_eq!(config.max_read_size, 4096);
    }

    #[test]
    fn yaml_override_file_is_parsed() {
        let path = std::env::temp_dir().join("culvert-proxy-config-test.yml");
        fs::write(&path, "max_read_size: 2048\n").expect("write config");
        let config =
            ProxyConfig::from_env_or_yaml(Some(path.to_str().expect("path"))).expect("config");
        assert_eq!(config.max_read_size, 2048);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_override_file_is_an_error() {
        assert!(ProxyConfig::from_env_or_yaml(Some("/nonexistent/culvert.yml")).is_err());
    }
}
