//! Configuration management for ratewarden.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::metrics::DEFAULT_HISTORY_SIZE;
use crate::ratelimit::{LimitSpec, LimiterConfig, RegistryOptions};

/// Prefix for environment variable overrides, e.g. `RATEWARDEN__REGISTRY__MAX_KEYS`.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Registry configuration
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Limits by key class. Class names are case-insensitive: the file
    /// loader lowercases them, and [`EngineConfig::limiter_configs`] does the
    /// same for every other source.
    #[serde(default)]
    pub limits: HashMap<String, LimitSpec>,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Idle timeout in seconds for every key (defaults to ten windows per key)
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// How often the maintenance task sweeps idle keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Soft bound on live keys
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            max_keys: None,
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

impl RegistrySettings {
    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_keys: self.max_keys,
        }
    }

    /// Sweep interval, never shorter than one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Number of recent decisions kept in snapshots
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
        }
    }
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

impl EngineConfig {
    /// Load configuration from a YAML file, overlaid with `RATEWARDEN__*`
    /// environment variables. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading engine configuration");

        let path_str = path
            .to_str()
            .ok_or_else(|| RateLimitError::Config(format!("non UTF-8 path: {}", path.display())))?;

        let config = Config::builder()
            .add_source(File::new(path_str, FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a file path without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse engine config: {}", e)))
    }

    /// Validate every configured limit, keyed by lowercased class name.
    ///
    /// Fails on the first invalid class so a malformed limit never serves traffic.
    pub fn limiter_configs(&self) -> Result<HashMap<String, LimiterConfig>> {
        self.limits
            .iter()
            .map(|(class, spec)| -> Result<(String, LimiterConfig)> {
                let config = spec.to_config().map_err(|e| match e {
                    RateLimitError::InvalidConfig(msg) => {
                        RateLimitError::InvalidConfig(format!("limit '{}': {}", class, msg))
                    }
                    other => other,
                })?;
                Ok((class.to_lowercase(), config))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;

    const SAMPLE: &str = r#"
registry:
  idle_timeout_secs: 600
  max_keys: 1000
metrics:
  history_size: 50
limits:
  api:
    algorithm: token_bucket
    capacity: 10
    refill_rate: 1.0
  login:
    algorithm: fixed_window
    capacity: 5
    window_ms: 1000
"#;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.registry.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.registry.options(), RegistryOptions::default());
        assert_eq!(config.metrics.history_size, 20);
        assert!(config.limits.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let config = EngineConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.registry.sweep_interval_secs, 30);
        assert_eq!(
            config.registry.options().idle_timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.registry.max_keys, Some(1000));
        assert_eq!(config.metrics.history_size, 50);

        let limits = config.limiter_configs().unwrap();
        assert_eq!(limits["api"].algorithm(), Algorithm::TokenBucket);
        assert_eq!(limits["login"].capacity(), 5);
    }

    #[test]
    fn test_invalid_limit_names_class() {
        let yaml = r#"
limits:
  broken:
    algorithm: sliding_counter
    capacity: 0
    window_ms: 1000
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        match config.limiter_configs() {
            Err(RateLimitError::InvalidConfig(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_algorithm_fails_to_parse() {
        let yaml = r#"
limits:
  api:
    algorithm: gcra
    capacity: 1
"#;
        assert!(matches!(
            EngineConfig::from_yaml(yaml),
            Err(RateLimitError::Config(_))
        ));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("ratewarden-test-{}.yaml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        std::env::set_var("RATEWARDEN__REGISTRY__SWEEP_INTERVAL_SECS", "5");
        let loaded = EngineConfig::load(&path);
        std::env::remove_var("RATEWARDEN__REGISTRY__SWEEP_INTERVAL_SECS");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.registry.sweep_interval_secs, 5);
        assert_eq!(config.limits.len(), 2);
        assert_eq!(config.limiter_configs().unwrap()["api"].capacity(), 10);
    }

    #[test]
    fn test_class_names_are_lowercased_by_every_loader() {
        let yaml = SAMPLE.replace("  login:", "  Login:");
        let from_yaml = EngineConfig::from_yaml(&yaml).unwrap();
        assert!(from_yaml.limits.contains_key("Login"));
        assert!(from_yaml.limiter_configs().unwrap().contains_key("login"));

        let path = std::env::temp_dir().join(format!("ratewarden-case-{}.yaml", std::process::id()));
        std::fs::write(&path, &yaml).unwrap();
        let loaded = EngineConfig::load(&path);
        std::fs::remove_file(&path).unwrap();

        let limits = loaded.unwrap().limiter_configs().unwrap();
        assert_eq!(limits["login"].capacity(), 5);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-file-{}.yaml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        let loaded = EngineConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.registry.max_keys, Some(1000));
        assert_eq!(config.limits.len(), 2);

        assert!(matches!(
            EngineConfig::from_file("/nonexistent/ratewarden.yaml"),
            Err(RateLimitError::Io(_))
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = EngineConfig::load("/nonexistent/ratewarden.yaml").unwrap();
        assert!(config.limits.is_empty());
        assert_eq!(config.metrics.history_size, 20);
    }
}
