//! Control plane configuration
//!
//! Loaded from a JSON file, then overridden from `RELAY_*` environment
//! variables. Every section has defaults, so a partial file is fine.

use relay_accounting::BatchConfig;
use relay_lifecycle::SweepConfig;
use relay_store::PartitionResolver;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Config file used when `RELAY_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relay/relayd.json";

/// Longest accepted grace period, 100 years
pub const MAX_GRACE_SECS: u64 = 100 * 365 * 24 * 3600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for the schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Environment override has the wrong type
    #[error("invalid value {value:?} for {var}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// Value out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Storage
    pub database: DatabaseConfig,
    /// Traffic log batching
    pub traffic: BatchSettings,
    /// Usage counter batching
    pub usage: BatchSettings,
    /// Lifecycle sweep
    pub sweep: SweepSettings,
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,
    /// Pool size
    pub max_connections: u32,
    /// Prefix for daily traffic tables
    pub partition_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/relay/relay.db".into(),
            max_connections: 8,
            partition_prefix: PartitionResolver::DEFAULT_PREFIX.into(),
        }
    }
}

/// Aggregator thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Items per flush
    pub max_batch: usize,
    /// Milliseconds between timed flushes
    pub flush_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_batch: 1000, flush_interval_ms: 1000 }
    }
}

impl BatchSettings {
    /// Aggregator config
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch: self.max_batch,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

/// Sweep settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Seconds an expired subscription waits before it is disabled
    pub grace_secs: u64,
    /// Rows per page
    pub page_size: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self { interval_secs: 60, grace_secs: 3 * 24 * 3600, page_size: 500 }
    }
}

impl SweepSettings {
    /// Sweep config
    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_secs(self.interval_secs),
            grace: chrono::Duration::seconds(self.grace_secs.min(MAX_GRACE_SECS) as i64),
            page_size: self.page_size,
        }
    }
}

impl ControlConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load `path` (defaults when missing), apply process environment
    /// overrides, then validate
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELAY_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RELAY_DB_URL") {
            self.database.url = url;
        }
        override_num(&lookup, "RELAY_TRAFFIC_BATCH", &mut self.traffic.max_batch)?;
        override_num(&lookup, "RELAY_TRAFFIC_FLUSH_MS", &mut self.traffic.flush_interval_ms)?;
        override_num(&lookup, "RELAY_USAGE_BATCH", &mut self.usage.max_batch)?;
        override_num(&lookup, "RELAY_USAGE_FLUSH_MS", &mut self.usage.flush_interval_ms)?;
        override_num(&lookup, "RELAY_SWEEP_INTERVAL_SECS", &mut self.sweep.interval_secs)?;
        override_num(&lookup, "RELAY_SWEEP_GRACE_SECS", &mut self.sweep.grace_secs)?;
        override_num(&lookup, "RELAY_SWEEP_PAGE_SIZE", &mut self.sweep.page_size)?;
        Ok(())
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid("database.url is empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be positive".into()));
        }
        if PartitionResolver::new(&self.database.partition_prefix).is_none() {
            return Err(ConfigError::Invalid(format!(
                "database.partition_prefix {:?} must be lowercase alphanumeric or '_'",
                self.database.partition_prefix
            )));
        }
        for (name, batch) in [("traffic", &self.traffic), ("usage", &self.usage)] {
            if batch.max_batch == 0 {
                return Err(ConfigError::Invalid(format!("{name}.max_batch must be positive")));
            }
            if batch.flush_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!("{name}.flush_interval_ms must be positive")));
            }
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep.interval_secs must be positive".into()));
        }
        if self.sweep.page_size == 0 {
            return Err(ConfigError::Invalid("sweep.page_size must be positive".into()));
        }
        if self.sweep.grace_secs > MAX_GRACE_SECS {
            return Err(ConfigError::Invalid(format!(
                "sweep.grace_secs must be at most {MAX_GRACE_SECS}"
            )));
        }
        Ok(())
    }

    /// Resolver for the configured partition prefix
    pub fn partition_resolver(&self) -> Result<PartitionResolver, ConfigError> {
        PartitionResolver::new(&self.database.partition_prefix).ok_or_else(|| {
            ConfigError::Invalid(format!("bad partition prefix {:?}", self.database.partition_prefix))
        })
    }
}

fn override_num<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(var) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Env { var, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlConfig::default();
        config.validate().unwrap();
        assert_eq!(config.traffic.batch_config(), BatchConfig::default());
        assert_eq!(config.sweep.sweep_config(), SweepConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ControlConfig =
            serde_json::from_str(r#"{"usage": {"max_batch": 50}, "sweep": {"grace_secs": 60}}"#).unwrap();
        assert_eq!(config.usage.max_batch, 50);
        assert_eq!(config.usage.flush_interval_ms, 1000);
        assert_eq!(config.sweep.grace_secs, 60);
        assert_eq!(config.sweep.interval_secs, 60);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ControlConfig::default();
        config
            .apply_overrides(env(&[
                ("RELAY_DB_URL", "sqlite::memory:"),
                ("RELAY_TRAFFIC_BATCH", "10"),
                ("RELAY_USAGE_FLUSH_MS", " 250 "),
                ("RELAY_SWEEP_PAGE_SIZE", "20"),
            ]))
            .unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.traffic.max_batch, 10);
        assert_eq!(config.usage.flush_interval_ms, 250);
        assert_eq!(config.sweep.page_size, 20);
        assert_eq!(config.usage.max_batch, 1000);
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut config = ControlConfig::default();
        let err = config.apply_overrides(env(&[("RELAY_SWEEP_GRACE_SECS", "three days")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "RELAY_SWEEP_GRACE_SECS", .. }));
    }

    #[test]
    fn test_validation_rejects_zeros() {
        let mut config = ControlConfig::default();
        config.traffic.max_batch = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ControlConfig::default();
        config.usage.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.sweep.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.database.partition_prefix = "traffic; DROP".into();
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.sweep.grace_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.sweep.grace_secs = MAX_GRACE_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = ControlConfig::resolve("/nonexistent/relayd.json").unwrap();
        assert_eq!(config.sweep, SweepSettings::default());
    }
}
