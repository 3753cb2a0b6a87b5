//! Configuration module for policy watches
//!
//! Loads a [`WatchConfig`] from YAML: which policies to enable, which
//! devices to watch, and pipeline tuning.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::{PolicyParams, ThresholdConfig};

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long to wait for teardown confirmation before destroying an
    /// ephemeral group anyway
    #[serde(with = "humantime_serde", default = "default_teardown_timeout")]
    pub teardown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            teardown_timeout: default_teardown_timeout(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Policies to enable and their thresholds
    #[serde(default)]
    pub policy: PolicyParams,

    /// Device ids to watch; empty watches every device
    #[serde(default)]
    pub devices: Vec<u32>,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl WatchConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration and return the normalized thresholds
    pub fn validate(&self) -> Result<ThresholdConfig> {
        if self.pipeline.teardown_timeout.is_zero() {
            anyhow::bail!("pipeline.teardown_timeout must be > 0");
        }
        let thresholds =
            ThresholdConfig::normalize(&self.policy).context("Invalid policy section")?;
        Ok(thresholds)
    }
}

fn default_teardown_timeout() -> Duration {
    Duration::from_millis(500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyCondition;

    #[test]
    fn test_default_config_needs_a_policy() {
        let config = WatchConfig::default();
        assert_eq!(config.pipeline.teardown_timeout, Duration::from_millis(500));
        assert!(config.devices.is_empty());

        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("at least one policy must be enabled"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
policy:
  thermal_enabled: true
  power_enabled: true
  power_threshold: 300
  xid_enabled: true

devices: [0, 2, 3]

pipeline:
  teardown_timeout: 1s
"#;
        let config = WatchConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.devices, vec![0, 2, 3]);
        assert_eq!(config.pipeline.teardown_timeout, Duration::from_secs(1));

        let thresholds = config.validate().unwrap();
        assert_eq!(thresholds.enabled_count(), 3);
        assert_eq!(thresholds.thermal_celsius(), 100);
        assert_eq!(thresholds.power_watts(), 300);
        assert!(thresholds.enabled().contains(PolicyCondition::Xid));
    }

    #[test]
    fn test_zero_teardown_timeout_rejected() {
        let yaml = r#"
policy:
  dbe_enabled: true
pipeline:
  teardown_timeout: 0s
"#;
        let config = WatchConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_yaml() {
        assert!(WatchConfig::from_yaml("policy: [not, a, map]").is_err());
        assert!(WatchConfig::from_file("/nonexistent/gpolicy.yaml").is_err());
    }
}
