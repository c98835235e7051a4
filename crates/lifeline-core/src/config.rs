use anyhow::{Context, Result};
use lifeline_dedup::DedupConfig;
use lifeline_geo::{GeoRouterConfig, GeoZone};
use lifeline_store::QuotaConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// Relay node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maidenhead locator of this node, if location sharing is enabled
    pub local_zone: Option<String>,
    pub dedup: DedupConfig,
    pub quota: QuotaConfig,
    pub geo: GeoRouterConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Lost on restart
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Holds `messages.db` and `dedup.db` for the sqlite backend
    pub data_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_directory: PathBuf::from("./lifeline-data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `lifeline_store=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            anyhow::bail!("Configuration file not found: {}", config_path.display());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read configuration file")?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.validate().context("Invalid configuration")?;

        Ok(config)
    }

    /// Write configuration as YAML, creating parent directories
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(self).context("Failed to serialize configuration")?;
        fs::write(config_path, yaml).context("Failed to write configuration file")?;

        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.dedup.validate()?;
        self.quota.validate()?;

        if !self.geo.weights.is_valid() {
            return Err(CoreError::InvalidConfig(
                "geo scoring weights must sum to 1.0".to_string(),
            ));
        }
        if self.local_zone.is_some() && self.parsed_local_zone().is_none() {
            return Err(CoreError::InvalidConfig(format!(
                "invalid local zone locator: {:?}",
                self.local_zone
            )));
        }

        Ok(())
    }

    /// The configured local zone, if present and well-formed
    pub fn parsed_local_zone(&self) -> Option<GeoZone> {
        self.local_zone.as_deref().and_then(GeoZone::from_locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.quota.max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.dedup.expected_items, 100_000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("lifeline.yaml");

        let mut config = Config::default();
        config.local_zone = Some("FN31".to_string());
        config.storage.backend = StorageBackend::Sqlite;
        config.quota.max_bytes = 1024 * 1024;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.local_zone.as_deref(), Some("FN31"));
        assert_eq!(loaded.storage.backend, StorageBackend::Sqlite);
        assert_eq!(loaded.quota.max_bytes, 1024 * 1024);
        assert_eq!(loaded.parsed_local_zone().unwrap().zone_id, "FN31");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifeline.yaml");
        fs::write(&path, "quota:\n  max_bytes: 4096\nlogging:\n  json: true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.quota.max_bytes, 4096);
        assert_eq!(config.quota.warning_threshold, 0.8);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let dir = TempDir::new().unwrap();

        let missing = dir.path().join("absent.yaml");
        assert!(Config::load(&missing).is_err());

        let path = dir.path().join("bad.yaml");
        fs::write(&path, "local_zone: \"not a locator\"\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, "quota:\n  warning_threshold: 0.99\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
