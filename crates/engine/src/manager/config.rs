//! Object manager configuration via `objmgr.toml`
//!
//! On first open a commented default `objmgr.toml` is written to the
//! object manager directory. To change settings, edit the file and
//! restart. A configuration passed to the builder takes precedence and
//! leaves the file alone.

use objmgr_core::{Error, Result};
use objmgr_durability::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the object manager directory.
pub const CONFIG_FILE_NAME: &str = "objmgr.toml";

/// Object manager configuration loaded from `objmgr.toml`.
///
/// # Example
///
/// ```toml
/// log_pages = 2048
/// sync_on_force = true
/// max_active_transactions = 1000
/// checkpoint_threshold = 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectManagerConfig {
    /// Size of the circular log in pages, header pages included.
    #[serde(default = "default_log_pages")]
    pub log_pages: u64,
    /// Log file name inside the object manager directory.
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
    /// Whether forced log writes call `sync_data`.
    #[serde(default = "default_sync_on_force")]
    pub sync_on_force: bool,
    /// Most transactions that may exist at once.
    #[serde(default = "default_max_active_transactions")]
    pub max_active_transactions: usize,
    /// Log occupancy (0.0-1.0) above which a checkpoint backs out the
    /// largest persistent transaction.
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: f64,
}

fn default_log_pages() -> u64 {
    2048
}

fn default_log_file_name() -> String {
    "objmgr.log".to_string()
}

fn default_sync_on_force() -> bool {
    true
}

fn default_max_active_transactions() -> usize {
    1000
}

fn default_checkpoint_threshold() -> f64 {
    0.5
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            log_pages: default_log_pages(),
            log_file_name: default_log_file_name(),
            sync_on_force: default_sync_on_force(),
            max_active_transactions: default_max_active_transactions(),
            checkpoint_threshold: default_checkpoint_threshold(),
        }
    }
}

impl ObjectManagerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log size in pages (builder pattern).
    pub fn with_log_pages(mut self, pages: u64) -> Self {
        self.log_pages = pages;
        self
    }

    /// Set the log file name (builder pattern).
    pub fn with_log_file_name(mut self, name: impl Into<String>) -> Self {
        self.log_file_name = name.into();
        self
    }

    /// Set whether forced writes sync (builder pattern).
    pub fn with_sync_on_force(mut self, sync: bool) -> Self {
        self.sync_on_force = sync;
        self
    }

    /// Set the transaction limit (builder pattern).
    pub fn with_max_active_transactions(mut self, limit: usize) -> Self {
        self.max_active_transactions = limit;
        self
    }

    /// Set the occupancy threshold (builder pattern).
    pub fn with_checkpoint_threshold(mut self, threshold: f64) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    /// Small log, no syncing.
    pub fn for_testing() -> Self {
        Self {
            log_pages: 64,
            sync_on_force: false,
            max_active_transactions: 64,
            ..Self::default()
        }
    }

    /// The log part of this configuration.
    pub fn log_config(&self) -> LogConfig {
        LogConfig::new()
            .with_log_pages(self.log_pages)
            .with_file_name(self.log_file_name.clone())
            .with_sync_on_force(self.sync_on_force)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero transaction limit or a threshold
    /// outside `(0.0, 1.0]`, and the log configuration error otherwise.
    pub fn validate(&self) -> Result<()> {
        self.log_config().validate()?;
        if self.max_active_transactions == 0 {
            return Err(Error::Config(
                "max_active_transactions must be at least 1".to_string(),
            ));
        }
        if !(self.checkpoint_threshold > 0.0 && self.checkpoint_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "checkpoint_threshold must be in (0.0, 1.0], got {}",
                self.checkpoint_threshold
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Object manager configuration
#
# Size of the circular log file in 4KB pages, the two header pages included.
# The file is preallocated when the object manager is first created.
log_pages = 2048

# Log file name inside this directory.
log_file_name = "objmgr.log"

# Sync forced log writes (prepare, commit, backout, checkpoints) to disk.
# Turning this off gives up durability across power loss.
sync_on_force = true

# Most transactions that may exist at once.
max_active_transactions = 1000

# When a checkpoint leaves the log fuller than this (0.0-1.0), the largest
# persistent transaction is backed out to free space.
checkpoint_threshold = 0.5
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ObjectManagerConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_default() {
        let config: ObjectManagerConfig =
            toml::from_str(ObjectManagerConfig::default_toml()).unwrap();
        assert_eq!(config, ObjectManagerConfig::default());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ObjectManagerConfig = toml::from_str("log_pages = 128").unwrap();
        assert_eq!(config.log_pages, 128);
        assert_eq!(config.max_active_transactions, 1000);
        assert!(config.sync_on_force);
    }

    #[test]
    fn test_write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(!path.exists());

        ObjectManagerConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            ObjectManagerConfig::from_file(&path).unwrap(),
            ObjectManagerConfig::default()
        );
    }

    #[test]
    fn test_write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "log_pages = 256\n").unwrap();

        ObjectManagerConfig::write_default_if_missing(&path).unwrap();

        assert_eq!(ObjectManagerConfig::from_file(&path).unwrap().log_pages, 256);
    }

    #[test]
    fn test_write_to_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = ObjectManagerConfig::for_testing().with_checkpoint_threshold(0.75);

        config.write_to_file(&path).unwrap();

        assert_eq!(ObjectManagerConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ObjectManagerConfig::new().with_log_pages(4).validate().is_err());
        assert!(ObjectManagerConfig::new()
            .with_max_active_transactions(0)
            .validate()
            .is_err());
        assert!(ObjectManagerConfig::new()
            .with_checkpoint_threshold(0.0)
            .validate()
            .is_err());
        assert!(ObjectManagerConfig::new()
            .with_checkpoint_threshold(1.5)
            .validate()
            .is_err());
        assert!(ObjectManagerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "log_pages = \"many\"\n").unwrap();

        let err = ObjectManagerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
