use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::Result;

/// How declared inputs are materialized inside a sandbox directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StagingStrategy {
    /// Copy file contents (default, works across filesystems).
    #[default]
    Copy,
    /// Symlink back to the source file.
    Symlink,
    /// Hardlink to the source file; requires the same filesystem.
    Hardlink,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Root directory for worker log files and sandbox directories.
    pub base_dir: PathBuf,
    pub staging: StagingStrategy,
    /// Largest frame the codec accepts before declaring the stream garbage.
    pub max_message_bytes: usize,
    /// Hand out multiplexed proxies for proxied keys.
    pub multiplex: bool,
    pub shutdown_timeout_ms: u64,
    pub json_logs: bool,
}

impl WorkerConfig {
    /// Load configuration from `config/worker`, `config/worker.local` and
    /// `PW__*` environment variables, in increasing priority.
    pub fn load() -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name("config/worker").required(false))
            .add_source(File::with_name("config/worker.local").required(false))
            // Map PW__BASE_DIR=/tmp/w to base_dir
            .add_source(
                Environment::with_prefix("PW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Load configuration from a single file, falling back to defaults for
    /// anything it does not set.
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::from(path).required(true))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/persistent-workers"),
            staging: StagingStrategy::Copy,
            max_message_bytes: 64 * 1024 * 1024, // 64MB
            multiplex: false,
            shutdown_timeout_ms: 5000,
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.base_dir, PathBuf::from("/tmp/persistent-workers"));
        assert_eq!(config.staging, StagingStrategy::Copy);
        assert_eq!(config.max_message_bytes, 64 * 1024 * 1024);
        assert!(!config.multiplex);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "base_dir = \"/var/tmp/workers\"\nstaging = \"symlink\"\nmultiplex = true\n",
        )
        .unwrap();

        let config = WorkerConfig::load_from(&path).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/tmp/workers"));
        assert_eq!(config.staging, StagingStrategy::Symlink);
        assert!(config.multiplex);
        // Untouched fields keep their defaults
        assert_eq!(config.shutdown_timeout_ms, 5000);
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = WorkerConfig::load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
