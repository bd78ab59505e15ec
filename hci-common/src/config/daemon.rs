//! YAML configuration handed to the CI daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the generated config inside the harness work directory.
pub const DAEMON_CONFIG_FILE: &str = "home-ci.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed daemon config: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("Invalid daemon config: {0}")]
    Invalid(String),

    #[error("Invalid environment configuration: {0}")]
    Env(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Daemon configuration document.
///
/// `repo_path` and `max_concurrent_runs` are required; the rest is what the
/// harness emits and may be absent in hand-written files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub repo_path: String,
    pub max_concurrent_runs: u32,
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    #[serde(default = "default_test_script")]
    pub test_script: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_timeout: Option<String>,
    #[serde(default)]
    pub fetch_remote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_check_interval() -> String {
    "2s".to_string()
}

fn default_test_script() -> String {
    "test.sh".to_string()
}

impl DaemonConfig {
    /// Config for a harness run against the synthesised repository.
    pub fn for_harness(
        repo: &Path,
        state_dir: &Path,
        log_dir: &Path,
        data_dir: &Path,
        max_concurrent_runs: u32,
        test_timeout: Duration,
    ) -> Self {
        Self {
            repo_path: repo.display().to_string(),
            max_concurrent_runs,
            check_interval: default_check_interval(),
            test_script: default_test_script(),
            options: BTreeMap::new(),
            test_timeout: Some(humantime::format_duration(test_timeout).to_string()),
            fetch_remote: false,
            state_dir: Some(state_dir.to_path_buf()),
            log_dir: Some(log_dir.to_path_buf()),
            data_dir: Some(data_dir.to_path_buf()),
        }
    }

    /// Add a worker option (passed through to the daemon untouched).
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        self.validate()?;
        let yaml = serde_yaml_ng::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.repo_path.trim().is_empty() {
            return Err(ConfigError::Invalid("repo_path must not be empty".to_string()));
        }
        if self.max_concurrent_runs < 1 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = &self.test_timeout {
            humantime::parse_duration(timeout).map_err(|e| {
                ConfigError::Invalid(format!("test_timeout '{timeout}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Parsed `test_timeout`, if set and valid.
    pub fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout
            .as_deref()
            .and_then(|t| humantime::parse_duration(t).ok())
    }
}
