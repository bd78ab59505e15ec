//! Harness defaults assembled from `HCI_*` environment variables.

use super::EnvParser;
use crate::observer::DEFAULT_POLL_INTERVAL;
use super::daemon::{ConfigError, ConfigResult};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one harness run. CLI flags override these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessSettings {
    /// Parent of per-run work directories.
    pub work_dir: PathBuf,
    /// CI daemon executable.
    pub daemon_bin: PathBuf,
    /// Worker executable the `test.sh` shim execs.
    pub worker_bin: Option<PathBuf>,
    pub max_concurrent_runs: u32,
    pub run_duration: Duration,
    pub commit_interval: Duration,
    pub poll_interval: Duration,
    /// Per-run timeout the daemon enforces.
    pub test_timeout: Duration,
    /// Grace between SIGTERM and SIGKILL for the daemon.
    pub shutdown_grace: Duration,
    pub keep_work_dir: bool,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("hci-e2e"),
            daemon_bin: PathBuf::from("home-ci"),
            worker_bin: None,
            max_concurrent_runs: 2,
            run_duration: Duration::from_secs(120),
            commit_interval: Duration::from_secs(10),
            poll_interval: DEFAULT_POLL_INTERVAL,
            test_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            keep_work_dir: false,
        }
    }
}

impl HarnessSettings {
    /// Read settings from the environment.
    ///
    /// Every invalid variable is reported in one [`ConfigError::Env`].
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        let mut parser = EnvParser::new();

        let default_work = defaults.work_dir.display().to_string();
        let default_daemon = defaults.daemon_bin.display().to_string();
        let settings = Self {
            work_dir: parser.get_path("WORK_DIR", &default_work, false).value,
            daemon_bin: parser.get_path("DAEMON_BIN", &default_daemon, false).value,
            worker_bin: parser
                .get_optional_string("WORKER_BIN")
                .value
                .map(|p| super::env::expand_home(&p)),
            max_concurrent_runs: parser
                .get_u32_range("MAX_CONCURRENT_RUNS", defaults.max_concurrent_runs, 1, 64)
                .value,
            run_duration: parser.get_duration("RUN_DURATION", defaults.run_duration).value,
            commit_interval: parser
                .get_duration("COMMIT_INTERVAL", defaults.commit_interval)
                .value,
            poll_interval: parser.get_duration("POLL_INTERVAL", defaults.poll_interval).value,
            test_timeout: parser.get_duration("TEST_TIMEOUT", defaults.test_timeout).value,
            shutdown_grace: parser
                .get_duration("SHUTDOWN_GRACE", defaults.shutdown_grace)
                .value,
            keep_work_dir: parser.get_bool("KEEP_WORK_DIR", defaults.keep_work_dir).value,
        };

        parser.finish()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("commit_interval", self.commit_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
