//! Artifacts exchanged between the daemon, the worker and the harness.

use crate::scenario::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the daemon's live-state singleton inside its data directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Value of `test_type` in every worker product.
pub const PRODUCT_TEST_TYPE: &str = "e2e";

/// Returns true for a per-run result file: `*.json` other than `state.json`.
pub fn is_result_file(path: &Path) -> bool {
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let is_state = path
        .file_name()
        .is_some_and(|name| name == STATE_FILE_NAME);
    is_json && !is_state
}

/// One completed worker execution, as written by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub branch: String,
    /// Full hex commit hash.
    pub commit: String,
    #[serde(default)]
    pub log_file: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub cleanup_executed: bool,
    #[serde(default)]
    pub cleanup_success: bool,
    #[serde(default)]
    pub github_actions_notified: bool,
    #[serde(default)]
    pub github_actions_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_actions_error: Option<String>,
}

impl RunResult {
    /// Minimal result with the given identity and timing; all flags false.
    pub fn new(
        branch: impl Into<String>,
        commit: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
            log_file: String::new(),
            start_time,
            end_time,
            success: false,
            timed_out: false,
            cleanup_executed: false,
            cleanup_success: false,
            github_actions_notified: false,
            github_actions_success: false,
            error: None,
            cleanup_error: None,
            github_actions_error: None,
        }
    }

    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    #[must_use]
    pub fn with_timed_out(mut self, timed_out: bool) -> Self {
        self.timed_out = timed_out;
        self
    }

    /// Classification of what actually happened.
    ///
    /// `timed_out` wins over `success`; anything else is a failure.
    pub fn actual_outcome(&self) -> Outcome {
        if self.timed_out {
            Outcome::Timeout
        } else if self.success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub fn is_well_ordered(&self) -> bool {
        self.start_time <= self.end_time
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    /// First eight hex characters of the commit (the worker's naming unit).
    pub fn short_commit(&self) -> &str {
        short_commit(&self.commit)
    }
}

/// Truncate a commit hash to eight characters without splitting a char.
pub fn short_commit(commit: &str) -> &str {
    match commit.char_indices().nth(8) {
        Some((idx, _)) => &commit[..idx],
        None => commit,
    }
}

/// Snapshot of in-flight runs from the daemon's `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    #[serde(default)]
    pub running_tests: Vec<RunningTest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunningTest {
    pub branch: String,
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl RunningTest {
    /// A result belongs to this entry when the branch matches and one commit
    /// hash is a prefix of the other (state files may carry short hashes).
    pub fn matches_result(&self, result: &RunResult) -> bool {
        self.branch == result.branch
            && !self.commit.is_empty()
            && (result.commit.starts_with(&self.commit) || self.commit.starts_with(&result.commit))
    }
}

/// Product JSON the worker drops into the data directory for each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProduct {
    pub working_dir: String,
    pub test_type: String,
    pub branch: String,
    /// Eight-character commit prefix.
    pub commit: String,
    pub commit_message: String,
    pub expected_behavior: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl WorkerProduct {
    /// Product stamped now; `commit` is truncated to eight characters.
    pub fn new(
        working_dir: impl Into<String>,
        branch: impl Into<String>,
        commit: &str,
        commit_message: impl Into<String>,
        expected_behavior: Outcome,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            test_type: PRODUCT_TEST_TYPE.to_string(),
            branch: branch.into(),
            commit: short_commit(commit).to_string(),
            commit_message: commit_message.into(),
            expected_behavior,
            timestamp: Utc::now(),
        }
    }
}
