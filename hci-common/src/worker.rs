//! Scripted worker decisions.
//!
//! The CI daemon runs the worker once per `(branch, commit)`. The worker
//! decides from the commit message and branch what to do: pass quickly,
//! fail, hold a slot for a while, or outlive the daemon's timeout. The
//! decision reuses the scenario table so the worker and the analyser agree.

use crate::git::{GitError, GitRepo, GitResult};
use crate::scenario::{MatchedRule, Outcome, ScenarioTable};
use crate::types::{WorkerProduct, short_commit};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the worker data directory.
pub const DATA_DIR_ENV: &str = "HOME_CI_DATA_DIR";

/// Data directory used when [`DATA_DIR_ENV`] is unset or empty.
pub const DEFAULT_DATA_DIR: &str = "/tmp/home-ci/data";

/// Sentinel file in the data directory that ends long sleeps early.
pub const STOP_SENTINEL: &str = ".stop-long-runs";

/// Environment override for the branch of a detached checkout.
pub const BRANCH_ENV: &str = "HOME_CI_BRANCH";

/// Environment variable naming an expectations file for the worker.
pub const EXPECTATIONS_ENV: &str = "HCI_EXPECTATIONS";

/// Hold duration for `CONCURRENT_TEST` commits.
pub const LONG_SUCCESS_HOLD: Duration = Duration::from_secs(15);

/// How long a timeout run sleeps. Well beyond any sane daemon timeout.
pub const TIMEOUT_HOLD: Duration = Duration::from_secs(120);

const CONCURRENT_MARKER: &str = "CONCURRENT_TEST";

/// What the worker does for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum WorkerBehavior {
    /// Pass after a few short steps.
    Pass,
    /// Pass after holding for the given duration.
    LongPass {
        #[serde(with = "duration_as_humantime")]
        hold: Duration,
    },
    /// Exit non-zero after a few short steps.
    Fail,
    /// Sleep past the daemon timeout.
    Hang,
}

impl WorkerBehavior {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Pass | Self::LongPass { .. } => Outcome::Success,
            Self::Fail => Outcome::Failure,
            Self::Hang => Outcome::Timeout,
        }
    }

    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Pass,
            Outcome::Failure => Self::Fail,
            Outcome::Timeout => Self::Hang,
        }
    }
}

mod duration_as_humantime {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

/// Pick the behavior for a run.
///
/// In timeout mode everything hangs except commits explicitly marked
/// `SUCCESS` or `FAIL`. Otherwise the table's global patterns and branch
/// rules decide, and a `CONCURRENT_TEST` pattern hit becomes a long pass.
/// `commit` is the full hash: special-case prefixes may be longer than eight.
pub fn decide_behavior(
    table: &ScenarioTable,
    branch: &str,
    commit: &str,
    message: &str,
    timeout_mode: bool,
) -> WorkerBehavior {
    let verdict = table.explain_in_mode(branch, commit, message, timeout_mode);
    match verdict.rule {
        MatchedRule::GlobalPattern { ref pattern, .. }
            if verdict.outcome == Outcome::Success && pattern.contains(CONCURRENT_MARKER) =>
        {
            WorkerBehavior::LongPass {
                hold: LONG_SUCCESS_HOLD,
            }
        }
        _ => WorkerBehavior::from_outcome(verdict.outcome),
    }
}

/// Branch name usable in file names: every `/` becomes `-`.
pub fn sanitize_branch(branch: &str) -> String {
    branch.replace('/', "-")
}

pub fn product_file_name(branch: &str, commit8: &str) -> String {
    format!("{}-{}_run-product.json", sanitize_branch(branch), commit8)
}

pub fn marker_file_name(branch: &str, commit8: &str, outcome: Outcome) -> String {
    let tag = match outcome {
        Outcome::Success => "SUCCESS",
        Outcome::Failure => "FAILURE",
        Outcome::Timeout => "TIMEOUT",
    };
    format!("{}-{}_{}.txt", sanitize_branch(branch), commit8, tag)
}

/// Data directory from [`DATA_DIR_ENV`], falling back to [`DEFAULT_DATA_DIR`].
pub fn data_dir_from_env() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Identity of the commit the worker was started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub working_dir: PathBuf,
    pub branch: String,
    /// Full hash of HEAD.
    pub commit: String,
    pub commit_message: String,
}

impl WorkerContext {
    /// Resolve branch, commit and message from the working copy.
    ///
    /// Daemons often check out a detached HEAD; in that case the branch comes
    /// from [`BRANCH_ENV`] or `git name-rev`.
    pub fn resolve(workdir: &Path) -> GitResult<Self> {
        let repo = GitRepo::open(workdir);
        let commit = repo.head_commit()?;
        let commit_message = repo.message_of("HEAD")?;

        let branch = match repo.current_branch()? {
            Some(branch) => branch,
            None => match std::env::var(BRANCH_ENV).ok().filter(|b| !b.trim().is_empty()) {
                Some(branch) => branch,
                None => repo
                    .name_rev_branch()?
                    .ok_or(GitError::Unresolved("branch"))?,
            },
        };

        Ok(Self {
            working_dir: workdir.to_path_buf(),
            branch,
            commit,
            commit_message,
        })
    }

    /// Eight-character hash used in file names.
    pub fn commit8(&self) -> &str {
        short_commit(&self.commit)
    }

    pub fn product(&self, behavior: WorkerBehavior) -> WorkerProduct {
        WorkerProduct::new(
            self.working_dir.display().to_string(),
            self.branch.clone(),
            self.commit8(),
            self.commit_message.clone(),
            behavior.outcome(),
        )
    }
}

/// Write the product JSON into `data_dir`, creating the directory if needed.
pub fn write_product(data_dir: &Path, product: &WorkerProduct) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(product_file_name(&product.branch, &product.commit));
    let json = serde_json::to_string_pretty(product).map_err(std::io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Drop the `_SUCCESS.txt` / `_FAILURE.txt` / `_TIMEOUT.txt` marker.
pub fn write_marker(
    data_dir: &Path,
    branch: &str,
    commit8: &str,
    outcome: Outcome,
    detail: &str,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(marker_file_name(branch, commit8, outcome));
    std::fs::write(
        &path,
        format!(
            "branch={branch}\ncommit={commit8}\noutcome={outcome}\nat={}\n{detail}\n",
            Utc::now().to_rfc3339()
        ),
    )?;
    Ok(path)
}
