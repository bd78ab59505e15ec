//! Thin wrapper around the `git` binary.
//!
//! Git is treated as an opaque subprocess. Every call runs synchronously;
//! async callers should go through `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` failed (exit code {exit_code:?}): {stderr}")]
    Command {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve {0} from the working copy")]
    Unresolved(&'static str),
}

pub type GitResult<T> = Result<T, GitError>;

/// A working copy driven through the git CLI.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `git <args>` in the working copy and return trimmed stdout.
    pub fn run<I, S>(&self, args: I) -> GitResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let command = args.join(" ");
        debug!("git {} (in {})", command, self.path.display());

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create an empty repository with `main` as the initial branch and a
    /// local identity so commits never depend on global git config.
    pub fn init(path: impl Into<PathBuf>) -> GitResult<Self> {
        let repo = Self::open(path);
        std::fs::create_dir_all(&repo.path)?;
        repo.run(["init", "--initial-branch=main"])?;
        repo.run(["config", "user.name", "home-ci e2e"])?;
        repo.run(["config", "user.email", "e2e@home-ci.invalid"])?;
        repo.run(["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn head_commit(&self) -> GitResult<String> {
        self.run(["rev-parse", "HEAD"])
    }

    /// Current branch name; `None` on a detached HEAD.
    pub fn current_branch(&self) -> GitResult<Option<String>> {
        let name = self.run(["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok((name != "HEAD" && !name.is_empty()).then_some(name))
    }

    /// Best-effort branch name for a detached HEAD, via `git name-rev`.
    pub fn name_rev_branch(&self) -> GitResult<Option<String>> {
        let raw = self.run(["name-rev", "--name-only", "--exclude=tags/*", "HEAD"])?;
        Ok(normalize_name_rev(&raw))
    }

    /// Full message of `rev`, trimmed.
    pub fn message_of(&self, rev: &str) -> GitResult<String> {
        self.run(["log", "-1", "--pretty=%B", rev])
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .is_ok()
    }

    pub fn checkout(&self, branch: &str) -> GitResult<()> {
        self.run(["checkout", "--quiet", branch]).map(|_| ())
    }

    /// Create `branch` from `from` and switch to it.
    pub fn checkout_new_branch(&self, branch: &str, from: &str) -> GitResult<()> {
        self.run(["checkout", "--quiet", "-b", branch, from]).map(|_| ())
    }

    /// Stage everything and commit; returns the new full hash.
    pub fn commit_all(&self, message: &str) -> GitResult<String> {
        self.run(["add", "--all"])?;
        self.run(["commit", "--quiet", "--no-verify", "-m", message])?;
        self.head_commit()
    }
}

/// Turn `git name-rev` output (`remotes/origin/feature/x~2`) into a branch name.
fn normalize_name_rev(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "undefined" {
        return None;
    }
    let without_suffix = trimmed
        .split(['~', '^'])
        .next()
        .unwrap_or(trimmed);
    let name = without_suffix
        .strip_prefix("remotes/origin/")
        .or_else(|| without_suffix.strip_prefix("origin/"))
        .unwrap_or(without_suffix);
    (!name.is_empty() && name != "HEAD").then(|| name.to_string())
}
