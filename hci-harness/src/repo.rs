//! The synthetic repository the CI daemon watches.

use crate::error::HarnessResult;
use hci_common::GitRepo;
use hci_common::analysis::CommitMessages;
use hci_common::fixtures::{
    GITIGNORE, README, RepoTopology, TEST_SCRIPT_NAME, change_file_name, worker_shim,
};
use hci_common::observer::HarnessStats;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TestRepo {
    git: GitRepo,
    topology: RepoTopology,
    stats: Arc<HarnessStats>,
}

impl TestRepo {
    /// Create the repository at `path`: scaffold on `main`, then one commit
    /// per topology branch.
    pub fn init(
        path: impl Into<PathBuf>,
        worker_bin: &Path,
        timeout_mode: bool,
        topology: RepoTopology,
        stats: Arc<HarnessStats>,
    ) -> HarnessResult<Self> {
        let git = GitRepo::init(path)?;
        let root = git.path().to_path_buf();

        let script = root.join(TEST_SCRIPT_NAME);
        std::fs::write(&script, worker_shim(worker_bin, timeout_mode))?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        std::fs::write(root.join(".gitignore"), GITIGNORE)?;
        std::fs::write(root.join("README.md"), README)?;

        let repo = Self {
            git,
            topology,
            stats,
        };

        for planned in repo.topology.to_commit_plan() {
            if let Some(base) = &planned.base {
                repo.git.checkout_new_branch(&planned.branch, base)?;
                repo.stats.record_branch();
            }
            repo.append_change(&planned.file, &planned.message)?;
            let hash = repo.git.commit_all(&planned.message)?;
            repo.stats.record_commit();
            debug!("Seeded {} at {}", planned.branch, hash);
        }
        // The root branch counts too.
        repo.stats.record_branch();
        repo.git.checkout("main")?;

        info!(
            "Test repository ready at {} ({} branches)",
            root.display(),
            repo.topology.branches.len()
        );
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.git.path()
    }

    pub fn topology(&self) -> &RepoTopology {
        &self.topology
    }

    /// Append a line to the branch's change file and commit it.
    /// Returns the full commit hash.
    pub fn commit(&self, branch: &str, message: &str) -> HarnessResult<String> {
        self.git.checkout(branch)?;
        self.append_change(&change_file_name(branch), message)?;
        let hash = self.git.commit_all(message)?;
        self.stats.record_commit();
        Ok(hash)
    }

    fn append_change(&self, relative: &str, message: &str) -> HarnessResult<()> {
        let path = self.git.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "{} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        )?;
        Ok(())
    }
}

/// Commit messages looked up in a repository with `git log`.
pub struct GitCommitMessages {
    git: GitRepo,
}

impl GitCommitMessages {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            git: GitRepo::open(path),
        }
    }
}

impl CommitMessages for GitCommitMessages {
    fn message_for(&self, _branch: &str, commit: &str) -> Option<String> {
        self.git.message_of(commit).ok()
    }
}
