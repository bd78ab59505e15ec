//! Fixtures for the synthesised test repository.
//!
//! The topology, the commit-message cycle and the worker shim are fixed so a
//! harness run is reproducible: the same tick number always produces the
//! same branch and message.

use std::path::Path;

/// Script name the daemon runs in each checkout.
pub const TEST_SCRIPT_NAME: &str = "test.sh";

pub const GITIGNORE: &str = "*.log\n.home-ci/\n";

pub const README: &str = "# home-ci e2e fixture\n\n\
Synthetic repository generated by the home-ci end-to-end harness.\n\
Every commit runs `test.sh`, which hands off to the scripted worker.\n";

/// Messages the simulator cycles through. Markers drive the worker:
/// `FAIL` fails, `TIMEOUT` hangs, `SUCCESS` passes, `CONCURRENT_TEST` holds
/// a slot for a while. Plain messages fall through to branch rules.
pub const MESSAGE_CYCLE: &[&str] = &[
    "Routine update",
    "CONCURRENT_TEST: hold a slot",
    "SUCCESS: explicit pass",
    "Refactor internals",
    "FAIL: injected failure",
    "CONCURRENT_TEST: overlapping work",
    "Update docs",
    "TIMEOUT: stress the daemon timeout",
];

/// One branch of the fixture repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFixture {
    pub name: String,
    /// Branch this one is cut from; `None` for the root branch.
    pub base: Option<String>,
    pub initial_message: String,
}

/// A commit to create while building the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommit {
    pub branch: String,
    pub base: Option<String>,
    pub file: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTopology {
    pub branches: Vec<BranchFixture>,
}

impl RepoTopology {
    /// `main` plus five topic branches, each with one commit of its own.
    pub fn standard() -> Self {
        let topic = |name: &str, message: &str| BranchFixture {
            name: name.to_string(),
            base: Some("main".to_string()),
            initial_message: message.to_string(),
        };
        Self {
            branches: vec![
                BranchFixture {
                    name: "main".to_string(),
                    base: None,
                    initial_message: "Initial commit".to_string(),
                },
                topic("feature/test1", "Start feature test1"),
                topic("feature/test2", "Start feature test2"),
                topic("bugfix/critical", "Start critical bugfix"),
                topic("feature/ui-refresh", "Start UI refresh"),
                topic("bugfix/xyz", "Start bugfix xyz"),
            ],
        }
    }

    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|b| b.name.as_str())
    }

    pub fn to_commit_plan(&self) -> Vec<PlannedCommit> {
        self.branches
            .iter()
            .map(|b| PlannedCommit {
                branch: b.name.clone(),
                base: b.base.clone(),
                file: change_file_name(&b.name),
                message: b.initial_message.clone(),
            })
            .collect()
    }
}

/// File touched by commits on `branch`, so branches never conflict.
pub fn change_file_name(branch: &str) -> String {
    format!("changes/{}.txt", branch.replace('/', "-"))
}

/// Deterministic `(branch, message)` for simulator tick `n`.
///
/// Branches rotate every tick. The message index also skips one extra slot
/// per full branch round, so every branch eventually sees every message.
pub fn activity_step(topology: &RepoTopology, n: u64) -> Option<(&str, &'static str)> {
    let branches = topology.branches.len() as u64;
    if branches == 0 {
        return None;
    }
    let branch = &topology.branches[(n % branches) as usize].name;
    let round = n / branches;
    let message = MESSAGE_CYCLE[((n + round) % MESSAGE_CYCLE.len() as u64) as usize];
    Some((branch.as_str(), message))
}

/// `test.sh` body that execs the worker binary.
pub fn worker_shim(worker_bin: &Path, timeout_mode: bool) -> String {
    let mode = if timeout_mode { " --timeout-mode" } else { "" };
    format!(
        "#!/bin/sh\n# Generated by hci-e2e.\nexec {} run{mode} \"$@\"\n",
        shell_quote(&worker_bin.display().to_string())
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
