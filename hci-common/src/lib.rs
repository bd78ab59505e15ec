//! Shared core of the home-ci end-to-end harness.
//!
//! The harness synthesises a git repository, runs a CI daemon against it,
//! watches the daemon's result files and finally checks them: ordering,
//! peak concurrency and per-run expected outcomes. This crate holds
//! everything the harness binary and the scripted worker have in common.

pub mod analysis;
pub mod config;
pub mod fixtures;
pub mod git;
pub mod logging;
pub mod observer;
pub mod scenario;
pub mod testing;
pub mod timeline;
pub mod types;
pub mod worker;

pub use analysis::{
    AnalysisReport, AnalysisVerdict, ChainedMessages, CommitMessages, GradeStatus, LoadedResults,
    NoMessages, ProductIndex, RunGrade, analyze, grade_runs, load_run_results,
};
pub use config::{ConfigError, DaemonConfig, EnvParser, HarnessSettings};
pub use git::{GitError, GitRepo, GitResult};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use observer::{
    DataDirSnapshot, HarnessStats, RunObserver, StatsSnapshot, TickReport, scan_data_dir,
};
pub use scenario::{MatchedRule, Outcome, ScenarioError, ScenarioTable, Verdict};
pub use timeline::{ConcurrencyReport, ConcurrencyVerdict, Violation, analyze_concurrency};
pub use types::{LiveState, RunResult, RunningTest, WorkerProduct};
pub use worker::{WorkerBehavior, WorkerContext, decide_behavior};
