//! One end-to-end run: repository, daemon, activity, observation, analysis.

use crate::daemon::DaemonProcess;
use crate::error::{HarnessError, HarnessResult};
use crate::repo::{GitCommitMessages, TestRepo};
use crate::simulator::ActivitySimulator;
use crate::workdir::{STALE_WORK_DIR_AGE, WorkDir, cleanup_stale_work_dirs};
use anyhow::{Context, Result};
use hci_common::analysis::{ANALYSIS_FILE_NAME, EXIT_PASS};
use hci_common::config::daemon::DAEMON_CONFIG_FILE;
use hci_common::fixtures::RepoTopology;
use hci_common::worker::{DATA_DIR_ENV, EXPECTATIONS_ENV, STOP_SENTINEL};
use hci_common::{
    AnalysisReport, ChainedMessages, DaemonConfig, HarnessSettings, HarnessStats, ProductIndex,
    RunObserver, ScenarioTable, analyze, load_run_results,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// File the stats snapshot is written to at the end of a run.
pub const STATS_FILE_NAME: &str = "harness-stats.json";

/// Copy of the daemon config kept with the logs.
const CONFIG_COPY_NAME: &str = "daemon-config.yaml";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub settings: HarnessSettings,
    pub timeout_mode: bool,
    pub expectations: Option<PathBuf>,
    /// Stop committing after this many simulated commits.
    pub max_commits: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Elapsed,
    DaemonExited,
    Signal(&'static str),
}

/// Run the harness end to end and return the process exit code.
pub async fn run(options: RunOptions) -> Result<i32> {
    let RunOptions {
        settings,
        timeout_mode,
        expectations,
        max_commits,
    } = options;

    std::fs::create_dir_all(&settings.work_dir).with_context(|| {
        format!("Failed to create work root {}", settings.work_dir.display())
    })?;
    cleanup_stale_work_dirs(&settings.work_dir, STALE_WORK_DIR_AGE);
    let work = WorkDir::create(&settings.work_dir).context("Failed to create work directory")?;

    // Workers run from daemon checkouts, so relative paths would not resolve.
    let expectations = expectations.map(|p| std::path::absolute(&p).unwrap_or(p));
    let table = ScenarioTable::load_or_builtin(expectations.as_deref())
        .context("Failed to load expectations")?;
    info!(
        "Expectations: {} global patterns, {} branch rules",
        table.pattern_count(),
        table.branch_count()
    );

    let worker_bin = resolve_worker_bin(settings.worker_bin.as_deref())?;
    let stats = HarnessStats::new();

    let repo = {
        let path = work.repo_dir();
        let stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            TestRepo::init(
                path,
                &worker_bin,
                timeout_mode,
                RepoTopology::standard(),
                stats,
            )
        })
        .await
        .map_err(HarnessError::from)??
    };
    let repo = Arc::new(repo);

    let config_path = work.root().join(DAEMON_CONFIG_FILE);
    DaemonConfig::for_harness(
        repo.path(),
        &work.results_dir(),
        &work.log_dir(),
        &work.worker_data_dir(),
        settings.max_concurrent_runs,
        settings.test_timeout,
    )
    .with_option("timeout_mode", timeout_mode.to_string())
    .save(&config_path)
    .context("Failed to write daemon config")?;

    let mut env = BTreeMap::from([(
        DATA_DIR_ENV.to_string(),
        work.worker_data_dir().display().to_string(),
    )]);
    if let Some(path) = &expectations {
        env.insert(EXPECTATIONS_ENV.to_string(), path.display().to_string());
    }
    let mut daemon =
        DaemonProcess::spawn(&settings.daemon_bin, &config_path, &work.daemon_log(), &env)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let observer = RunObserver::new(work.results_dir(), stats.clone());
    let observer_handle =
        tokio::spawn(observer.run(settings.poll_interval, shutdown_rx.clone()));
    let simulator_handle = tokio::spawn(ActivitySimulator::new(repo.clone()).run(
        settings.commit_interval,
        max_commits,
        shutdown_rx,
    ));

    info!(
        "Running for {} (limit {} concurrent runs, commit every {})",
        humantime::format_duration(settings.run_duration),
        settings.max_concurrent_runs,
        humantime::format_duration(settings.commit_interval)
    );
    let reason = tokio::select! {
        _ = tokio::time::sleep(settings.run_duration) => StopReason::Elapsed,
        exited = daemon.wait() => {
            if let Err(e) = exited {
                warn!("Lost track of daemon: {}", e);
            }
            StopReason::DaemonExited
        }
        name = shutdown_signal() => StopReason::Signal(name),
    };
    info!("Stopping run: {:?}", reason);

    if shutdown_tx.send(true).is_err() {
        warn!("All background tasks already gone");
    }
    let commits = simulator_handle.await.unwrap_or_else(|e| {
        warn!("Simulator task failed: {}", e);
        0
    });
    info!("Simulated {} commits", commits);

    match daemon.shutdown(settings.shutdown_grace).await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("Daemon finished with {}", status),
        Err(e) => warn!("Daemon shutdown failed: {}", e),
    }

    let observer = match observer_handle.await {
        Ok(mut observer) => {
            observer.tick_once().await;
            Some(observer)
        }
        Err(e) => {
            warn!("Observer task failed: {}", e);
            None
        }
    };
    preserve_artifacts(&work, &config_path, &stats)?;
    if let Some(observer) = &observer {
        info!(
            "Observed {} distinct results ({} vanished from live state)",
            observer.distinct_completed(),
            observer.vanished().count()
        );
    }

    let report = analyze_dirs(
        &work.results_dir(),
        Some(&work.worker_data_dir()),
        Some(repo.path()),
        settings.max_concurrent_runs as usize,
        &table,
        timeout_mode,
    )?;
    let analysis_path = work.root().join(ANALYSIS_FILE_NAME);
    report
        .write_json(&analysis_path)
        .with_context(|| format!("Failed to write {}", analysis_path.display()))?;
    print!("{}", report.render_text());
    let mismatches = report.mismatches().count();
    if mismatches > 0 {
        warn!("{} runs did not end as expected", mismatches);
    }

    let code = report.exit_code();
    if code == EXIT_PASS && !settings.keep_work_dir {
        work.remove();
    } else {
        info!("Artifacts kept in {}", work.root().display());
    }
    Ok(code)
}

/// Grade the results in `results_dir`. Commit messages come from worker
/// products first, then from the repository.
pub fn analyze_dirs(
    results_dir: &Path,
    products_dir: Option<&Path>,
    repo_dir: Option<&Path>,
    limit: usize,
    table: &ScenarioTable,
    timeout_mode: bool,
) -> Result<AnalysisReport> {
    let loaded = load_run_results(results_dir)
        .with_context(|| format!("Failed to read results from {}", results_dir.display()))?;

    let products = match products_dir {
        Some(dir) => ProductIndex::load(dir)
            .with_context(|| format!("Failed to read products from {}", dir.display()))?,
        None => ProductIndex::default(),
    };
    let git = repo_dir.map(GitCommitMessages::new);
    let mut messages = ChainedMessages::new().with(&products);
    if let Some(git) = &git {
        messages = messages.with(git);
    }

    let report = analyze(&loaded.results, limit, table, &messages, timeout_mode);
    Ok(report.with_skipped_files(loaded.skipped.len()))
}

/// Leave what a post-mortem needs in the work directory.
fn preserve_artifacts(
    work: &WorkDir,
    config_path: &Path,
    stats: &HarnessStats,
) -> HarnessResult<()> {
    std::fs::write(work.worker_data_dir().join(STOP_SENTINEL), "")?;

    let snapshot = serde_json::to_string_pretty(&stats.snapshot())
        .map_err(|e| HarnessError::SetupFailed(format!("Failed to encode stats: {e}")))?;
    std::fs::write(work.root().join(STATS_FILE_NAME), snapshot)?;

    std::fs::copy(config_path, work.log_dir().join(CONFIG_COPY_NAME))?;
    Ok(())
}

/// `--worker-bin`, else `hci-wkr` next to this executable.
fn resolve_worker_bin(configured: Option<&Path>) -> HarnessResult<PathBuf> {
    let candidate = match configured {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe()?
            .parent()
            .map(|dir| dir.join("hci-wkr"))
            .ok_or_else(|| {
                HarnessError::SetupFailed("Cannot locate the harness executable".to_string())
            })?,
    };
    if !candidate.is_file() {
        return Err(HarnessError::SetupFailed(format!(
            "Worker binary not found: {}",
            candidate.display()
        )));
    }
    Ok(std::path::absolute(&candidate)?)
}

/// Resolves on SIGINT or SIGTERM with the signal's name.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            return match tokio::signal::ctrl_c().await {
                Ok(()) => "SIGINT",
                Err(_) => std::future::pending().await,
            };
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => "SIGINT",
            Err(_) => {
                term.recv().await;
                "SIGTERM"
            }
        },
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hci_common::analysis::{EXIT_CONCURRENCY_FAIL, EXIT_NEUTRAL};
    use hci_common::scenario::Outcome;
    use hci_common::types::WorkerProduct;
    use hci_common::worker::write_product;

    fn write_result(dir: &Path, name: &str, branch: &str, commit: &str, start: &str, end: &str) {
        let json = serde_json::json!({
            "branch": branch,
            "commit": commit,
            "success": true,
            "timed_out": false,
            "start_time": start,
            "end_time": end,
        });
        std::fs::write(dir.join(name), json.to_string()).unwrap();
    }

    #[test]
    fn analyze_dirs_flags_overlap_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_result(
            dir.path(),
            "a.json",
            "main",
            "1111111111",
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:00:10Z",
        );
        write_result(
            dir.path(),
            "b.json",
            "feature/test2",
            "2222222222",
            "2024-05-01T10:00:05Z",
            "2024-05-01T10:00:15Z",
        );
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let table = ScenarioTable::builtin().unwrap();

        let report = analyze_dirs(dir.path(), None, None, 1, &table, false).unwrap();
        assert_eq!(report.exit_code(), EXIT_CONCURRENCY_FAIL);
        assert_eq!(report.skipped_files, 1);

        let report = analyze_dirs(dir.path(), None, None, 2, &table, false).unwrap();
        assert_ne!(report.exit_code(), EXIT_CONCURRENCY_FAIL);
    }

    #[test]
    fn timeout_mode_run_with_hung_plain_commit_passes() {
        let results = tempfile::tempdir().unwrap();
        let products = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "branch": "main",
            "commit": "5555555566667777",
            "success": false,
            "timed_out": true,
            "start_time": "2024-05-01T10:00:00Z",
            "end_time": "2024-05-01T10:00:30Z",
        });
        std::fs::write(results.path().join("m.json"), json.to_string()).unwrap();
        let product = WorkerProduct::new(
            "/work/clone",
            "main",
            "5555555566667777",
            "Routine update",
            Outcome::Timeout,
        );
        write_product(products.path(), &product).unwrap();
        let table = ScenarioTable::builtin().unwrap();

        let report =
            analyze_dirs(results.path(), Some(products.path()), None, 2, &table, true).unwrap();
        assert_eq!(report.grades[0].expected, Outcome::Timeout);
        assert!(report.grades[0].message_known);
        assert_eq!(report.exit_code(), EXIT_PASS);

        let report =
            analyze_dirs(results.path(), Some(products.path()), None, 2, &table, false).unwrap();
        assert_eq!(report.exit_code(), EXIT_NEUTRAL);
    }

    #[test]
    fn analyze_dirs_on_missing_directory_is_neutral() {
        let dir = tempfile::tempdir().unwrap();
        let table = ScenarioTable::builtin().unwrap();
        let report =
            analyze_dirs(&dir.path().join("absent"), None, None, 2, &table, false).unwrap();
        assert_eq!(report.exit_code(), EXIT_NEUTRAL);
    }

    #[test]
    fn preserve_artifacts_writes_sentinel_stats_and_config_copy() {
        let base = tempfile::tempdir().unwrap();
        let work = WorkDir::create(base.path()).unwrap();
        let config = work.root().join(DAEMON_CONFIG_FILE);
        std::fs::write(&config, "repo_path: /r\nmax_concurrent_runs: 2\n").unwrap();
        let stats = HarnessStats::new();
        stats.record_commit();

        preserve_artifacts(&work, &config, &stats).unwrap();

        assert!(work.worker_data_dir().join(STOP_SENTINEL).exists());
        let raw = std::fs::read_to_string(work.root().join(STATS_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["commits_created"], 1);
        assert!(work.log_dir().join(CONFIG_COPY_NAME).exists());
    }

    #[test]
    fn missing_worker_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_worker_bin(Some(&dir.path().join("hci-wkr"))).unwrap_err();
        assert!(err.to_string().contains("Worker binary not found"));
    }
}
