//! home-ci e2e - Harness
//!
//! Builds a throwaway git repository, points the CI daemon at it, keeps
//! committing while the daemon works, then checks the daemon's run results
//! for concurrency-limit compliance and expected outcomes.

#![forbid(unsafe_code)]

mod daemon;
mod error;
mod repo;
mod run;
mod simulator;
mod workdir;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hci_common::{HarnessSettings, LogConfig, ScenarioTable, init_logging};
use run::{RunOptions, analyze_dirs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "hci-e2e")]
#[command(author, version, about = "home-ci end-to-end harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon against a synthetic repository and analyse the results
    Run {
        /// Parent of the per-run work directory
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// CI daemon executable
        #[arg(long)]
        daemon_bin: Option<PathBuf>,

        /// Worker executable (defaults to hci-wkr next to this binary)
        #[arg(long)]
        worker_bin: Option<PathBuf>,

        #[arg(short = 'n', long)]
        max_concurrent_runs: Option<u32>,

        /// How long to let the daemon work (e.g. "2m")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        #[arg(long, value_parser = humantime::parse_duration)]
        commit_interval: Option<Duration>,

        #[arg(long, value_parser = humantime::parse_duration)]
        poll_interval: Option<Duration>,

        /// Per-run timeout the daemon is configured with
        #[arg(long, value_parser = humantime::parse_duration)]
        test_timeout: Option<Duration>,

        /// Stop committing after this many simulated commits
        #[arg(long)]
        max_commits: Option<u64>,

        /// Make workers hang unless the commit says SUCCESS or FAIL
        #[arg(long)]
        timeout_mode: bool,

        /// Expectations YAML; the built-in table when omitted
        #[arg(long)]
        expectations: Option<PathBuf>,

        /// Keep the work directory even when the run passes
        #[arg(long)]
        keep: bool,
    },

    /// Analyse an existing results directory
    Analyze {
        #[arg(long)]
        results_dir: PathBuf,

        #[arg(short = 'n', long)]
        max_concurrent_runs: usize,

        /// Directory holding worker products (commit messages)
        #[arg(long)]
        products_dir: Option<PathBuf>,

        /// Repository to read missing commit messages from
        #[arg(long)]
        repo: Option<PathBuf>,

        #[arg(long)]
        expectations: Option<PathBuf>,

        /// Grade as a `run --timeout-mode` run: plain commits expect a timeout
        #[arg(long)]
        timeout_mode: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Also write the JSON report to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the expected outcome for one commit
    Expect {
        #[arg(long)]
        branch: String,

        #[arg(long)]
        commit: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        expectations: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info")
        .context("Invalid HCI_LOG_* environment")?
        .with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(path) = &cli.log_file {
        log_config = log_config.with_file(path);
    }
    let logging_guards = init_logging(&log_config)?;

    let code = match cli.command {
        Commands::Run {
            work_dir,
            daemon_bin,
            worker_bin,
            max_concurrent_runs,
            duration,
            commit_interval,
            poll_interval,
            test_timeout,
            max_commits,
            timeout_mode,
            expectations,
            keep,
        } => {
            let mut settings =
                HarnessSettings::from_env().context("Invalid HCI_* environment")?;
            if let Some(v) = work_dir {
                settings.work_dir = v;
            }
            if let Some(v) = daemon_bin {
                settings.daemon_bin = v;
            }
            if worker_bin.is_some() {
                settings.worker_bin = worker_bin;
            }
            if let Some(v) = max_concurrent_runs {
                settings.max_concurrent_runs = v;
            }
            if let Some(v) = duration {
                settings.run_duration = v;
            }
            if let Some(v) = commit_interval {
                settings.commit_interval = v;
            }
            if let Some(v) = poll_interval {
                settings.poll_interval = v;
            }
            if let Some(v) = test_timeout {
                settings.test_timeout = v;
            }
            settings.keep_work_dir |= keep;
            settings.validate().context("Invalid harness settings")?;
            debug!("Harness settings: {:?}", settings);

            run::run(RunOptions {
                settings,
                timeout_mode,
                expectations,
                max_commits,
            })
            .await?
        }

        Commands::Analyze {
            results_dir,
            max_concurrent_runs,
            products_dir,
            repo,
            expectations,
            timeout_mode,
            json,
            output,
        } => {
            let table = ScenarioTable::load_or_builtin(expectations.as_deref())
                .context("Failed to load expectations")?;
            let report = analyze_dirs(
                &results_dir,
                products_dir.as_deref(),
                repo.as_deref(),
                max_concurrent_runs,
                &table,
                timeout_mode,
            )?;
            if let Some(path) = output {
                report
                    .write_json(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            report.exit_code()
        }

        Commands::Expect {
            branch,
            commit,
            message,
            expectations,
        } => {
            let table = ScenarioTable::load_or_builtin(expectations.as_deref())
                .context("Failed to load expectations")?;
            let verdict = table.explain(&branch, &commit, &message);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            0
        }
    };

    drop(logging_guards);
    std::process::exit(code);
}
