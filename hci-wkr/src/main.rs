//! home-ci e2e - Scripted Worker
//!
//! The CI daemon runs this once per `(branch, commit)` through the `test.sh`
//! shim committed in the test repository. It decides from the commit what
//! to do, leaves a product file for the analyser and then passes, fails or
//! hangs on purpose.

#![forbid(unsafe_code)]

mod runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hci_common::scenario::ScenarioTable;
use hci_common::worker::{
    DATA_DIR_ENV, EXPECTATIONS_ENV, WorkerContext, data_dir_from_env, decide_behavior,
};
use hci_common::{LogConfig, init_logging};
use runner::{Pacing, Runner};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "hci-wkr")]
#[command(author, version, about = "home-ci e2e scripted worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide and act for the commit checked out in the working directory
    Run {
        /// Hang unless the commit message says SUCCESS or FAIL
        #[arg(long)]
        timeout_mode: bool,

        /// Checkout to inspect (defaults to the current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Where products and markers go
        #[arg(long, env = DATA_DIR_ENV)]
        data_dir: Option<PathBuf>,

        /// Expectations YAML; the built-in table when omitted
        #[arg(long, env = EXPECTATIONS_ENV)]
        expectations: Option<PathBuf>,
    },

    /// Print the decision for a branch and message without acting on it
    Decide {
        #[arg(long)]
        branch: String,

        #[arg(long)]
        message: String,

        #[arg(long, default_value = "00000000")]
        commit: String,

        #[arg(long)]
        timeout_mode: bool,

        #[arg(long)]
        expectations: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the daemon's run log; diagnostics go to stderr.
    let mut log_config = LogConfig::from_env("info")
        .context("Invalid HCI_LOG_* environment")?
        .with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run {
            timeout_mode,
            workdir,
            data_dir,
            expectations,
        } => {
            let workdir = match workdir {
                Some(dir) => dir,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let data_dir = data_dir.unwrap_or_else(data_dir_from_env);
            let table = ScenarioTable::load_or_builtin(expectations.as_deref())
                .context("Failed to load expectations")?;

            let ctx = tokio::task::spawn_blocking(move || WorkerContext::resolve(&workdir))
                .await
                .context("Git resolution task failed")?
                .context("Failed to resolve branch and commit")?;
            debug!("Resolved worker context: {:?}", ctx);

            let behavior = decide_behavior(
                &table,
                &ctx.branch,
                &ctx.commit,
                &ctx.commit_message,
                timeout_mode,
            );
            let code = Runner::new(ctx, data_dir, Pacing::default())
                .execute(behavior)
                .await?;
            drop(logging_guards);
            std::process::exit(code);
        }

        Commands::Decide {
            branch,
            message,
            commit,
            timeout_mode,
            expectations,
        } => {
            let table = ScenarioTable::load_or_builtin(expectations.as_deref())
                .context("Failed to load expectations")?;
            let behavior = decide_behavior(&table, &branch, &commit, &message, timeout_mode);
            println!("{}", serde_json::to_string_pretty(&behavior)?);
            Ok(())
        }
    }
}
