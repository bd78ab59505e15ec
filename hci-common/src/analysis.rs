//! Post-run analysis: load results, grade them, sweep the timeline.
//!
//! Loading is tolerant. A file that fails to read or parse is skipped with a
//! warning, as is a result whose start lies after its end. Grading needs the
//! commit message of each run; it comes from a [`CommitMessages`] source and
//! falls back to an empty message, so branch rules still apply.

use crate::scenario::{MatchedRule, Outcome, ScenarioTable};
use crate::timeline::{ConcurrencyReport, ConcurrencyVerdict, analyze_concurrency};
use crate::types::{RunResult, WorkerProduct, is_result_file, short_commit};
use crate::worker::sanitize_branch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exit code when concurrency holds and every graded run matched.
pub const EXIT_PASS: i32 = 0;
/// Exit code when peak concurrency exceeded the limit.
pub const EXIT_CONCURRENCY_FAIL: i32 = 1;
/// Exit code for no data or outcome mismatches only.
pub const EXIT_NEUTRAL: i32 = 2;

/// Name of the JSON report the harness writes into its work directory.
pub const ANALYSIS_FILE_NAME: &str = "analysis.json";

/// Results read from a data directory.
#[derive(Debug, Clone, Default)]
pub struct LoadedResults {
    pub results: Vec<RunResult>,
    /// Files that could not be used, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Read every result file in `dir`.
///
/// A missing directory yields an empty set. Output is sorted by file name.
pub fn load_run_results(dir: &Path) -> std::io::Result<LoadedResults> {
    let mut loaded = LoadedResults::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Results directory {} does not exist", dir.display());
            return Ok(loaded);
        }
        Err(e) => return Err(e),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_result_file(path))
        .collect();
    paths.sort();

    for path in paths {
        match read_result(&path) {
            Ok(result) if result.is_well_ordered() => loaded.results.push(result),
            Ok(result) => {
                warn!(
                    "Skipping {}: start_time {} is after end_time {}",
                    path.display(),
                    result.start_time,
                    result.end_time
                );
                loaded
                    .skipped
                    .push((path, "start_time after end_time".to_string()));
            }
            Err(reason) => {
                warn!("Skipping unreadable result {}: {}", path.display(), reason);
                loaded.skipped.push((path, reason));
            }
        }
    }

    debug!(
        "Loaded {} results from {} ({} skipped)",
        loaded.results.len(),
        dir.display(),
        loaded.skipped.len()
    );
    Ok(loaded)
}

/// Read and parse one result file; the error is a human-readable reason.
pub(crate) fn read_result(path: &Path) -> Result<RunResult, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

/// A source of commit messages for grading.
pub trait CommitMessages {
    /// Message of `commit` on `branch`, if known.
    fn message_for(&self, branch: &str, commit: &str) -> Option<String>;
}

/// No messages at all; grading falls back to branch rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMessages;

impl CommitMessages for NoMessages {
    fn message_for(&self, _branch: &str, _commit: &str) -> Option<String> {
        None
    }
}

/// Worker products indexed by `(sanitised branch, commit8)`.
#[derive(Debug, Clone, Default)]
pub struct ProductIndex {
    products: HashMap<(String, String), WorkerProduct>,
}

impl ProductIndex {
    /// Index every `*_run-product.json` in `dir`. Unreadable files are skipped.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let mut index = Self::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_product = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_run-product.json"));
            if !is_product {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<WorkerProduct>(&raw).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(product) => index.insert(product),
                Err(e) => warn!("Skipping unreadable product {}: {}", path.display(), e),
            }
        }
        Ok(index)
    }

    pub fn insert(&mut self, product: WorkerProduct) {
        let key = (
            sanitize_branch(&product.branch),
            short_commit(&product.commit).to_string(),
        );
        self.products.insert(key, product);
    }

    pub fn get(&self, branch: &str, commit: &str) -> Option<&WorkerProduct> {
        self.products
            .get(&(sanitize_branch(branch), short_commit(commit).to_string()))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl CommitMessages for ProductIndex {
    fn message_for(&self, branch: &str, commit: &str) -> Option<String> {
        self.get(branch, commit).map(|p| p.commit_message.clone())
    }
}

/// Try each source in order; first hit wins.
#[derive(Default)]
pub struct ChainedMessages<'a> {
    sources: Vec<&'a dyn CommitMessages>,
}

impl<'a> ChainedMessages<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, source: &'a dyn CommitMessages) -> Self {
        self.sources.push(source);
        self
    }
}

impl CommitMessages for ChainedMessages<'_> {
    fn message_for(&self, branch: &str, commit: &str) -> Option<String> {
        self.sources
            .iter()
            .find_map(|source| source.message_for(branch, commit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GradeStatus {
    Success,
    Error,
}

/// Expected against actual for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunGrade {
    pub branch: String,
    pub commit: String,
    pub expected: Outcome,
    pub actual: Outcome,
    pub status: GradeStatus,
    pub rule: MatchedRule,
    pub message_known: bool,
}

/// Grade each run against the table, in input order.
///
/// `timeout_mode` grades with the same override the worker used for the
/// run: `SUCCESS`/`FAIL` messages as marked, anything else as a timeout.
pub fn grade_runs(
    results: &[RunResult],
    table: &ScenarioTable,
    messages: &dyn CommitMessages,
    timeout_mode: bool,
) -> Vec<RunGrade> {
    results
        .iter()
        .map(|result| {
            let message = messages.message_for(&result.branch, &result.commit);
            let message_known = message.is_some();
            let verdict = table.explain_in_mode(
                &result.branch,
                &result.commit,
                message.as_deref().unwrap_or_default(),
                timeout_mode,
            );
            let actual = result.actual_outcome();
            let status = if verdict.outcome == actual {
                GradeStatus::Success
            } else {
                GradeStatus::Error
            };
            RunGrade {
                branch: result.branch.clone(),
                commit: result.commit.clone(),
                expected: verdict.outcome,
                actual,
                status,
                rule: verdict.rule,
                message_known,
            }
        })
        .collect()
}

/// Overall outcome of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisVerdict {
    Pass,
    ConcurrencyFail,
    /// Concurrency held but at least one run did not match its expectation.
    Mismatch,
    NoData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub concurrency: ConcurrencyReport,
    pub grades: Vec<RunGrade>,
    pub total_runs: usize,
    pub correct_predictions: usize,
    pub accuracy_percent: f64,
    #[serde(default)]
    pub skipped_files: usize,
    pub verdict: AnalysisVerdict,
}

/// Combine the concurrency sweep and per-run grading.
pub fn analyze(
    results: &[RunResult],
    limit: usize,
    table: &ScenarioTable,
    messages: &dyn CommitMessages,
    timeout_mode: bool,
) -> AnalysisReport {
    let concurrency = analyze_concurrency(results, limit);
    let grades = grade_runs(results, table, messages, timeout_mode);
    let total_runs = grades.len();
    let correct_predictions = grades
        .iter()
        .filter(|g| g.status == GradeStatus::Success)
        .count();
    let accuracy_percent = if total_runs == 0 {
        0.0
    } else {
        correct_predictions as f64 * 100.0 / total_runs as f64
    };

    let verdict = match concurrency.verdict {
        ConcurrencyVerdict::NoData => AnalysisVerdict::NoData,
        ConcurrencyVerdict::Fail => AnalysisVerdict::ConcurrencyFail,
        ConcurrencyVerdict::Pass if correct_predictions == total_runs => AnalysisVerdict::Pass,
        ConcurrencyVerdict::Pass => AnalysisVerdict::Mismatch,
    };

    AnalysisReport {
        concurrency,
        grades,
        total_runs,
        correct_predictions,
        accuracy_percent,
        skipped_files: 0,
        verdict,
    }
}

impl AnalysisReport {
    #[must_use]
    pub fn with_skipped_files(mut self, skipped: usize) -> Self {
        self.skipped_files = skipped;
        self
    }

    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            AnalysisVerdict::Pass => EXIT_PASS,
            AnalysisVerdict::ConcurrencyFail => EXIT_CONCURRENCY_FAIL,
            AnalysisVerdict::Mismatch | AnalysisVerdict::NoData => EXIT_NEUTRAL,
        }
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &RunGrade> {
        self.grades.iter().filter(|g| g.status == GradeStatus::Error)
    }

    /// Human-readable report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Run outcomes ===");
        if self.grades.is_empty() {
            let _ = writeln!(out, "No run results found.");
        }
        for grade in &self.grades {
            let status = match grade.status {
                GradeStatus::Success => "SUCCESS",
                GradeStatus::Error => "ERROR",
            };
            let _ = write!(
                out,
                "{status:<7} {} {} expected={} actual={} ({})",
                grade.branch,
                short_commit(&grade.commit),
                grade.expected,
                grade.actual,
                grade.rule
            );
            if !grade.message_known {
                let _ = write!(out, " [message unknown]");
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(
            out,
            "Correct predictions: {}/{} ({:.1}%)",
            self.correct_predictions, self.total_runs, self.accuracy_percent
        );
        if self.skipped_files > 0 {
            let _ = writeln!(out, "Skipped files: {}", self.skipped_files);
        }

        let c = &self.concurrency;
        let _ = writeln!(out);
        let _ = writeln!(out, "=== Concurrency ===");
        let _ = writeln!(out, "Limit: {}", c.limit);
        match c.peak_at {
            Some(at) => {
                let _ = writeln!(out, "Peak: {} (first reached at {})", c.peak, at.to_rfc3339());
            }
            None => {
                let _ = writeln!(out, "Peak: {}", c.peak);
            }
        }
        for v in &c.violations {
            let _ = writeln!(
                out,
                "VIOLATION at {}: {} concurrent (started {} {})",
                v.at.to_rfc3339(),
                v.concurrency,
                v.branch,
                short_commit(&v.commit)
            );
        }
        let _ = writeln!(out, "Concurrency verdict: {}", c.verdict);
        let _ = writeln!(out, "Exit code: {}", self.exit_code());
        out
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
