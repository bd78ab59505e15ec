//! Run observer: polls the daemon's data directory while the harness runs.
//!
//! The observer only reads. Each tick takes a [`DataDirSnapshot`] and
//! reconciles it into running totals that only grow: the set of result file
//! names seen so far, whether any run timed out, and the live entries that
//! disappeared without leaving a result behind.

use crate::analysis::read_result;
use crate::types::{LiveState, RunResult, RunningTest, STATE_FILE_NAME, is_result_file};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One result file as seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedFile {
    Parsed(RunResult),
    /// Read or parse failed; likely still being written.
    Unreadable(String),
}

/// Everything one scan found in the data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDirSnapshot {
    /// Result files keyed by file name.
    pub files: BTreeMap<String, ScannedFile>,
    /// `state.json`, when present and parseable.
    pub live: Option<LiveState>,
}

impl DataDirSnapshot {
    pub fn parsed(&self) -> impl Iterator<Item = (&str, &RunResult)> {
        self.files.iter().filter_map(|(name, file)| match file {
            ScannedFile::Parsed(result) => Some((name.as_str(), result)),
            ScannedFile::Unreadable(_) => None,
        })
    }
}

/// Scan `dir` once. Never fails: problems are logged and reflected in the
/// snapshot.
pub fn scan_data_dir(dir: &Path) -> DataDirSnapshot {
    let mut snapshot = DataDirSnapshot::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to list data directory {}: {}", dir.display(), e);
            }
            return snapshot;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_result_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let scanned = match read_result(&path) {
            Ok(result) => ScannedFile::Parsed(result),
            Err(reason) => {
                warn!("Result {} not readable yet: {}", path.display(), reason);
                ScannedFile::Unreadable(reason)
            }
        };
        snapshot.files.insert(name, scanned);
    }

    snapshot.live = read_live_state(&dir.join(STATE_FILE_NAME));
    snapshot
}

fn read_live_state(path: &Path) -> Option<LiveState> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            debug!("Ignoring unparseable {}: {}", path.display(), e);
            None
        }
    }
}

/// A live entry that left `state.json` without a matching result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VanishedRun {
    pub branch: String,
    pub commit: String,
    pub noticed_at: DateTime<Utc>,
}

/// Counters shared between the simulator, the observer and the harness.
///
/// The simulator writes `commits_created` and `branches_created`; the
/// observer writes everything else.
#[derive(Debug, Default)]
pub struct HarnessStats {
    commits_created: AtomicU64,
    branches_created: AtomicU64,
    in_flight: AtomicUsize,
    total_distinct_completed: AtomicUsize,
    timeout_detected: AtomicBool,
    vanished: Mutex<Vec<VanishedRun>>,
}

impl HarnessStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_commit(&self) {
        self.commits_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_branch(&self) {
        self.branches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits_created(&self) -> u64 {
        self.commits_created.load(Ordering::Relaxed)
    }

    pub fn total_distinct_completed(&self) -> usize {
        self.total_distinct_completed.load(Ordering::Relaxed)
    }

    pub fn timeout_detected(&self) -> bool {
        self.timeout_detected.load(Ordering::Relaxed)
    }

    fn publish(&self, in_flight: usize, completed: usize, timeout: bool, vanished: &[VanishedRun]) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
        self.total_distinct_completed
            .store(completed, Ordering::Relaxed);
        self.timeout_detected.store(timeout, Ordering::Relaxed);
        let mut guard = self.vanished.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
        guard.extend_from_slice(vanished);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let vanished = self
            .vanished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        StatsSnapshot {
            commits_created: self.commits_created.load(Ordering::Relaxed),
            branches_created: self.branches_created.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_distinct_completed: self.total_distinct_completed.load(Ordering::Relaxed),
            timeout_detected: self.timeout_detected.load(Ordering::Relaxed),
            vanished,
            taken_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of [`HarnessStats`], written as `harness-stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub commits_created: u64,
    pub branches_created: u64,
    pub in_flight: usize,
    pub total_distinct_completed: usize,
    pub timeout_detected: bool,
    pub vanished: Vec<VanishedRun>,
    pub taken_at: DateTime<Utc>,
}

/// What changed in one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub new_files: Vec<String>,
    pub total_distinct_completed: usize,
    pub running_tests: Vec<RunningTest>,
    pub timeout_detected: bool,
    pub newly_vanished: Vec<RunningTest>,
    pub recovered: Vec<RunningTest>,
    pub unreadable: usize,
}

pub struct RunObserver {
    data_dir: PathBuf,
    stats: Arc<HarnessStats>,
    tick: u64,
    seen: BTreeSet<String>,
    parsed: BTreeSet<String>,
    results: Vec<RunResult>,
    previous_running: Vec<RunningTest>,
    vanished: Vec<(RunningTest, DateTime<Utc>)>,
    timeout_detected: bool,
}

impl RunObserver {
    pub fn new(data_dir: impl Into<PathBuf>, stats: Arc<HarnessStats>) -> Self {
        Self {
            data_dir: data_dir.into(),
            stats,
            tick: 0,
            seen: BTreeSet::new(),
            parsed: BTreeSet::new(),
            results: Vec::new(),
            previous_running: Vec::new(),
            vanished: Vec::new(),
            timeout_detected: false,
        }
    }

    pub fn distinct_completed(&self) -> usize {
        self.seen.len()
    }

    pub fn vanished(&self) -> impl Iterator<Item = &RunningTest> {
        self.vanished.iter().map(|(entry, _)| entry)
    }

    /// Reconcile one snapshot into the running totals and publish them.
    pub fn apply(&mut self, snapshot: DataDirSnapshot) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        for (name, file) in snapshot.files {
            match file {
                ScannedFile::Parsed(result) => {
                    if self.seen.insert(name.clone()) {
                        report.new_files.push(name.clone());
                    }
                    // Files first seen unreadable are recorded once they parse.
                    if self.parsed.insert(name) {
                        self.record_result(result);
                    }
                }
                ScannedFile::Unreadable(_) => {
                    report.unreadable += 1;
                    if self.seen.insert(name.clone()) {
                        report.new_files.push(name);
                    }
                }
            }
        }

        // Clear vanished entries a result has since accounted for.
        let results = &self.results;
        let (recovered, still_vanished): (Vec<_>, Vec<_>) = std::mem::take(&mut self.vanished)
            .into_iter()
            .partition(|(entry, _)| results.iter().any(|r| entry.matches_result(r)));
        self.vanished = still_vanished;
        report.recovered = recovered.into_iter().map(|(entry, _)| entry).collect();

        // No readable state file: nothing to compare against. The previous
        // running set stays the baseline until a state file parses again.
        let Some(live) = snapshot.live else {
            debug!("Tick {}: no live state, vanished check skipped", self.tick);
            return self.finish_tick(report);
        };
        let running = live.running_tests;

        let now = Utc::now();
        for entry in std::mem::take(&mut self.previous_running) {
            let still_running = running
                .iter()
                .any(|r| r.branch == entry.branch && r.commit == entry.commit);
            let has_result = self.results.iter().any(|r| entry.matches_result(r));
            let already_recorded = self
                .vanished
                .iter()
                .any(|(v, _)| v.branch == entry.branch && v.commit == entry.commit);
            if !still_running && !has_result && !already_recorded {
                warn!(
                    "Run {} {} left the live state without a result file",
                    entry.branch, entry.commit
                );
                report.newly_vanished.push(entry.clone());
                self.vanished.push((entry, now));
            }
        }
        self.previous_running = running.clone();
        report.running_tests = running;
        self.finish_tick(report)
    }

    fn finish_tick(&mut self, mut report: TickReport) -> TickReport {
        report.total_distinct_completed = self.seen.len();
        report.timeout_detected = self.timeout_detected;

        let vanished: Vec<VanishedRun> = self
            .vanished
            .iter()
            .map(|(entry, noticed_at)| VanishedRun {
                branch: entry.branch.clone(),
                commit: entry.commit.clone(),
                noticed_at: *noticed_at,
            })
            .collect();
        self.stats.publish(
            report.running_tests.len(),
            report.total_distinct_completed,
            report.timeout_detected,
            &vanished,
        );

        if !report.new_files.is_empty() {
            debug!(
                "Tick {}: {} new result(s), {} distinct, {} running",
                report.tick,
                report.new_files.len(),
                report.total_distinct_completed,
                report.running_tests.len()
            );
        }
        report
    }

    fn record_result(&mut self, result: RunResult) {
        if result.timed_out && !self.timeout_detected {
            info!("First timed-out run observed: {} {}", result.branch, result.commit);
            self.timeout_detected = true;
        }
        self.results.push(result);
    }

    /// Scan on a blocking thread and apply the snapshot.
    pub async fn tick_once(&mut self) -> Option<TickReport> {
        let dir = self.data_dir.clone();
        match tokio::task::spawn_blocking(move || scan_data_dir(&dir)).await {
            Ok(snapshot) => Some(self.apply(snapshot)),
            Err(e) => {
                warn!("Data directory scan task failed: {}", e);
                None
            }
        }
    }

    /// Poll until `shutdown` turns true, then run one final tick.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Observer started on {} (interval: {:?})",
            self.data_dir.display(),
            period
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.tick_once().await;
        info!(
            "Observer stopped after {} ticks: {} distinct results, timeout seen: {}",
            self.tick,
            self.seen.len(),
            self.timeout_detected
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_550_400 + secs, 0).unwrap()
    }

    fn entry(branch: &str, commit: &str) -> RunningTest {
        RunningTest {
            branch: branch.to_string(),
            commit: commit.to_string(),
            start_time: None,
            log_file: None,
        }
    }

    fn snapshot(files: &[(&str, ScannedFile)], running: Option<Vec<RunningTest>>) -> DataDirSnapshot {
        DataDirSnapshot {
            files: files
                .iter()
                .map(|(name, file)| (name.to_string(), file.clone()))
                .collect(),
            live: running.map(|running_tests| LiveState { running_tests }),
        }
    }

    fn parsed(branch: &str, commit: &str, timed_out: bool) -> ScannedFile {
        ScannedFile::Parsed(
            RunResult::new(branch, commit, at(0), at(5))
                .with_success(!timed_out)
                .with_timed_out(timed_out),
        )
    }

    #[test]
    fn distinct_count_never_double_counts() {
        let stats = HarnessStats::new();
        let mut observer = RunObserver::new("/unused", stats.clone());
        let a = ("1_main_aaaa.json", parsed("main", "aaaa", false));
        let b = ("2_main_bbbb.json", parsed("main", "bbbb", false));

        let first = observer.apply(snapshot(std::slice::from_ref(&a), None));
        assert_eq!(first.total_distinct_completed, 1);
        let second = observer.apply(snapshot(&[a.clone(), b], None));
        assert_eq!(second.total_distinct_completed, 2);
        assert_eq!(second.new_files, ["2_main_bbbb.json"]);
        // A file missing from one listing is not forgotten.
        let third = observer.apply(snapshot(&[a], None));
        assert_eq!(third.total_distinct_completed, 2);
        assert_eq!(stats.total_distinct_completed(), 2);
    }

    #[test]
    fn running_tests_come_from_current_tick_only() {
        let mut observer = RunObserver::new("/unused", HarnessStats::new());
        let report = observer.apply(snapshot(&[], Some(vec![entry("main", "aaaa")])));
        assert_eq!(report.running_tests.len(), 1);
        let report = observer.apply(snapshot(&[], None));
        assert!(report.running_tests.is_empty());
    }

    #[test]
    fn timeout_flag_latches() {
        let stats = HarnessStats::new();
        let mut observer = RunObserver::new("/unused", stats.clone());
        assert!(!observer.apply(snapshot(&[], None)).timeout_detected);
        let report = observer.apply(snapshot(&[("t.json", parsed("bugfix/critical", "cccc", true))], None));
        assert!(report.timeout_detected);
        assert!(observer.apply(snapshot(&[], None)).timeout_detected);
        assert!(stats.timeout_detected());
    }

    #[test]
    fn vanished_entry_is_recorded_then_cleared_by_late_result() {
        let stats = HarnessStats::new();
        let mut observer = RunObserver::new("/unused", stats.clone());
        observer.apply(snapshot(&[], Some(vec![entry("feature/test1", "dddd1111")])));

        let report = observer.apply(snapshot(&[], Some(vec![])));
        assert_eq!(report.newly_vanished, [entry("feature/test1", "dddd1111")]);
        assert_eq!(stats.snapshot().vanished.len(), 1);

        let late = ("late.json", parsed("feature/test1", "dddd1111ffff", false));
        let report = observer.apply(snapshot(&[late], None));
        assert_eq!(report.recovered, [entry("feature/test1", "dddd1111")]);
        assert!(stats.snapshot().vanished.is_empty());
    }

    #[test]
    fn missing_live_state_does_not_vanish_running_entries() {
        let stats = HarnessStats::new();
        let mut observer = RunObserver::new("/unused", stats.clone());
        observer.apply(snapshot(&[], Some(vec![entry("main", "abcd1234")])));

        // state.json briefly missing or mid-write.
        let report = observer.apply(DataDirSnapshot::default());
        assert!(report.newly_vanished.is_empty());
        assert!(report.running_tests.is_empty());

        let report = observer.apply(snapshot(&[], Some(vec![entry("main", "abcd1234")])));
        assert!(report.newly_vanished.is_empty());
        assert_eq!(report.running_tests, [entry("main", "abcd1234")]);
        assert_eq!(observer.vanished().count(), 0);
        assert!(stats.snapshot().vanished.is_empty());

        // The baseline survives the gap, so a real disappearance still counts.
        observer.apply(DataDirSnapshot::default());
        let report = observer.apply(snapshot(&[], Some(vec![])));
        assert_eq!(report.newly_vanished, [entry("main", "abcd1234")]);
    }

    #[test]
    fn entry_leaving_with_result_is_not_vanished() {
        let mut observer = RunObserver::new("/unused", HarnessStats::new());
        observer.apply(snapshot(&[], Some(vec![entry("main", "eeee")])));
        let done = ("done.json", parsed("main", "eeee0000", false));
        let report = observer.apply(snapshot(&[done], Some(vec![])));
        assert!(report.newly_vanished.is_empty());
        assert_eq!(observer.vanished().count(), 0);
    }

    #[test]
    fn unreadable_file_counts_once_and_is_reparsed() {
        let mut observer = RunObserver::new("/unused", HarnessStats::new());
        let report = observer.apply(snapshot(
            &[("x.json", ScannedFile::Unreadable("EOF".to_string()))],
            None,
        ));
        assert_eq!(report.unreadable, 1);
        assert_eq!(report.total_distinct_completed, 1);
        assert!(!report.timeout_detected);

        let report = observer.apply(snapshot(&[("x.json", parsed("main", "ffff", true))], None));
        assert_eq!(report.total_distinct_completed, 1);
        assert!(report.new_files.is_empty());
        assert!(report.timeout_detected);
    }

    #[test]
    fn scan_skips_state_and_reads_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let result = RunResult::new("main", "abcd1234", at(0), at(1)).with_success(true);
        std::fs::write(
            dir.path().join("20240501_main_abcd1234.json"),
            serde_json::to_string(&result).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("half.json"), "{\"branch\": \"ma").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(
            dir.path().join(STATE_FILE_NAME),
            r#"{"running_tests":[{"branch":"dev","commit":"0000aaaa"}]}"#,
        )
        .unwrap();

        let snap = scan_data_dir(dir.path());
        assert_eq!(snap.files.len(), 2);
        assert_eq!(snap.parsed().count(), 1);
        assert!(matches!(snap.files["half.json"], ScannedFile::Unreadable(_)));
        assert_eq!(snap.live.unwrap().running_tests[0].branch, "dev");
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = scan_data_dir(&dir.path().join("nope"));
        assert!(snap.files.is_empty());
        assert!(snap.live.is_none());
    }

    #[test]
    fn stats_snapshot_serializes() {
        let stats = HarnessStats::new();
        stats.record_commit();
        stats.record_commit();
        stats.record_branch();
        let snap = stats.snapshot();
        assert_eq!(snap.commits_created, 2);
        assert_eq!(snap.branches_created, 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["commits_created"], 2);
        assert_eq!(json["timeout_detected"], false);
    }

    #[tokio::test]
    async fn run_loop_performs_final_tick_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let stats = HarnessStats::new();
        let observer = RunObserver::new(dir.path(), stats.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(observer.run(Duration::from_millis(20), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = RunResult::new("main", "12345678", at(0), at(3)).with_timed_out(true);
        std::fs::write(
            dir.path().join("late.json"),
            serde_json::to_string(&result).unwrap(),
        )
        .unwrap();
        tx.send(true).unwrap();

        let observer = handle.await.unwrap();
        assert_eq!(observer.distinct_completed(), 1);
        assert!(stats.timeout_detected());
    }

    mod proptest_observer {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn distinct_completed_equals_result_files_on_disk(
                names in prop::collection::btree_set("[a-z]{1,8}", 0..12),
                with_state: bool,
            ) {
                let dir = tempfile::tempdir().unwrap();
                for (i, name) in names.iter().enumerate() {
                    let result = RunResult::new(name.as_str(), format!("{i:08x}"), at(0), at(1));
                    std::fs::write(
                        dir.path().join(format!("run_{name}.json")),
                        serde_json::to_string(&result).unwrap(),
                    ).unwrap();
                }
                if with_state {
                    std::fs::write(dir.path().join(STATE_FILE_NAME), "{}").unwrap();
                }

                let mut observer = RunObserver::new(dir.path(), HarnessStats::new());
                // Two ticks over the same directory must not double count.
                observer.apply(scan_data_dir(dir.path()));
                let report = observer.apply(scan_data_dir(dir.path()));

                let on_disk = std::fs::read_dir(dir.path())
                    .unwrap()
                    .flatten()
                    .filter(|e| is_result_file(&e.path()))
                    .count();
                prop_assert_eq!(report.total_distinct_completed, on_disk);
                prop_assert_eq!(on_disk, names.len());
            }
        }
    }
}
