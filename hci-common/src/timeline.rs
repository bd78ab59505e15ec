//! Timeline reconstruction and peak-concurrency sweep.
//!
//! Every run result contributes a START and an END event. Events are sorted
//! by time; at equal instants END sorts before START so a run that ends
//! exactly when another begins never counts as overlapping it. Remaining
//! ties are broken by branch then commit, which keeps the sweep reproducible
//! whatever order the result files were read in.
//!
//! A zero-length run (start == end) is the one exception: its END sorts
//! after every START at that instant, so the run is counted once instead of
//! driving the counter below zero.

use crate::types::RunResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Kind of timeline event. Declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    End,
    Start,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::End => write!(f, "END"),
            Self::Start => write!(f, "START"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub branch: String,
    pub commit: String,
    /// Set on both events of a run whose start equals its end.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub instantaneous: bool,
}

impl TimelineEvent {
    fn rank(&self) -> u8 {
        match (self.kind, self.instantaneous) {
            (EventKind::End, false) => 0,
            (EventKind::Start, _) => 1,
            (EventKind::End, true) => 2,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, u8, &str, &str) {
        (self.at, self.rank(), &self.branch, &self.commit)
    }
}

/// Canonical event order: time, END before START, branch, commit.
pub fn compare_events(a: &TimelineEvent, b: &TimelineEvent) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// Two events per result, in input order.
pub fn build_events(results: &[RunResult]) -> Vec<TimelineEvent> {
    let mut events = Vec::with_capacity(results.len() * 2);
    for result in results {
        let instantaneous = result.start_time == result.end_time;
        events.push(TimelineEvent {
            at: result.start_time,
            kind: EventKind::Start,
            branch: result.branch.clone(),
            commit: result.commit.clone(),
            instantaneous,
        });
        events.push(TimelineEvent {
            at: result.end_time,
            kind: EventKind::End,
            branch: result.branch.clone(),
            commit: result.commit.clone(),
            instantaneous,
        });
    }
    events
}

/// Stable sort into canonical order.
pub fn sort_events(events: &mut [TimelineEvent]) {
    events.sort_by(compare_events);
}

/// Overall verdict of the concurrency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyVerdict {
    Pass,
    Fail,
    /// No results to analyse; neither pass nor fail.
    NoData,
}

impl fmt::Display for ConcurrencyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::NoData => write!(f, "NO DATA"),
        }
    }
}

/// An instant where the in-flight counter exceeded the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub at: DateTime<Utc>,
    pub concurrency: usize,
    /// Run whose START pushed the counter over the limit.
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyReport {
    pub limit: usize,
    pub peak: usize,
    /// First instant the peak was reached.
    pub peak_at: Option<DateTime<Utc>>,
    pub event_count: usize,
    pub violations: Vec<Violation>,
    pub verdict: ConcurrencyVerdict,
}

impl ConcurrencyReport {
    fn no_data(limit: usize) -> Self {
        Self {
            limit,
            peak: 0,
            peak_at: None,
            event_count: 0,
            violations: Vec::new(),
            verdict: ConcurrencyVerdict::NoData,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == ConcurrencyVerdict::Pass
    }
}

/// Walk sorted events, tracking the in-flight counter.
///
/// Expects `events` in canonical order; see [`sort_events`].
pub fn sweep(events: &[TimelineEvent], limit: usize) -> ConcurrencyReport {
    if events.is_empty() {
        return ConcurrencyReport::no_data(limit);
    }

    let mut current: usize = 0;
    let mut peak: usize = 0;
    let mut peak_at = None;
    let mut violations = Vec::new();

    for event in events {
        match event.kind {
            EventKind::Start => {
                current += 1;
                if current > peak {
                    peak = current;
                    peak_at = Some(event.at);
                }
                if current > limit {
                    violations.push(Violation {
                        at: event.at,
                        concurrency: current,
                        branch: event.branch.clone(),
                        commit: event.commit.clone(),
                    });
                }
            }
            EventKind::End => {
                current = current.saturating_sub(1);
            }
        }
    }

    let verdict = if peak <= limit {
        ConcurrencyVerdict::Pass
    } else {
        ConcurrencyVerdict::Fail
    };

    ConcurrencyReport {
        limit,
        peak,
        peak_at,
        event_count: events.len(),
        violations,
        verdict,
    }
}

/// Build, sort and sweep in one call.
pub fn analyze_concurrency(results: &[RunResult], limit: usize) -> ConcurrencyReport {
    let mut events = build_events(results);
    sort_events(&mut events);
    sweep(&events, limit)
}
