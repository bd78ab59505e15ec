//! Scenario table: the expected outcome of a `(branch, commit, message)` run.
//!
//! The table is loaded once from an expectations YAML document and is
//! immutable afterwards. Lookups follow a fixed priority:
//!
//! 1. global commit patterns, in listed order, matched against the message;
//! 2. an exact branch key, where a `commit_hash_prefix` special case beats
//!    the branch's `default_result`;
//! 3. wildcard branch keys (keys containing `*`), in document order;
//! 4. `success`.
//!
//! Branch keys are decoded into a `Vec` so document order survives loading.

use glob::Pattern;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Expectations shipped with the harness. Mirrors the worker's decision ladder.
const BUILTIN_EXPECTATIONS: &str = include_str!("../assets/expectations.yaml");

/// Outcome of a single worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Success, Outcome::Failure, Outcome::Timeout];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            other => Err(ScenarioError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Errors raised while loading an expectations document.
///
/// Lookups never fail; every problem surfaces here, at load time.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read expectations file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed expectations document: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Unknown outcome '{0}' (expected success, failure or timeout)")]
    UnknownOutcome(String),
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;

// =========================================================================
// Document model (YAML boundary)
// =========================================================================

/// Raw expectations document as it appears on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationsDoc {
    #[serde(default)]
    pub global_scenarios: GlobalScenarios,
    #[serde(default)]
    pub branch_scenarios: BranchScenarios,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalScenarios {
    #[serde(default)]
    pub commit_patterns: Vec<CommitPattern>,
}

/// A message glob that decides the outcome on every branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPattern {
    pub pattern: String,
    pub expected_result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchScenario {
    pub default_result: Outcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_cases: Vec<SpecialCase>,
}

/// Per-commit override inside a branch, selected by hash prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialCase {
    pub commit_hash_prefix: String,
    pub expected_result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Branch map that keeps document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchScenarios(pub Vec<(String, BranchScenario)>);

impl<'de> Deserialize<'de> for BranchScenarios {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = BranchScenarios;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping from branch name or glob to a branch scenario")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(BranchScenarios::default())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, BranchScenario)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, BranchScenario>()? {
                    if entries.iter().any(|(existing, _)| existing == &key) {
                        return Err(de::Error::custom(format!(
                            "duplicate branch scenario key '{key}'"
                        )));
                    }
                    entries.push((key, value));
                }
                Ok(BranchScenarios(entries))
            }
        }

        deserializer.deserialize_any(OrderedVisitor)
    }
}

impl Serialize for BranchScenarios {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// =========================================================================
// Compiled table
// =========================================================================

/// Which rule produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum MatchedRule {
    GlobalPattern { index: usize, pattern: String },
    SpecialCase { branch: String, prefix: String },
    BranchDefault { branch: String },
    WildcardBranch { pattern: String },
    Fallback,
    /// Timeout-mode override: SUCCESS/FAIL markers, otherwise a hang.
    TimeoutMode,
}

impl fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalPattern { index, pattern } => {
                write!(f, "global commit pattern #{index} '{pattern}'")
            }
            Self::SpecialCase { branch, prefix } => {
                write!(f, "special case '{prefix}' on branch '{branch}'")
            }
            Self::BranchDefault { branch } => write!(f, "default of branch '{branch}'"),
            Self::WildcardBranch { pattern } => write!(f, "wildcard branch '{pattern}'"),
            Self::Fallback => write!(f, "fallback"),
            Self::TimeoutMode => write!(f, "timeout mode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub outcome: Outcome,
    #[serde(flatten)]
    pub rule: MatchedRule,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    glob: Pattern,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
struct CompiledBranch {
    key: String,
    /// Present only for keys containing `*`.
    wildcard: Option<Pattern>,
    default_result: Outcome,
    special_cases: Vec<SpecialCase>,
}

/// Loaded, queryable form of an expectations document.
#[derive(Debug, Clone)]
pub struct ScenarioTable {
    patterns: Vec<CompiledPattern>,
    branches: Vec<CompiledBranch>,
}

fn compile_glob(pattern: &str) -> ScenarioResult<Pattern> {
    Pattern::new(pattern).map_err(|source| ScenarioError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl ScenarioTable {
    /// Compile a decoded document. Invalid globs are rejected here.
    pub fn from_doc(doc: &ExpectationsDoc) -> ScenarioResult<Self> {
        let patterns = doc
            .global_scenarios
            .commit_patterns
            .iter()
            .map(|p| {
                Ok(CompiledPattern {
                    source: p.pattern.clone(),
                    glob: compile_glob(&p.pattern)?,
                    outcome: p.expected_result,
                })
            })
            .collect::<ScenarioResult<Vec<_>>>()?;

        let branches = doc
            .branch_scenarios
            .0
            .iter()
            .map(|(key, scenario)| {
                let wildcard = if key.contains('*') {
                    Some(compile_glob(key)?)
                } else {
                    None
                };
                Ok(CompiledBranch {
                    key: key.clone(),
                    wildcard,
                    default_result: scenario.default_result,
                    special_cases: scenario.special_cases.clone(),
                })
            })
            .collect::<ScenarioResult<Vec<_>>>()?;

        Ok(Self { patterns, branches })
    }

    pub fn from_yaml_str(yaml: &str) -> ScenarioResult<Self> {
        let doc: ExpectationsDoc = serde_yaml_ng::from_str(yaml)?;
        Self::from_doc(&doc)
    }

    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// The expectations embedded in the binary.
    pub fn builtin() -> ScenarioResult<Self> {
        Self::from_yaml_str(BUILTIN_EXPECTATIONS)
    }

    /// Load `path` when given, otherwise the built-in expectations.
    pub fn load_or_builtin(path: Option<&Path>) -> ScenarioResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Expected outcome for a run. Total: always returns an outcome.
    pub fn expected_outcome(&self, branch: &str, commit_hex: &str, message: &str) -> Outcome {
        self.explain(branch, commit_hex, message).outcome
    }

    /// [`Self::explain`], unless `timeout_mode` is on: then a message with
    /// `SUCCESS` passes, one with `FAIL` fails and everything else times out,
    /// whatever the table says.
    pub fn explain_in_mode(
        &self,
        branch: &str,
        commit_hex: &str,
        message: &str,
        timeout_mode: bool,
    ) -> Verdict {
        if !timeout_mode {
            return self.explain(branch, commit_hex, message);
        }
        let outcome = if message.contains("SUCCESS") {
            Outcome::Success
        } else if message.contains("FAIL") {
            Outcome::Failure
        } else {
            Outcome::Timeout
        };
        Verdict {
            outcome,
            rule: MatchedRule::TimeoutMode,
        }
    }

    /// Same lookup as [`Self::expected_outcome`], also naming the rule that decided it.
    pub fn explain(&self, branch: &str, commit_hex: &str, message: &str) -> Verdict {
        if let Some((index, pattern)) = self
            .patterns
            .iter()
            .enumerate()
            .find(|(_, p)| p.glob.matches(message))
        {
            return Verdict {
                outcome: pattern.outcome,
                rule: MatchedRule::GlobalPattern {
                    index,
                    pattern: pattern.source.clone(),
                },
            };
        }

        if let Some(exact) = self.branches.iter().find(|b| b.key == branch) {
            if let Some(case) = exact
                .special_cases
                .iter()
                .find(|c| commit_hex.starts_with(&c.commit_hash_prefix))
            {
                return Verdict {
                    outcome: case.expected_result,
                    rule: MatchedRule::SpecialCase {
                        branch: exact.key.clone(),
                        prefix: case.commit_hash_prefix.clone(),
                    },
                };
            }
            return Verdict {
                outcome: exact.default_result,
                rule: MatchedRule::BranchDefault {
                    branch: exact.key.clone(),
                },
            };
        }

        let wildcard = self.branches.iter().find(|b| {
            b.wildcard
                .as_ref()
                .is_some_and(|pattern| pattern.matches(branch))
        });
        if let Some(entry) = wildcard {
            return Verdict {
                outcome: entry.default_result,
                rule: MatchedRule::WildcardBranch {
                    pattern: entry.key.clone(),
                },
            };
        }

        Verdict {
            outcome: Outcome::Success,
            rule: MatchedRule::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global_scenarios:
  commit_patterns:
    - pattern: "*TIMEOUT*"
      expected_result: timeout
      description: "stress"
branch_scenarios:
  "main":
    default_result: success
    special_cases:
      - commit_hash_prefix: "dead"
        expected_result: failure
  "feat*":
    default_result: timeout
  "feature/*":
    default_result: success
  "bugfix/*":
    default_result: failure
"#;

    fn sample() -> ScenarioTable {
        ScenarioTable::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn exact_branch_default_applies() {
        let table = sample();
        assert_eq!(
            table.expected_outcome("main", "a1b2c3d4e5", "Add foo"),
            Outcome::Success
        );
    }

    #[test]
    fn global_pattern_beats_branch_rules() {
        let table = sample();
        let verdict = table.explain("main", "deadbeef", "TIMEOUT: stress");
        assert_eq!(verdict.outcome, Outcome::Timeout);
        assert!(matches!(verdict.rule, MatchedRule::GlobalPattern { index: 0, .. }));
    }

    #[test]
    fn special_case_prefix_beats_default() {
        let table = sample();
        let verdict = table.explain("main", "deadbeef01", "routine");
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert_eq!(
            verdict.rule,
            MatchedRule::SpecialCase {
                branch: "main".to_string(),
                prefix: "dead".to_string()
            }
        );
    }

    #[test]
    fn special_case_prefix_is_case_sensitive() {
        let table = sample();
        assert_eq!(
            table.expected_outcome("main", "DEADBEEF", "routine"),
            Outcome::Success
        );
    }

    #[test]
    fn wildcards_follow_document_order() {
        // "feat*" is listed before "feature/*" and matches first.
        let table = sample();
        let verdict = table.explain("feature/login", "abc", "wip");
        assert_eq!(verdict.outcome, Outcome::Timeout);
        assert_eq!(
            verdict.rule,
            MatchedRule::WildcardBranch {
                pattern: "feat*".to_string()
            }
        );
    }

    #[test]
    fn wildcard_branch_applies_without_exact_key() {
        let table = sample();
        assert_eq!(
            table.expected_outcome("bugfix/xyz", "0123", "fix"),
            Outcome::Failure
        );
    }

    #[test]
    fn unmatched_branch_falls_back_to_success() {
        let table = sample();
        let verdict = table.explain("release/1.0", "0123", "bump");
        assert_eq!(verdict.outcome, Outcome::Success);
        assert_eq!(verdict.rule, MatchedRule::Fallback);
    }

    #[test]
    fn unknown_outcome_is_rejected_at_load() {
        let yaml = r#"
branch_scenarios:
  "main":
    default_result: flaky
"#;
        let err = ScenarioTable::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)), "got {err:?}");
    }

    #[test]
    fn malformed_document_is_rejected() {
        let err = ScenarioTable::from_yaml_str("global_scenarios: [unclosed").unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let yaml = r#"
global_scenarios:
  commit_patterns:
    - pattern: "[unterminated"
      expected_result: failure
"#;
        let err = ScenarioTable::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidPattern { .. }));
    }

    #[test]
    fn duplicate_branch_keys_are_rejected() {
        let yaml = r#"
branch_scenarios:
  "main":
    default_result: success
  "main":
    default_result: failure
"#;
        assert!(ScenarioTable::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn missing_sections_yield_fallback_table() {
        let table = ScenarioTable::from_yaml_str("branch_scenarios: {}\n").unwrap();
        assert_eq!(table.pattern_count(), 0);
        assert_eq!(table.branch_count(), 0);
        assert_eq!(
            table.expected_outcome("anything", "00", "msg"),
            Outcome::Success
        );
    }

    #[test]
    fn builtin_table_matches_worker_ladder() {
        let table = ScenarioTable::builtin().unwrap();
        let cases = [
            ("main", "plain", Outcome::Success),
            ("feature/test1", "plain", Outcome::Success),
            ("feature/test2", "Progress", Outcome::Failure),
            ("bugfix/critical", "plain", Outcome::Timeout),
            ("feature/other", "plain", Outcome::Success),
            ("bugfix/other", "plain", Outcome::Failure),
            ("release/x", "plain", Outcome::Success),
            ("main", "FAIL: boom", Outcome::Failure),
            ("main", "TIMEOUT: hang", Outcome::Timeout),
            ("feature/test2", "SUCCESS please", Outcome::Success),
            ("bugfix/critical", "CONCURRENT_TEST hold", Outcome::Success),
        ];
        for (branch, message, expected) in cases {
            assert_eq!(
                table.expected_outcome(branch, "abcdef12", message),
                expected,
                "branch={branch} message={message}"
            );
        }
    }

    #[test]
    fn document_order_survives_round_trip() {
        let doc: ExpectationsDoc = serde_yaml_ng::from_str(SAMPLE).unwrap();
        let keys: Vec<&str> = doc.branch_scenarios.0.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["main", "feat*", "feature/*", "bugfix/*"]);

        let yaml = serde_yaml_ng::to_string(&doc).unwrap();
        let reparsed: ExpectationsDoc = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn timeout_mode_overrides_the_table() {
        let table = ScenarioTable::from_yaml_str(SAMPLE).unwrap();
        let plain = table.explain_in_mode("main", "dead0000", "Routine update", true);
        assert_eq!(plain.outcome, Outcome::Timeout);
        assert_eq!(plain.rule, MatchedRule::TimeoutMode);
        assert_eq!(plain.rule.to_string(), "timeout mode");

        let ok = table.explain_in_mode("feat/x", "0000", "SUCCESS: quick", true);
        assert_eq!(ok.outcome, Outcome::Success);
        let bad = table.explain_in_mode("main", "0000", "FAIL: injected", true);
        assert_eq!(bad.outcome, Outcome::Failure);

        // Off, it is the ordinary lookup.
        assert_eq!(
            table.explain_in_mode("main", "dead0000", "Routine update", false),
            table.explain("main", "dead0000", "Routine update")
        );
    }

    #[test]
    fn outcome_parses_only_known_strings() {
        assert_eq!("timeout".parse::<Outcome>().unwrap(), Outcome::Timeout);
        assert!("Timeout".parse::<Outcome>().is_err());
    }

    mod proptest_scenario_laws {
        use super::*;
        use proptest::prelude::*;

        fn outcome_strategy() -> impl Strategy<Value = Outcome> {
            prop_oneof![
                Just(Outcome::Success),
                Just(Outcome::Failure),
                Just(Outcome::Timeout),
            ]
        }

        fn table_with(
            global: Option<(String, Outcome)>,
            branch: &str,
            default_result: Outcome,
            special: Option<(String, Outcome)>,
        ) -> ScenarioTable {
            let doc = ExpectationsDoc {
                global_scenarios: GlobalScenarios {
                    commit_patterns: global
                        .into_iter()
                        .map(|(pattern, expected_result)| CommitPattern {
                            pattern,
                            expected_result,
                            description: None,
                        })
                        .collect(),
                },
                branch_scenarios: BranchScenarios(vec![(
                    branch.to_string(),
                    BranchScenario {
                        default_result,
                        special_cases: special
                            .into_iter()
                            .map(|(commit_hash_prefix, expected_result)| SpecialCase {
                                commit_hash_prefix,
                                expected_result,
                                description: None,
                            })
                            .collect(),
                    },
                )]),
            };
            ScenarioTable::from_doc(&doc).unwrap()
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(300))]

            #[test]
            fn lookup_is_total(
                branch in "[a-z/*]{0,16}",
                commit in "[0-9a-f]{0,40}",
                message in ".{0,40}",
            ) {
                let table = ScenarioTable::builtin().unwrap();
                let outcome = table.expected_outcome(&branch, &commit, &message);
                prop_assert!(Outcome::ALL.contains(&outcome));
            }

            #[test]
            fn global_pattern_dominates_branch_rules(
                marker in "[A-Z]{3,8}",
                prefix in "[a-z ]{0,8}",
                suffix in "[a-z ]{0,8}",
                commit in "[0-9a-f]{8,40}",
                global in outcome_strategy(),
                default_result in outcome_strategy(),
                special in outcome_strategy(),
            ) {
                let table = table_with(
                    Some((format!("*{marker}*"), global)),
                    "main",
                    default_result,
                    Some((commit[..4].to_string(), special)),
                );
                let message = format!("{prefix}{marker}{suffix}");
                prop_assert_eq!(table.expected_outcome("main", &commit, &message), global);
            }

            #[test]
            fn matching_prefix_dominates_default(
                commit in "[0-9a-f]{8,40}",
                prefix_len in 1usize..8,
                default_result in outcome_strategy(),
                special in outcome_strategy(),
            ) {
                let table = table_with(
                    None,
                    "main",
                    default_result,
                    Some((commit[..prefix_len].to_string(), special)),
                );
                prop_assert_eq!(table.expected_outcome("main", &commit, "plain"), special);
            }
        }
    }
}
