//! Scenario table lookups end to end (S1-S4), from YAML on disk.

use hci_common::scenario::{MatchedRule, Outcome, ScenarioError, ScenarioTable};
use hci_common::testing::init_test_logging;

const S1_EXPECTATIONS: &str = r#"
branch_scenarios:
  main:
    default_result: success
"#;

const GLOBAL_TIMEOUT: &str = r#"
global_scenarios:
  commit_patterns:
    - pattern: "*TIMEOUT*"
      expected_result: timeout
      description: "Stress commits time out"
branch_scenarios:
  main:
    default_result: success
"#;

const WILDCARD_ORDER: &str = r#"
branch_scenarios:
  "bugfix/*":
    default_result: failure
  "*":
    default_result: timeout
  release:
    default_result: success
    special_cases:
      - commit_hash_prefix: "dead"
        expected_result: failure
        description: "known bad build"
"#;

#[test]
fn s1_plain_main_commit_succeeds() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("expectations.yaml");
    std::fs::write(&path, S1_EXPECTATIONS).unwrap();

    let table = ScenarioTable::load(&path).unwrap();
    assert_eq!(
        table.expected_outcome("main", "a1b2c3d4e5f6", "Add foo"),
        Outcome::Success
    );
}

#[test]
fn s2_builtin_feature_test2_fails() {
    let table = ScenarioTable::builtin().unwrap();
    let verdict = table.explain("feature/test2", "0badc0de", "Progress");
    assert_eq!(verdict.outcome, Outcome::Failure);
    assert_eq!(
        verdict.rule,
        MatchedRule::BranchDefault {
            branch: "feature/test2".to_string()
        }
    );
}

#[test]
fn s3_global_timeout_pattern_wins_on_main() {
    let table = ScenarioTable::from_yaml_str(GLOBAL_TIMEOUT).unwrap();
    let verdict = table.explain("main", "a1b2c3d4", "TIMEOUT: stress");
    assert_eq!(verdict.outcome, Outcome::Timeout);
    assert!(matches!(verdict.rule, MatchedRule::GlobalPattern { index: 0, .. }));
}

#[test]
fn s4_wildcard_branch_applies_without_exact_key() {
    let table = ScenarioTable::builtin().unwrap();
    let verdict = table.explain("bugfix/xyz", "12345678", "fix");
    assert_eq!(verdict.outcome, Outcome::Failure);
    assert_eq!(
        verdict.rule,
        MatchedRule::WildcardBranch {
            pattern: "bugfix/*".to_string()
        }
    );
}

#[test]
fn wildcards_follow_document_order_and_exact_keys_win() {
    let table = ScenarioTable::from_yaml_str(WILDCARD_ORDER).unwrap();
    // Both "bugfix/*" and "*" match; the earlier key wins.
    assert_eq!(table.expected_outcome("bugfix/a", "00", "x"), Outcome::Failure);
    assert_eq!(table.expected_outcome("dev", "00", "x"), Outcome::Timeout);
    // "release" is exact, so "*" never applies to it.
    assert_eq!(table.expected_outcome("release", "beef", "x"), Outcome::Success);
    assert_eq!(table.expected_outcome("release", "deadbeef", "x"), Outcome::Failure);
}

#[test]
fn unknown_branch_without_wildcards_falls_back_to_success() {
    let table = ScenarioTable::from_yaml_str(S1_EXPECTATIONS).unwrap();
    let verdict = table.explain("topic/new", "ffff", "anything");
    assert_eq!(verdict.outcome, Outcome::Success);
    assert_eq!(verdict.rule, MatchedRule::Fallback);
}

#[test]
fn malformed_documents_fail_at_load() {
    let unknown_outcome = "branch_scenarios:\n  main:\n    default_result: flaky\n";
    assert!(matches!(
        ScenarioTable::from_yaml_str(unknown_outcome),
        Err(ScenarioError::Parse(_))
    ));

    let bad_glob = "global_scenarios:\n  commit_patterns:\n    - pattern: \"[\"\n      expected_result: failure\n";
    assert!(matches!(
        ScenarioTable::from_yaml_str(bad_glob),
        Err(ScenarioError::InvalidPattern { .. })
    ));

    let missing = std::path::Path::new("/nonexistent/expectations.yaml");
    assert!(matches!(
        ScenarioTable::load(missing),
        Err(ScenarioError::Io { .. })
    ));
}
