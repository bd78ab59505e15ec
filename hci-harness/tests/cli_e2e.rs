//! Command-line tests for the `hci-e2e` binary's offline subcommands.

use std::path::Path;
use std::process::{Command, Output};

fn hci_e2e(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hci-e2e"))
        .args(args)
        .env_remove("HCI_LOG_FILE")
        .output()
        .expect("failed to run hci-e2e")
}

fn write_result(dir: &Path, name: &str, branch: &str, commit: &str, start: &str, end: &str) {
    let json = serde_json::json!({
        "branch": branch,
        "commit": commit,
        "log_file": format!("/logs/{name}.log"),
        "start_time": start,
        "end_time": end,
        "success": true,
        "timed_out": false,
    });
    std::fs::write(dir.join(name), json.to_string()).unwrap();
}

#[test]
fn expect_prints_the_matching_rule() {
    let out = hci_e2e(&[
        "expect",
        "--branch",
        "feature/test1",
        "--commit",
        "abcdef0123",
        "--message",
        "FAIL: injected failure",
    ]);
    assert!(out.status.success());
    let verdict: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(verdict["outcome"], "failure");
}

#[test]
fn analyze_exits_one_on_concurrency_violation() {
    let dir = tempfile::tempdir().unwrap();
    write_result(
        dir.path(),
        "20240501_100000_main_11111111.json",
        "main",
        "1111111111111111",
        "2024-05-01T10:00:00Z",
        "2024-05-01T10:00:20Z",
    );
    write_result(
        dir.path(),
        "20240501_100005_feature-test2_22222222.json",
        "feature/test2",
        "2222222222222222",
        "2024-05-01T10:00:05Z",
        "2024-05-01T10:00:15Z",
    );
    std::fs::write(dir.path().join("state.json"), r#"{"running_tests": []}"#).unwrap();

    let results = dir.path().display().to_string();
    let out = hci_e2e(&["analyze", "--results-dir", &results, "-n", "1"]);
    assert_eq!(out.status.code(), Some(1));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("VIOLATION"), "{text}");

    let out = hci_e2e(&["analyze", "--results-dir", &results, "-n", "2", "--json"]);
    assert_ne!(out.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["total_runs"], 2);
}

#[test]
fn analyze_of_empty_directory_is_neutral() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().display().to_string();
    let out = hci_e2e(&["analyze", "--results-dir", &results, "-n", "2"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn malformed_expectations_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("expectations.yaml");
    std::fs::write(&path, "global_scenarios: [not, a, map]\n").unwrap();
    let out = hci_e2e(&[
        "expect",
        "--branch",
        "main",
        "--commit",
        "00000000",
        "--message",
        "x",
        "--expectations",
        &path.display().to_string(),
    ]);
    assert!(!out.status.success());
}

#[test]
fn analyze_timeout_mode_accepts_hung_plain_commits() {
    let dir = tempfile::tempdir().unwrap();
    let json = serde_json::json!({
        "branch": "main",
        "commit": "3333333333333333",
        "success": false,
        "timed_out": true,
        "start_time": "2024-05-01T10:00:00Z",
        "end_time": "2024-05-01T10:00:30Z",
    });
    std::fs::write(
        dir.path().join("20240501_100000_main_33333333.json"),
        json.to_string(),
    )
    .unwrap();

    let results = dir.path().display().to_string();
    let out = hci_e2e(&["analyze", "--results-dir", &results, "-n", "2"]);
    assert_eq!(out.status.code(), Some(2));

    let out = hci_e2e(&["analyze", "--results-dir", &results, "-n", "2", "--timeout-mode"]);
    assert_eq!(out.status.code(), Some(0));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("(timeout mode)"), "{text}");
}
