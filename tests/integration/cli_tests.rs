//! Command-line tests for the `leaktrace` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

const FIXTURE_KEY: &str = "5d2f1c3e-7a41-4c8e-9b0a-2f6d1e3c4b5a";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// The binary, run from an empty directory so no stray config is picked up
fn leaktrace(cwd: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("leaktrace").unwrap();
    cmd.current_dir(cwd.path()).env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_analyze_prints_trace() {
    let dir = TempDir::new().unwrap();
    leaktrace(&dir)
        .arg("analyze")
        .arg(fixture("activity_leak.json"))
        .args(["--key", FIXTURE_KEY])
        .assert()
        .success()
        .stdout(predicate::str::contains("Leak found:"))
        .stdout(predicate::str::contains("com.example.MainActivity"))
        .stdout(predicate::str::contains("com.example.Registry.ref"));
}

#[test]
fn test_analyze_json() {
    let dir = TempDir::new().unwrap();
    let output = leaktrace(&dir)
        .args(["--format", "json", "analyze"])
        .arg(fixture("activity_leak.json"))
        .args(["--key", FIXTURE_KEY])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["outcome"], "leak");
    assert_eq!(json["leak_found"], true);
    assert_eq!(json["class_name"], "com.example.MainActivity");
    assert_eq!(json["ignored_retained_size"], 4160);
}

#[test]
fn test_json_written_to_output_file() {
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");
    leaktrace(&dir)
        .args(["--format", "json", "--output"])
        .arg(&report)
        .arg("analyze")
        .arg(fixture("activity_leak.json"))
        .args(["--key", FIXTURE_KEY, "--no-parallel"])
        .assert()
        .success();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["trace"]["elements"].as_array().unwrap().len(), 3);
}

#[test]
fn test_false_alarm_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    leaktrace(&dir)
        .arg("analyze")
        .arg(fixture("cleared_reference.json"))
        .args(["--key", FIXTURE_KEY])
        .assert()
        .success()
        .stdout(predicate::str::contains("No leak:"));
}

#[test]
fn test_missing_snapshot_fails() {
    let dir = TempDir::new().unwrap();
    leaktrace(&dir)
        .args(["analyze", "missing.json", "--key", FIXTURE_KEY])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Analysis failed"));
}

#[test]
fn test_config_rule_excludes_the_leak() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".leaktrace.toml"),
        r#"
[[exclusions.rules]]
reason = "registry entries are released on logout"
matcher = { type = "instance_field", class = "com.example.Registry", field = "ref" }
"#,
    )
    .unwrap();

    let output = leaktrace(&dir)
        .args(["--format", "json", "analyze"])
        .arg(fixture("activity_leak.json"))
        .args(["--key", FIXTURE_KEY])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["leak_found"], false);
    assert_eq!(json["excluded_leak"], true);
}

#[test]
fn test_rules_lists_builtin_exclusions() {
    let dir = TempDir::new().unwrap();
    leaktrace(&dir)
        .arg("rules")
        .assert()
        .success()
        .stdout(predicate::str::contains("android.text.TextLine#sCached"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("broken.toml");
    std::fs::write(&config, "[watch\ngrace_period_ms = ").unwrap();
    leaktrace(&dir)
        .arg("--config")
        .arg(&config)
        .arg("rules")
        .assert()
        .failure();
}

#[test]
fn test_completions() {
    let dir = TempDir::new().unwrap();
    leaktrace(&dir)
        .args(["--completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("leaktrace"));
}
