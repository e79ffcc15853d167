//! Tests for the `simulate` command.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Config file with short timeouts so faulty runs finish quickly.
fn quick_config() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "connect_timeout_ms = 200").unwrap();
    writeln!(file, "execute_timeout_ms = 300").unwrap();
    writeln!(file, "status_timeout_ms = 200").unwrap();
    writeln!(file, "[retry]").unwrap();
    writeln!(file, "initial_delay_ms = 1").unwrap();
    writeln!(file, "max_delay_ms = 5").unwrap();
    file
}

/// Test that simulate shows its options.
#[test]
fn test_simulate_help() {
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("simulate").arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--cycles"))
        .stdout(predicate::str::contains("--fault-rate"))
        .stdout(predicate::str::contains("--scenario"))
        .stdout(predicate::str::contains("42")); // Default seed
}

/// Test a healthy run prints a summary.
#[test]
fn test_simulate_healthy_run() {
    let config = quick_config();
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("--config")
        .arg(config.path())
        .arg("simulate")
        .arg("--cycles")
        .arg("4")
        .arg("--scenario")
        .arg("falling");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Simulation finished: 4 cycles, 5 commands"))
        .stdout(predicate::str::contains("unverified: 0"))
        .stdout(predicate::str::contains("temp basal 0.00 U/h"));
}

/// Test the JSON summary.
#[test]
fn test_simulate_json_summary() {
    let config = quick_config();
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("--config")
        .arg(config.path())
        .arg("simulate")
        .arg("-n")
        .arg("4")
        .arg("--fault-rate")
        .arg("0.3")
        .arg("--json");

    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(summary["cycles"], 4);
    assert!(summary["commands"].as_u64().unwrap() >= 1);
}

/// Test that an out-of-range fault rate is rejected.
#[test]
fn test_simulate_rejects_bad_fault_rate() {
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("simulate").arg("--fault-rate").arg("1.5");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--fault-rate"));
}

/// Test that an unknown scenario is rejected by argument parsing.
#[test]
fn test_simulate_rejects_unknown_scenario() {
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("simulate").arg("--scenario").arg("hurricane");

    cmd.assert().failure().code(2);
}
