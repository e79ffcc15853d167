//! Tests for the `config` command.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// Test that the default configuration is printed as TOML.
#[test]
fn test_config_prints_defaults() {
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.env_remove("DOSEPILOT_CONFIG").arg("config");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("max_queue_size = 64"))
        .stdout(predicate::str::contains("disconnect_policy = \"when_idle\""))
        .stdout(predicate::str::contains("[retry]"))
        .stdout(predicate::str::contains("[limits]"));
}

/// Test that a config file is merged over the defaults.
#[test]
fn test_config_file_is_loaded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_queue_size = 8").unwrap();
    writeln!(file, "disconnect_policy = \"after_each_command\"").unwrap();

    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("--config").arg(file.path()).arg("config");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("max_queue_size = 8"))
        .stdout(predicate::str::contains("after_each_command"));
}

/// Test that environment variables override the defaults.
#[test]
fn test_env_override() {
    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.env("DOSEPILOT_MAX_QUEUE_SIZE", "5").arg("config");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("max_queue_size = 5"));
}

/// Test that an invalid configuration is rejected.
#[test]
fn test_invalid_config_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_queue_size = 0").unwrap();

    let mut cmd = Command::cargo_bin("dosepilot").unwrap();
    cmd.arg("--config").arg(file.path()).arg("config");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("max_queue_size"));
}
