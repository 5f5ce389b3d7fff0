//! Integration tests for the ephemera-reaper command line.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_options() {
    Command::cargo_bin("ephemera-reaper")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen"))
        .stdout(predicate::str::contains("--reconnection-timeout"))
        .stdout(predicate::str::contains("--orphan-min-age"))
        .stdout(predicate::str::contains("--orphan-sweep-attempts"));
}

#[test]
fn test_rejects_malformed_durations() {
    Command::cargo_bin("ephemera-reaper")
        .unwrap()
        .args(["--sweep-interval", "soon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn test_rejects_malformed_listen_address() {
    Command::cargo_bin("ephemera-reaper")
        .unwrap()
        .args(["--listen", "not-an-address"])
        .assert()
        .failure();
}
