//! Smoke tests for the faultline binary.
//!
//! These exercise the operational CLI surface against a throwaway
//! database; nothing here needs network access or an API key.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn faultline() -> Command {
    cargo_bin_cmd!("faultline")
}

fn temp_db(dir: &TempDir) -> String {
    dir.path().join("faultline.db").display().to_string()
}

#[test]
fn test_help() {
    faultline().arg("--help").assert().success();
}

#[test]
fn test_version() {
    faultline().arg("--version").assert().success();
}

#[test]
fn test_status_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    faultline()
        .args(["--db", &temp_db(&dir), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("channel ai_analysis: depth=0 dead=0"));
}

#[test]
fn test_ingest_below_threshold_does_not_enqueue() {
    let dir = TempDir::new().unwrap();
    let db = temp_db(&dir);

    faultline()
        .args([
            "--db",
            &db,
            "ingest",
            "--project",
            "shop",
            "--message",
            "not found",
            "--status-code",
            "404",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("below analysis threshold"));

    faultline()
        .args(["--db", &db, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("depth=0"));
}

#[test]
fn test_ingest_severe_event_enqueues() {
    let dir = TempDir::new().unwrap();
    let db = temp_db(&dir);

    faultline()
        .args([
            "--db",
            &db,
            "ingest",
            "--project",
            "shop",
            "--message",
            "DB timeout",
            "--status-code",
            "500",
            "--stack",
            "at f (a.js:10:2)",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("analysis enqueued"));

    faultline()
        .args(["--db", &db, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("depth=1 dead=0"));
}

#[test]
fn test_enqueue_unknown_event_fails() {
    let dir = TempDir::new().unwrap();
    faultline()
        .args(["--db", &temp_db(&dir), "enqueue", "--event-id", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Event 42 not found"));
}

#[test]
fn test_requeue_dead_on_empty_queue() {
    let dir = TempDir::new().unwrap();
    faultline()
        .args(["--db", &temp_db(&dir), "requeue-dead"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Requeued 0 dead task(s)"));
}
