//! Integration tests for the CLI interface

use assert_cmd::Command;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use predicates::prelude::*;
use tempfile::TempDir;

fn jwt_with_exp(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
    format!("{}.{}.sig", header, payload)
}

fn rostersync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rostersync").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("ROSTERSYNC_TOKEN")
        .env_remove("ROSTERSYNC_DATABASE_URL")
        .env_remove("ROSTERSYNC_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .env("ROSTERSYNC_DATA_DIR", dir.path().join("data"));
    cmd
}

#[test]
fn test_cli_help_flag() {
    let temp = TempDir::new().unwrap();
    rostersync(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("check-token"));
}

#[test]
fn test_invalid_command() {
    let temp = TempDir::new().unwrap();
    rostersync(&temp)
        .arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_check_token_rejects_expired_jwt() {
    let temp = TempDir::new().unwrap();
    rostersync(&temp)
        .env("ROSTERSYNC_TOKEN", jwt_with_exp(1_600_000_000))
        .arg("check-token")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("expired"));
}

#[test]
fn test_check_token_reports_expiry() {
    let temp = TempDir::new().unwrap();
    let exp = chrono::Utc::now().timestamp() + 7 * 24 * 3600;
    rostersync(&temp)
        .env("ROSTERSYNC_TOKEN", jwt_with_exp(exp))
        .arg("check-token")
        .assert()
        .success()
        .stdout(predicate::str::contains("Token valid until"));
}

#[test]
fn test_run_without_token_fails_before_any_request() {
    let temp = TempDir::new().unwrap();
    rostersync(&temp)
        .arg("run")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no bearer token configured"))
        .stdout(predicate::str::contains("Authentication with the remote API failed"));
    assert!(!temp.path().join("data").join("runs").exists());
}

#[test]
fn test_status_on_empty_store() {
    let temp = TempDir::new().unwrap();
    rostersync(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No completed run yet."));
}

#[test]
fn test_invalid_config_file_exits_with_config_status() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("rostersync.toml"), "[enricher]\nworkers = 0\n").unwrap();
    rostersync(&temp)
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("workers"));
}
