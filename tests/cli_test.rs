//! Command-line tests for the localhttps binary
//!
//! Usage errors must exit non-zero before any certificate is written.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run_cli(certs_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_localhttps"))
        .args(args)
        .env("LOCALHTTPS_CERTS_DIR", certs_dir)
        .env_remove("LOCALHTTPS_HOST")
        .env_remove("LOCALHTTPS_LISTEN")
        .output()
        .unwrap()
}

#[test]
fn test_too_many_args() {
    let dir = tempdir().unwrap();
    let certs_dir = dir.path().join("certs");

    let output = run_cli(&certs_dir, &["8000", "9000"]);

    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
    assert!(output.stdout.is_empty());
    assert!(!certs_dir.exists());
}

#[test]
fn test_malformed_listen() {
    let dir = tempdir().unwrap();
    let certs_dir = dir.path().join("certs");

    let output = run_cli(&certs_dir, &["-listen=not-an-address"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not-an-address"));
    assert!(!certs_dir.exists());
}

#[test]
fn test_help_lists_examples() {
    let dir = tempdir().unwrap();
    let output = run_cli(dir.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--listen"));
    assert!(stdout.contains("-host=foo.dev 9000"));
}
