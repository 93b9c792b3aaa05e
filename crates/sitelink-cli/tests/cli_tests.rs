//! CLI tests, all against the in-memory fabric (`--dry-run`)

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::TempDir;

/// Command for the sitelink binary, isolated from any local configuration
fn cli_command(workdir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sitelink").expect("Failed to find sitelink binary");
    cmd.current_dir(workdir.path())
        .env_remove("SITELINK_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("devices"))
        .stdout(predicate::str::contains("hosts"))
        .stdout(predicate::str::contains("links"))
        .stdout(predicate::str::contains("pool"))
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_devices() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .args(["--dry-run", "devices"])
        .assert()
        .success()
        .stdout(predicate::str::contains("site"))
        .stdout(predicate::str::contains("RoyalBlue"))
        .stdout(predicate::str::contains("switch"))
        .stdout(predicate::str::contains("gf-glue"));
}

#[test]
fn test_empty_hosts_and_links() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .args(["--dry-run", "hosts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 hosts"));

    cli_command(&dir)
        .args(["--dry-run", "links", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_pool_commands() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .args(["--dry-run", "pool", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 idle ports"));

    cli_command(&dir)
        .args(["--dry-run", "pool", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Destroyed 0 port pairs"));
}

#[test]
fn test_demo_scenario() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .args(["--dry-run", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("h1 has 1 link(s)"))
        .stdout(predicate::str::contains("Topology has 2 link(s)"))
        .stdout(predicate::str::contains("Demo topology removed"));
}

#[test]
fn test_demo_with_config_file() {
    let dir = TempDir::new().unwrap();
    let mut file = std::fs::File::create(dir.path().join("sitelink.json")).unwrap();
    write!(
        file,
        r#"{{"pool": {{"name": "demo-pool"}}, "managers": {{"switch": {{"prefix": "br-"}}}}}}"#
    )
    .unwrap();

    cli_command(&dir)
        .args(["--dry-run", "--verbose", "demo", "--keep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<-> s1:"))
        .stdout(predicate::str::contains("br-s1").not())
        .stdout(predicate::str::contains("Demo topology removed").not());
}

#[test]
fn test_missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    cli_command(&dir)
        .args(["--dry-run", "--config", "missing.json", "devices"])
        .assert()
        .failure();
}
