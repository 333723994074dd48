//! CLI smoke tests. The binary's real work requires a database and an
//! OpenRouter credential, so only the argument-parsing surface is
//! exercised here; `tests/repository.rs` covers the persistence layer
//! against a real Postgres instance.

use std::process::Command;

use assert_cmd::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("compression-tasker").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}
