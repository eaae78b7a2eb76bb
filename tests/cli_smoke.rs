use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn run_cli(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ideation"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env("RUST_LOG", "off")
        .env_remove("IDEATION_API_KEY")
        .output()
        .expect("failed to run ideation binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn slot_commands_round_trip_through_the_database() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cli.sqlite");

    let out = run_cli(&db, &["slot", "add", "--interval-minutes", "45", "--label", "nightly"]);
    assert!(out.status.success(), "slot add failed: {out:?}");
    assert_eq!(stdout(&out).trim(), "slot 1 created");

    let out = run_cli(&db, &["slot", "disable", "1"]);
    assert!(out.status.success());

    let out = run_cli(&db, &["slot", "list"]);
    assert!(out.status.success());
    let listing = stdout(&out);
    assert!(listing.contains("nightly"), "listing: {listing}");
    assert!(listing.contains("disabled"));
    assert!(listing.contains("every 45 min"));
}

#[test]
fn zero_interval_is_rejected() {
    let dir = tempdir().unwrap();
    let out = run_cli(&dir.path().join("cli.sqlite"), &["slot", "add", "--interval-minutes", "0"]);
    assert!(!out.status.success());
}

#[test]
fn credential_set_masks_the_key() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cli.sqlite");

    let out = run_cli(
        &db,
        &["credential", "set", "--provider", "openrouter", "--api-key", "sk-or-abcd1234"],
    );
    assert!(out.status.success(), "credential set failed: {out:?}");
    let printed = stdout(&out);
    assert!(printed.contains("****1234"));
    assert!(!printed.contains("sk-or-abcd1234"));

    let out = run_cli(&db, &["credential", "clear", "--provider", "openrouter"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("deactivated 1 openrouter"));
}

#[test]
fn empty_database_lists_nothing_and_unknown_session_fails() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cli.sqlite");

    let out = run_cli(&db, &["ideas", "list"]);
    assert!(out.status.success());
    assert!(stdout(&out).trim().is_empty());

    let out = run_cli(&db, &["logs", "no-such-session"]);
    assert!(!out.status.success());
}
