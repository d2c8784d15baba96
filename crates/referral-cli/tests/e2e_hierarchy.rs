//! E2E CLI tests for the `refer` binary.
//!
//! Each test runs `refer` as a subprocess against a store in an isolated temp
//! directory and checks exit codes, human output, and the JSON contract.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn db_path(dir: &Path) -> PathBuf {
    dir.join("referral.db")
}

/// Build a Command targeting the refer binary with a private store.
fn refer_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("refer"));
    cmd.current_dir(dir);
    cmd.arg("--db").arg(db_path(dir));
    cmd.env_remove("REFERRAL_DB");
    cmd.env("REFERRAL_LOG", "error");
    cmd
}

fn run_ok(dir: &Path, args: &[&str]) {
    refer_cmd(dir).args(args).assert().success();
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let output = refer_cmd(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("refer should not crash");
    assert!(
        output.status.success(),
        "refer {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("--json should produce valid JSON")
}

/// A -> B -> C -> D -> E
fn seed_line(dir: &Path) {
    run_ok(dir, &["register", "A"]);
    for (sponsor, user) in [("A", "B"), ("B", "C"), ("C", "D"), ("D", "E")] {
        run_ok(dir, &["add", sponsor, user]);
    }
}

fn roots(upline: &Value) -> Vec<(String, u64)> {
    upline["ancestors"]
        .as_array()
        .expect("ancestors array")
        .iter()
        .map(|row| {
            (
                row["root_user_id"].as_str().expect("root").to_string(),
                row["level"].as_u64().expect("level"),
            )
        })
        .collect()
}

fn pairs(expected: &[(&str, u64)]) -> Vec<(String, u64)> {
    expected.iter().map(|(id, l)| ((*id).to_string(), *l)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn register_then_add_reports_placement() {
    let dir = TempDir::new().expect("temp dir");
    refer_cmd(dir.path())
        .args(["register", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("registered alice"));

    let placed = run_json(dir.path(), &["add", "alice", "bob"]);
    assert_eq!(placed["user_id"], "bob");
    assert_eq!(placed["parent_user_id"], "alice");
    assert_eq!(placed["rewritten"], 1);
}

#[test]
fn move_rewrites_chains_visible_through_upline() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());

    let moved = run_json(dir.path(), &["move", "C", "A"]);
    assert_eq!(moved["subtree_size"], 3);

    let upline = run_json(dir.path(), &["upline", "E"]);
    assert_eq!(upline["parent_user_id"], "D");
    assert_eq!(roots(&upline), pairs(&[("D", 1), ("C", 2), ("A", 3)]));

    refer_cmd(dir.path())
        .args(["verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("consistent"));
}

#[test]
fn cycle_is_rejected_with_exit_code_two() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());

    refer_cmd(dir.path())
        .args(["move", "A", "E"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("E2003"))
        .stderr(predicate::str::contains("hint:"));

    let upline = run_json(dir.path(), &["upline", "A"]);
    assert!(upline["parent_user_id"].is_null());
}

#[test]
fn json_errors_carry_code_on_stderr() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    run_ok(dir.path(), &["register", "X"]);
    run_ok(dir.path(), &["assign", "X", "B"]);

    let output = refer_cmd(dir.path())
        .args(["assign", "X", "C", "--json"])
        .output()
        .expect("refer should not crash");
    assert_eq!(output.status.code(), Some(2));
    let err: Value = serde_json::from_slice(&output.stderr).expect("error JSON");
    assert_eq!(err["error"]["error_code"], "E2002");
    assert!(
        err["error"]["message"]
            .as_str()
            .expect("message")
            .contains("'B'")
    );
}

#[test]
fn unknown_user_is_not_found() {
    let dir = TempDir::new().expect("temp dir");
    refer_cmd(dir.path())
        .args(["upline", "ghost"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("E2001"));
}

#[test]
fn can_add_and_is_descendant_answer_yes_no() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    run_ok(dir.path(), &["register", "X"]);

    refer_cmd(dir.path())
        .args(["can-add", "E", "X"])
        .assert()
        .success()
        .stdout("yes\n");
    refer_cmd(dir.path())
        .args(["can-add", "E", "A"])
        .assert()
        .success()
        .stdout("no\n");

    let deep = run_json(dir.path(), &["is-descendant", "A", "E"]);
    assert_eq!(deep["is_descendant"], true);
}

#[test]
fn promote_reparents_children_and_records_actor() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());

    let summary = run_json(dir.path(), &["promote", "C", "--by", "support"]);
    assert_eq!(summary["new_parent_id"], "B");
    assert_eq!(summary["promoted"], serde_json::json!(["D"]));

    let upline = run_json(dir.path(), &["upline", "D"]);
    assert_eq!(roots(&upline), pairs(&[("B", 1), ("A", 2)]));
    assert_eq!(upline["ancestors"][0]["updated_by"], "support");

    refer_cmd(dir.path())
        .args(["upline", "C"])
        .assert()
        .code(2);
}

#[test]
fn tree_renders_and_reports_truncation() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    run_ok(dir.path(), &["add", "A", "B2"]);

    refer_cmd(dir.path())
        .args(["tree", "A"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("A [2 direct, 4 below]"))
        .stdout(predicate::str::contains("└── B2"))
        .stdout(predicate::str::contains("more below"));

    let tree = run_json(dir.path(), &["tree", "A", "--max-level", "1"]);
    assert_eq!(tree["metadata"]["total_nodes"], 3);
    assert_eq!(tree["metadata"]["is_complete"], false);
    assert_eq!(tree["root"]["children"][0]["user_id"], "B");
}

#[test]
fn downlines_list_direct_referrals() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    run_ok(dir.path(), &["add", "A", "B2"]);

    let downlines = run_json(dir.path(), &["downlines", "A"]);
    let ids: Vec<&str> = downlines
        .as_array()
        .expect("array")
        .iter()
        .map(|n| n["user_id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["B", "B2"]);
    assert_eq!(downlines[0]["direct_referrals"], 1);
}

#[test]
fn verify_flags_corruption_and_rebuild_repairs_it() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    {
        let conn = rusqlite::Connection::open(db_path(dir.path())).expect("open db");
        conn.execute("DELETE FROM referral_closure WHERE referred_user_id = 'E'", [])
            .expect("corrupt");
    }

    refer_cmd(dir.path())
        .args(["verify"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("'E' is missing level 1 row for 'D'"))
        .stderr(predicate::str::contains("E3002"));

    let rebuilt = run_json(dir.path(), &["rebuild"]);
    assert_eq!(rebuilt["rows_written"], 1 + 2 + 3 + 3);
    let report = run_json(dir.path(), &["verify"]);
    assert!(report["violations"].as_array().expect("violations").is_empty());
    assert!(report["last_rebuild_at_us"].as_i64().is_some_and(|at| at > 0));
}

#[test]
fn verify_reports_never_rebuilt() {
    let dir = TempDir::new().expect("temp dir");
    seed_line(dir.path());
    refer_cmd(dir.path())
        .args(["verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("never"));
}

#[test]
fn blank_user_id_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    refer_cmd(dir.path())
        .args(["register", "  "])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("E2004"));
}

#[test]
fn config_commission_schedule_is_stamped() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::write(
        dir.path().join("referral.toml"),
        "[commission]\nlevels = [20.0, 7.5]\n",
    )
    .expect("write config");
    run_ok(dir.path(), &["register", "A"]);
    run_ok(dir.path(), &["add", "A", "B"]);
    run_ok(dir.path(), &["add", "B", "C"]);

    let upline = run_json(dir.path(), &["upline", "C"]);
    assert_eq!(upline["ancestors"][0]["commission_percent"], 20.0);
    assert_eq!(upline["ancestors"][1]["commission_percent"], 7.5);
}

#[test]
fn unreadable_config_exits_one() {
    let dir = TempDir::new().expect("temp dir");
    refer_cmd(dir.path())
        .args(["--config", "missing.toml", "verify"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("E1001"));
}
