use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_gsync<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_gsync"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute gsync binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_gsync(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "gsync command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn records_of<'a>(pair: &'a Value, mirror: &str) -> &'a Vec<Value> {
    pair.get(mirror)
        .and_then(|found| found.get("records"))
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing `{mirror}.records` in payload: {pair}"))
}

/// Fresh database seeded with a club, one team under it and three team members.
fn seeded_db(prefix: &str) -> (PathBuf, PathBuf) {
    let dir = unique_temp_dir(prefix);
    let db = dir.join("groupsync.sqlite3");
    let fixture = dir.join("fixture.json");
    let body = serde_json::json!({
        "groups": [
            {"id": 1, "title": "Club"},
            {"id": 2, "title": "Gardeners", "description": "allotment team", "parent": 1}
        ],
        "members": [
            {"id": 10, "name": "Ada"},
            {"id": 11, "name": "Brook"},
            {"id": 12, "name": "Cy"}
        ],
        "memberships": [
            {"group": 2, "member": 10},
            {"group": 2, "member": 11},
            {"group": 2, "member": 12, "admin": true}
        ],
        "contacts": [
            {"id": 110, "member": 10},
            {"id": 111, "member": 11},
            {"id": 112, "member": 12}
        ]
    });
    fs::write(&fixture, body.to_string())
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", fixture.display()));

    let loaded = run_json(["--db", path_str(&db), "fixture", "load", "--in", path_str(&fixture)]);
    assert_eq!(loaded.get("memberships").and_then(Value::as_u64), Some(3));
    (dir, db)
}

#[test]
fn migrate_reports_versions_with_contract_version() {
    let dir = unique_temp_dir("gsync-migrate");
    let db = dir.join("groupsync.sqlite3");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert!(as_bool(&dry_run, "dry_run"));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert!(!as_bool(&applied, "dry_run"));
    assert_eq!(applied.get("after_version").and_then(Value::as_i64), Some(1));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert!(as_bool(&status, "up_to_date"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn paged_batch_mirrors_roster_and_admin_across_invocations() {
    let (dir, db) = seeded_db("gsync-batch");

    let mut finished = false;
    for _ in 0..10 {
        let report = run_json([
            "--db",
            path_str(&db),
            "batch",
            "step",
            "--id",
            "nightly",
            "--direction",
            "community-to-directory",
            "--page-size",
            "2",
        ]);
        assert_ne!(as_str(&report, "status"), "retry");
        if as_bool(&report, "finished") {
            finished = true;
            break;
        }
    }
    assert!(finished);

    let status = run_json(["--db", path_str(&db), "batch", "status", "--id", "nightly"]);
    assert!(!as_bool(&status, "active"));

    let pair = run_json(["--db", path_str(&db), "inspect", "pair", "--group", "2"]);
    assert!(as_bool(&pair, "linked"));
    assert_eq!(records_of(&pair, "membership").len(), 3);
    let access = records_of(&pair, "access");
    assert_eq!(access.len(), 1);
    assert_eq!(access[0].get("contact").and_then(Value::as_u64), Some(112));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn zero_page_size_is_rejected_for_interactive_steps() {
    let (dir, db) = seeded_db("gsync-zero-page");

    let output = run_gsync([
        "--db",
        path_str(&db),
        "batch",
        "step",
        "--id",
        "nightly",
        "--direction",
        "community-to-directory",
        "--page-size",
        "0",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("page size 0"), "unexpected stderr: {stderr}");

    let unpaged = run_json([
        "--db",
        path_str(&db),
        "batch",
        "run",
        "--id",
        "nightly",
        "--direction",
        "community-to-directory",
    ]);
    assert_eq!(as_str(&unpaged, "status"), "finished");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn demotion_soft_deletes_the_access_record() {
    let (dir, db) = seeded_db("gsync-demote");

    run_json(["--db", path_str(&db), "sync", "group", "--group", "2"]);
    let promoted =
        run_json(["--db", path_str(&db), "sync", "promote", "--group", "2", "--member", "12"]);
    assert!(as_bool(&promoted, "access_changed"));

    let demoted =
        run_json(["--db", path_str(&db), "sync", "demote", "--group", "2", "--member", "12"]);
    assert!(as_bool(&demoted, "access_changed"));
    assert!(!as_bool(&demoted, "membership_changed"));

    let pair = run_json(["--db", path_str(&db), "inspect", "pair", "--group", "2"]);
    let access = records_of(&pair, "access");
    assert_eq!(access.len(), 1);
    assert_eq!(access[0].get("status").and_then(Value::as_str), Some("Removed"));
    let membership = records_of(&pair, "membership");
    assert_eq!(membership[0].get("status").and_then(Value::as_str), Some("Added"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn removing_an_admin_revokes_access_whatever_role_is_reported() {
    let (dir, db) = seeded_db("gsync-remove-admin");

    run_json(["--db", path_str(&db), "sync", "group", "--group", "2"]);
    for member in ["10", "11", "12"] {
        let role = if member == "12" { "admin" } else { "member" };
        run_json([
            "--db",
            path_str(&db),
            "sync",
            "member",
            "--group",
            "2",
            "--member",
            member,
            "--action",
            "add",
            "--role",
            role,
        ]);
    }

    let removed = run_json([
        "--db",
        path_str(&db),
        "sync",
        "member",
        "--group",
        "2",
        "--member",
        "12",
        "--action",
        "remove",
    ]);
    assert!(as_bool(&removed, "membership_changed"));
    assert!(as_bool(&removed, "access_changed"));

    let pair = run_json(["--db", path_str(&db), "inspect", "pair", "--group", "2"]);
    let access = records_of(&pair, "access");
    assert_eq!(access.len(), 1);
    assert_eq!(access[0].get("status").and_then(Value::as_str), Some("Removed"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn previous_role_is_rejected_for_removals() {
    let (dir, db) = seeded_db("gsync-remove-previous-role");

    run_json(["--db", path_str(&db), "sync", "group", "--group", "2"]);
    let output = run_gsync([
        "--db",
        path_str(&db),
        "sync",
        "member",
        "--group",
        "2",
        "--member",
        "12",
        "--action",
        "remove",
        "--previous-role",
        "admin",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--previous-role"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn mirror_originated_events_are_suppressed() {
    let (dir, db) = seeded_db("gsync-event");

    let outcome = run_json([
        "--db",
        path_str(&db),
        "sync",
        "event",
        "--json",
        r#"{"origin":"mirror","type":"group_created","group":2}"#,
    ]);
    assert_eq!(as_str(&outcome, "result"), "suppressed");

    let missing = run_gsync(["--db", path_str(&db), "inspect", "pair", "--group", "2"]);
    assert!(!missing.status.success());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn config_file_overrides_access_title_suffix() {
    let (dir, db) = seeded_db("gsync-config");
    let config = dir.join("sync.yaml");
    fs::write(&config, "access_title_suffix: \" (admins)\"\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));

    run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "sync",
        "group",
        "--group",
        "2",
    ]);

    let pair = run_json(["--db", path_str(&db), "inspect", "pair", "--group", "2"]);
    let title = pair
        .get("access")
        .and_then(|found| found.get("group"))
        .and_then(|group| group.get("title"))
        .and_then(Value::as_str);
    assert_eq!(title, Some("Gardeners (admins)"));

    let _ = fs::remove_dir_all(&dir);
}
