#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn hopper(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("hopper").unwrap();
    cmd.current_dir(dir.path())
        .env("HOPPER_CONFIG", dir.path().join("hopper.yaml"));
    cmd
}

fn init_config(dir: &TempDir) {
    hopper(dir).args(["config", "init"]).assert().success();
}

// ---------------------------------------------------------------------------
// hopper config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_defaults() {
    let dir = TempDir::new().unwrap();
    hopper(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let raw = std::fs::read_to_string(dir.path().join("hopper.yaml")).unwrap();
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(value["database"]["kind"].as_str(), Some("sqlite"));
    assert_eq!(value["server"]["port"].as_u64(), Some(5000));
}

#[test]
fn config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    hopper(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    hopper(&dir).args(["config", "init", "--force"]).assert().success();
}

#[test]
fn config_check_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    hopper(&dir)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings"));
}

#[test]
fn config_check_rejects_unknown_database() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hopper.yaml"), "database:\n  kind: postgres\n").unwrap();
    hopper(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stdout(predicate::str::contains("postgres"));
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();
    hopper(&dir)
        .args(["inbox", "list", "T1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

// ---------------------------------------------------------------------------
// hopper inbox
// ---------------------------------------------------------------------------

#[test]
fn inbox_add_moves_files_into_topic() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "first").unwrap();
    std::fs::write(&b, "second").unwrap();

    hopper(&dir)
        .args(["inbox", "add", "T1"])
        .arg(&a)
        .arg(&b)
        .assert()
        .success();

    assert!(!a.exists());
    assert!(!b.exists());

    let output = hopper(&dir)
        .args(["--json", "inbox", "list", "T1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["count"], 2);
    let files = json["files"].as_array().unwrap();
    let first = dir
        .path()
        .join("master_inbox/T1")
        .join(files[0].as_str().unwrap());
    assert_eq!(std::fs::read_to_string(first).unwrap(), "first");
}

#[test]
fn inbox_add_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    hopper(&dir)
        .args(["inbox", "add", "T1", "nope.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn inbox_list_without_topic_shows_counts() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    let a = dir.path().join("a.txt");
    std::fs::write(&a, "x").unwrap();
    hopper(&dir).args(["inbox", "add", "T1"]).arg(&a).assert().success();

    hopper(&dir)
        .args(["inbox", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TOPIC"))
        .stdout(predicate::str::contains("T1"));
}

#[test]
fn inbox_rejects_unsafe_topic() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    let a = dir.path().join("a.txt");
    std::fs::write(&a, "x").unwrap();
    hopper(&dir)
        .args(["inbox", "add", "../up"])
        .arg(&a)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid topic"));
    assert!(a.exists());
}

// ---------------------------------------------------------------------------
// hopper registration
// ---------------------------------------------------------------------------

#[test]
fn registration_add_list_remove() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);

    let output = hopper(&dir)
        .args([
            "--json",
            "registration",
            "add",
            "T1",
            "busybox",
            "--threshold",
            "3",
            "--timeout",
            "30",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let created: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["threshold"], 3);
    assert!(dir.path().join("hopper.db").exists());

    hopper(&dir)
        .args(["registration", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("busybox"))
        .stdout(predicate::str::contains("30"));

    hopper(&dir)
        .args(["registration", "add", "T1", "busybox"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    hopper(&dir)
        .args(["registration", "remove", &id.to_string()])
        .assert()
        .success();

    hopper(&dir)
        .args(["registration", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No registrations."));

    hopper(&dir)
        .args(["registration", "remove", &id.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("registration not found"));
}

#[test]
fn registration_add_rejects_oversized_timeout() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    hopper(&dir)
        .args(["registration", "add", "T1", "busybox", "--timeout"])
        .arg(u64::MAX.to_string())
        .assert()
        .failure()
        .stderr(predicate::str::contains("exceeds the maximum"));
    hopper(&dir)
        .args(["registration", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No registrations."));
}

// ---------------------------------------------------------------------------
// hopper user
// ---------------------------------------------------------------------------

#[test]
fn user_add_and_list() {
    let dir = TempDir::new().unwrap();
    init_config(&dir);
    hopper(&dir)
        .args(["user", "add", "admin", "--password", "pw"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added user 'admin'"));
    hopper(&dir)
        .args(["user", "add", "admin"])
        .env("HOPPER_PASSWORD", "other")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    let output = hopper(&dir).args(["--json", "user", "list"]).output().unwrap();
    assert!(output.status.success());
    let users: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(users, serde_json::json!(["admin"]));
}
