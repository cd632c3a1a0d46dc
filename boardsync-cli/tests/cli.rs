use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::{json, Value};
use tempfile::TempDir;

const TOKEN_ENV: &str = "BOARDSYNC_TEST_TOKEN";

fn boardsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("boardsync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove(TOKEN_ENV)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

/// Config, task file and mapping under one temp dir. The API URL points at a
/// closed local port so nothing leaves the machine.
fn workspace(mapping: Option<Value>) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("workspace");
    let tasks_dir = dir.path().join("tasks");
    fs::create_dir_all(&tasks_dir).expect("tasks dir");
    fs::write(
        tasks_dir.join("tasks.json"),
        serde_json::to_string_pretty(&json!({
            "tasks": [
                { "id": 1, "title": "One", "status": "pending" },
                { "id": 2, "title": "Two", "status": "done" }
            ]
        }))
        .expect("serialize tasks"),
    )
    .expect("write tasks");

    if let Some(mapping) = mapping {
        let mapping_dir = tasks_dir.join(".boardsync");
        fs::create_dir_all(&mapping_dir).expect("mapping dir");
        fs::write(
            mapping_dir.join("mappings.json"),
            serde_json::to_string_pretty(&mapping).expect("serialize mapping"),
        )
        .expect("write mapping");
    }

    let config = dir.path().join("config.yaml");
    fs::write(
        &config,
        format!(
            "board_id: \"b1\"\n\
             groups: [backlog]\n\
             api_url: http://127.0.0.1:9/v2\n\
             api_token_env: {TOKEN_ENV}\n\
             tasks_file: tasks/tasks.json\n\
             columns:\n  local_id: text_local\n  status: status\n\
             retry: {{ attempts: 1, initial_delay_ms: 0 }}\n"
        ),
    )
    .expect("write config");
    (dir, config)
}

fn mapping_for_one(last_synced_at: i64) -> Value {
    json!({
        "version": 1,
        "lastSyncAt": last_synced_at,
        "mappings": [
            { "localId": "1", "remoteId": "9001", "lastSyncedAt": last_synced_at }
        ]
    })
}

#[test]
fn status_prints_mapping_table_and_unmapped_ids() {
    let now = chrono::Utc::now().timestamp_millis();
    let (dir, config) = workspace(Some(mapping_for_one(now)));

    boardsync_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("board b1"))
        .stdout(contains("9001"))
        .stdout(contains("not on the board: 2"));
}

#[test]
fn status_json_lists_mappings_and_unmapped() {
    let now = chrono::Utc::now().timestamp_millis();
    let (dir, config) = workspace(Some(mapping_for_one(now)));

    let output = boardsync_cmd(dir.path())
        .args(["status", "--json", "--config"])
        .arg(&config)
        .output()
        .expect("run status");
    assert!(output.status.success(), "status failed: {output:?}");

    let report: Value = serde_json::from_slice(&output.stdout).expect("status JSON");
    assert_eq!(report["mappings"][0]["localId"], "1");
    assert_eq!(report["mappings"][0]["remoteId"], "9001");
    assert_eq!(report["unmapped"], json!(["2"]));
    assert_eq!(report["dangling"], json!([]));
}

#[test]
fn status_without_mapping_file_suggests_first_sync() {
    let (dir, config) = workspace(None);

    boardsync_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("No mappings yet"));
}

#[test]
fn missing_required_key_is_named() {
    let dir = TempDir::new().expect("workspace");
    let config = dir.path().join("config.yaml");
    fs::write(
        &config,
        "tasks_file: tasks.json\ncolumns:\n  local_id: text_local\n",
    )
    .expect("write config");

    boardsync_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("board_id"));
}

#[test]
fn default_config_location_is_under_home() {
    let home = TempDir::new().expect("home");

    boardsync_cmd(home.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains(".boardsync").and(contains("config.yaml")));
}

#[test]
fn prune_dry_run_counts_without_removing() {
    let (dir, config) = workspace(Some(mapping_for_one(0)));
    let mapping_path = dir.path().join("tasks/.boardsync/mappings.json");
    let before = fs::read(&mapping_path).expect("read mapping");

    boardsync_cmd(dir.path())
        .args(["prune", "--max-age-days", "30", "--dry-run", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("[dry-run] would remove 1 mapping(s)"));

    assert_eq!(fs::read(&mapping_path).expect("reread mapping"), before);
}

#[test]
fn prune_removes_stale_entries() {
    let (dir, config) = workspace(Some(mapping_for_one(0)));

    boardsync_cmd(dir.path())
        .args(["prune", "--max-age-days", "30", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("removed 1 mapping(s)"));

    let raw = fs::read_to_string(dir.path().join("tasks/.boardsync/mappings.json"))
        .expect("read mapping");
    let mapping: Value = serde_json::from_str(&raw).expect("mapping JSON");
    assert_eq!(mapping["mappings"], json!([]));
}

#[test]
fn push_without_token_names_the_env_var() {
    let (dir, config) = workspace(None);
    let tasks_before = fs::read(dir.path().join("tasks/tasks.json")).expect("read tasks");

    boardsync_cmd(dir.path())
        .args(["push", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains(format!("${TOKEN_ENV}")));

    assert_eq!(
        fs::read(dir.path().join("tasks/tasks.json")).expect("reread tasks"),
        tasks_before
    );
}

#[test]
fn pull_force_and_skip_conflicts_are_exclusive() {
    let (dir, config) = workspace(None);

    boardsync_cmd(dir.path())
        .args(["pull", "--force", "--skip-conflicts", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("cannot be used with"));
}
