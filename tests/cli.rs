//! CLI integration tests. stdout is not a TTY here, so output is JSON.

use assert_cmd::Command;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("decksync.db")
    }

    fn source(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("decksync").unwrap();
        cmd.env_remove("DECKSYNC_TEST_DB")
            .env_remove("RUST_LOG")
            .env("DECKSYNC_ACTOR", "cli-test")
            .arg("--db")
            .arg(self.db());
        cmd
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.cmd().args(args).assert().success().get_output().stdout.clone();
        serde_json::from_slice(&output).unwrap()
    }
}

const SHEET: &str = r#"{
  "title": "Biology",
  "rows": [
    {"id": "r1", "fields": {"Question": "What is a cell?", "Answer": "The unit of life"}, "students": "Amy, Bob"},
    {"id": "r2", "fields": {"Question": "The {{c1::nucleus}} holds DNA"}, "students": "Amy"},
    {"id": "r3", "fields": {"Question": "Paused"}, "students": "Amy", "sync": false}
  ]
}"#;

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn registered(ws: &Workspace) {
    let source = ws.source("bio.json", SHEET);
    ws.json(&["init"]);
    ws.json(&["collection", "add", "bio", &path_arg(&source), "--students", "Amy,Bob"]);
}

#[test]
fn commands_fail_before_init() {
    let ws = Workspace::new();
    let output = ws
        .cmd()
        .args(["collection", "list"])
        .assert()
        .code(2)
        .get_output()
        .stderr
        .clone();
    let err: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(err["error"]["code"], "NOT_INITIALIZED");
}

#[test]
fn init_twice_requires_force() {
    let ws = Workspace::new();
    ws.json(&["init"]);
    ws.cmd().arg("init").assert().code(2);
    let out = ws.json(&["init", "--force"]);
    assert_eq!(out["recreated"], true);
}

#[test]
fn sync_run_creates_notes() {
    let ws = Workspace::new();
    registered(&ws);

    let batch = ws.json(&["sync", "run", "bio", "--yes"]);
    assert_eq!(batch["outcome"], "completed");
    let report = &batch["reports"][0];
    assert_eq!(report["status"], "completed");
    assert_eq!(report["created"], 3);
    assert_eq!(report["ignored"], 1);
    assert_eq!(report["remote_name"], "Biology");

    // Second run is a no-op
    let again = ws.json(&["sync", "run", "--yes"]);
    assert_eq!(again["reports"][0]["created"], 0);
    assert_eq!(again["reports"][0]["updated"], 0);

    let status = ws.json(&["sync", "status", "bio"]);
    let partitions = status["collections"][0]["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 2);
    assert_eq!(status["collections"][0]["recent_runs"].as_array().unwrap().len(), 2);
}

#[test]
fn dry_run_writes_nothing() {
    let ws = Workspace::new();
    registered(&ws);

    let batch = ws.json(&["--dry-run", "sync", "run", "bio"]);
    assert_eq!(batch["reports"][0]["status"], "dry_run");
    assert_eq!(batch["reports"][0]["created"], 3);

    let show = ws.json(&["collection", "show", "bio"]);
    assert_eq!(show["note_count"], 0);
}

#[test]
fn declined_purge_exits_with_code_9() {
    let ws = Workspace::new();
    registered(&ws);
    ws.json(&["sync", "run", "bio", "--yes"]);
    ws.json(&["student", "disable", "bio", "Bob"]);

    ws.cmd()
        .args(["sync", "run", "bio"])
        .write_stdin("n\n")
        .assert()
        .code(9);
    let show = ws.json(&["collection", "show", "bio"]);
    assert_eq!(show["note_count"], 3);

    let batch = ws.json(&["sync", "run", "bio", "--yes"]);
    assert_eq!(batch["reports"][0]["purged_partitions"][0], "Bob");
    let show = ws.json(&["collection", "show", "bio"]);
    assert_eq!(show["note_count"], 2);
}

#[test]
fn missing_source_is_reported_per_collection() {
    let ws = Workspace::new();
    ws.json(&["init"]);
    ws.json(&["collection", "add", "chem", "/nonexistent/chem.json"]);

    let batch = ws.json(&["sync", "run", "--yes"]);
    assert_eq!(batch["outcome"], "completed");
    assert_eq!(batch["reports"][0]["status"], "fetch_failed");
}

#[test]
fn student_missing_rejects_bad_toggle() {
    let ws = Workspace::new();
    registered(&ws);
    ws.cmd()
        .args(["student", "missing", "bio", "sometimes"])
        .assert()
        .code(4);
    let out = ws.json(&["student", "missing", "bio", "on"]);
    assert_eq!(out["include_missing"], true);
}
