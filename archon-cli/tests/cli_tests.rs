use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use archon_core::paths::request_path;
use archon_core::{Concern, EnvOverrides, FeatureId, Settings};

const SCRUBBED_ENV: &[&str] = &[
    "ARCHON_API_URL",
    "SPECKIT_ARCHON_STATE_DIR",
    "SPECKIT_ARCHON_DISABLED",
    "SPECKIT_ARCHON_CONFIG",
    "SPECKIT_ARCHON_LOG",
    "RUST_LOG",
];

struct Workspace {
    dir: TempDir,
    feature_dir: PathBuf,
}

impl Workspace {
    fn new(config: Option<&str>) -> Self {
        let dir = TempDir::new().expect("workspace");
        fs::create_dir_all(dir.path().join(".specify")).expect("mkdir .specify");
        if let Some(config) = config {
            fs::write(dir.path().join(".specify/archon.yaml"), config).expect("config");
        }
        let feature_dir = dir.path().join("specs/001-user-login");
        fs::create_dir_all(&feature_dir).expect("mkdir feature");
        fs::write(feature_dir.join("spec.md"), "# User login\n\nSign in.\n").expect("spec");
        fs::write(feature_dir.join("tasks.md"), "- [ ] T001 Add form\n").expect("tasks");
        Self { dir, feature_dir }
    }

    fn configured() -> Self {
        Self::new(Some("api_url: http://127.0.0.1:9\n"))
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn state_root(&self) -> PathBuf {
        Settings::resolve_with(self.root(), &EnvOverrides::default(), None)
            .expect("resolve")
            .state_root
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("speckit-archon"));
        for key in SCRUBBED_ENV {
            cmd.env_remove(key);
        }
        cmd.env("HOME", self.root())
            .env("USERPROFILE", self.root())
            .env("XDG_CONFIG_HOME", self.root().join(".config"))
            .current_dir(self.root());
        cmd
    }
}

fn feature() -> FeatureId {
    FeatureId::parse("001-user-login").expect("feature id")
}

#[test]
fn emit_and_probe_are_silent_without_integration() {
    let ws = Workspace::new(None);

    for concern in ["init", "docs", "tasks", "status"] {
        ws.cmd()
            .arg("emit")
            .arg(concern)
            .arg(&ws.feature_dir)
            .assert()
            .success()
            .stdout(predicate::str::is_empty())
            .stderr(predicate::str::is_empty());
    }
    ws.cmd()
        .arg("probe")
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty());

    assert!(!ws.state_root().exists(), "no state may be created when unavailable");
}

#[test]
fn emit_is_silent_when_preconditions_are_missing() {
    let ws = Workspace::configured();

    ws.cmd()
        .args(["emit", "init"])
        .arg(ws.root().join("specs/002-missing"))
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty());

    for (arg, concern) in [("tasks", Concern::TaskSync), ("status", Concern::StatusPull)] {
        ws.cmd()
            .arg("emit")
            .arg(arg)
            .arg(&ws.feature_dir)
            .assert()
            .success()
            .stdout(predicate::str::is_empty())
            .stderr(predicate::str::is_empty());
        assert!(!request_path(&ws.state_root(), &feature(), concern).exists());
    }
}

#[test]
fn emit_init_queues_a_request_when_configured() {
    let ws = Workspace::configured();

    ws.cmd()
        .args(["emit", "init"])
        .arg(&ws.feature_dir)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty());

    let path = request_path(&ws.state_root(), &feature(), Concern::Init);
    let record = fs::read_to_string(&path).expect("pending init request");
    assert!(record.contains("User login"), "record: {record}");

    ws.cmd()
        .args(["queue", "list", "--json"])
        .assert()
        .success()
        .stdout(contains("\"pending\"").and(contains("001-user-login")));
}

#[test]
fn probe_explain_names_the_reason() {
    let ws = Workspace::new(None);
    ws.cmd()
        .args(["probe", "--explain"])
        .assert()
        .success()
        .stdout(contains("unavailable"));

    let ws = Workspace::configured();
    ws.cmd()
        .args(["probe", "--explain"])
        .assert()
        .success()
        .stdout(contains("available (http://127.0.0.1:9)"));
}

#[test]
fn store_set_then_get_round_trips_through_the_cli() {
    let ws = Workspace::configured();

    ws.cmd()
        .args(["store", "get", "001-user-login", "project"])
        .assert()
        .success()
        .stdout("\n");

    ws.cmd()
        .args(["store", "set", "001-user-login", "task", "task-42", "--key", "T001"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    ws.cmd()
        .args(["store", "get", "001-user-login", "task", "--key", "T001"])
        .assert()
        .success()
        .stdout("task-42\n");

    ws.cmd()
        .args(["store", "meta-set", "001-user-login", "spec.md", "2026-01-02T03:04:05Z"])
        .assert()
        .success();
    ws.cmd()
        .args(["store", "meta-get", "001-user-login", "spec.md"])
        .assert()
        .success()
        .stdout("2026-01-02T03:04:05Z\n");

    ws.cmd()
        .args(["store", "list", "--json"])
        .assert()
        .success()
        .stdout(contains("task-42").and(contains("T001")));
}

#[test]
fn store_rejects_invalid_feature_names() {
    let ws = Workspace::configured();
    ws.cmd()
        .args(["store", "get", "not-a-feature", "project"])
        .assert()
        .failure();
}

#[test]
fn queue_requeue_reports_missing_and_unknown_slots() {
    let ws = Workspace::configured();

    ws.cmd()
        .args(["queue", "requeue", "001-user-login", "init"])
        .assert()
        .success()
        .stdout(contains("no dead-lettered request"));

    ws.cmd()
        .args(["queue", "requeue", "001-user-login", "bogus"])
        .assert()
        .failure()
        .stderr(contains("unknown concern"));
}

#[test]
fn daemon_status_reports_not_running() {
    let ws = Workspace::configured();
    ws.cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}
