//! Binary-level checks for the `config` and `inspect` commands.

use session_engine::config::StorageConfig;
use session_engine::storage::{SessionDetails, Storage};
use session_engine::subscriptions::SubscriptionContext;
use std::fs;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_session-engine"))
        .env_remove("SESSION_ENGINE_CONFIG")
        .env_remove("SESSION_ENGINE_DATA_DIR")
        .args(args)
        .output()
        .expect("run session-engine")
}

#[test]
fn config_check_accepts_valid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    fs::write(
        &path,
        r#"
[sessions]
pipelines = 16

[[tenants.entries]]
name = "default"
namespace_root = "tenants/{user}"
scope = "user"
"#,
    )
    .unwrap();
    let out = run(&["config", "check", "--config", path.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("pipelines: 16"));
    assert!(stdout.contains("tenants: 1 user, 0 global"));
}

#[test]
fn config_check_rejects_zero_pipelines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    fs::write(&path, "[sessions]\npipelines = 0\n").unwrap();
    let out = run(&["config", "check", "--config", path.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("pipelines"));
}

#[test]
fn inspect_sessions_prints_persisted_details() {
    let dir = tempdir().unwrap();
    let storage = Storage::open(&StorageConfig {
        data_dir: Some(dir.path().to_path_buf()),
    })
    .unwrap();
    let mut details = SessionDetails::new("client/1", 7);
    details.persistent = true;
    details.expiry_secs = 60;
    details.subscriptions = vec![SubscriptionContext::new("s1", "room/1")];
    storage.sessions.put(&details).unwrap();

    let data_dir = dir.path().to_str().unwrap();
    let out = run(&["inspect", "sessions", "--data-dir", data_dir, "--format", "json"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let line = String::from_utf8(out.stdout).unwrap();
    let parsed: SessionDetails = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(parsed, details);

    let out = run(&["inspect", "wills", "--data-dir", data_dir]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("no pending wills"));
}

#[test]
fn inspect_requires_existing_directory() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing");
    let out = run(&["inspect", "sessions", "--data-dir", missing.to_str().unwrap()]);
    assert!(!out.status.success());
}
