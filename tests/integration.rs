//! Integration tests: run the redup binary against a memory-backed config; assert stdout NDJSON.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn redup_bin() -> String {
    std::env::var("CARGO_BIN_EXE_redup").unwrap_or_else(|_| {
        format!(
            "{}/target/debug/redup",
            std::env::var("CARGO_MANIFEST_DIR").unwrap()
        )
    })
}

fn write_config(name: &str, yaml: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("redup_integration_{name}"));
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("redup.yaml");
    std::fs::write(&path, yaml).expect("write config");
    path
}

fn run_with_stdin(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(redup_bin())
        .args(args)
        .env("REDUP_LOG_LEVEL", "error")
        .env_remove("REDUP_STORE_URL")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn redup");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait redup")
}

fn ndjson(output: &Output) -> Vec<serde_json::Value> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "redup failed: stdout={} stderr={}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).unwrap_or_else(|e| panic!("invalid NDJSON line {l:?}: {e}"))
        })
        .collect()
}

const EXPIRING: &str = r#"
global:
  log_level: error
store:
  backend: memory
strategy:
  type: expiring_key
  window_ms: 60000
"#;

#[test]
fn run_reports_repeats_as_duplicates() {
    let config = write_config("run_expiring", EXPIRING);
    let output = run_with_stdin(
        &["run", "--config", config.to_str().unwrap()],
        "Nairobi\nMombasa\n\nNairobi\n",
    );
    let records = ndjson(&output);
    assert_eq!(records.len(), 3, "blank lines are skipped: {records:?}");
    assert_eq!(records[0]["value"], "Nairobi");
    assert_eq!(records[0]["duplicate"], false);
    assert_eq!(records[1]["duplicate"], false);
    assert_eq!(records[2]["value"], "Nairobi");
    assert_eq!(records[2]["duplicate"], true);
    assert!(records[0]["ts"].as_str().unwrap().ends_with('Z'));
}

#[test]
fn run_drop_duplicates_echoes_unseen_lines() {
    let config = write_config("run_drop", EXPIRING);
    let output = run_with_stdin(
        &["run", "--config", config.to_str().unwrap(), "--drop-duplicates"],
        "a\nb\na\nc\nb\n",
    );
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "a\nb\nc\n");
}

#[test]
fn run_json_lines_ignore_key_order() {
    let config = write_config(
        "run_json_bloom",
        r#"
store: { backend: memory }
strategy: { type: bloom, filter_key: example_bf, capacity: 4, error_rate: 0.001 }
"#,
    );
    let output = run_with_stdin(
        &["run", "--config", config.to_str().unwrap(), "--json"],
        "{\"id\":1,\"msg\":\"hi\"}\n{\"msg\":\"hi\",\"id\":1}\nnot json\n",
    );
    let records = ndjson(&output);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["duplicate"], false);
    assert_eq!(records[0]["value"]["id"], 1);
    assert_eq!(records[1]["duplicate"], true);
    assert_eq!(records[2]["value"], "not json");
    assert!(records[2].get("duplicate").is_none());
    assert!(
        records[2]["error"]
            .as_str()
            .unwrap()
            .contains("invalid json line")
    );
}

#[test]
fn check_and_forget_with_cuckoo() {
    let config = write_config(
        "cuckoo",
        r#"
store: { backend: memory }
strategy: { type: cuckoo, filter_key: example_cf, capacity: 64, bucket_size: 4, window_ms: 15000 }
"#,
    );
    let path = config.to_str().unwrap();
    let records = ndjson(&run_with_stdin(&["check", "--config", path, "x", "x"], ""));
    assert_eq!(records[0]["duplicate"], false);
    assert_eq!(records[1]["duplicate"], true);

    // Each invocation starts with an empty memory store.
    let records = ndjson(&run_with_stdin(&["forget", "--config", path, "x"], ""));
    assert_eq!(records[0]["forgotten"], false);
}

#[test]
fn forget_is_rejected_by_expiring_strategy() {
    let config = write_config("forget_expiring", EXPIRING);
    let output = run_with_stdin(&["forget", "--config", config.to_str().unwrap(), "x"], "");
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("not supported"), "stdout={stdout}");
}

#[test]
fn validate_accepts_good_config() {
    let config = write_config("validate_ok", EXPIRING);
    let output = run_with_stdin(&["validate", "--config", config.to_str().unwrap()], "");
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn validate_rejects_window_below_minimum() {
    let config = write_config(
        "validate_window",
        "store: { backend: memory }\nstrategy: { type: expiring_key, window_ms: 4 }\n",
    );
    let output = run_with_stdin(&["validate", "--config", config.to_str().unwrap()], "");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_config_fails() {
    let output = run_with_stdin(&["check", "--config", "/nonexistent/redup.yaml", "x"], "");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("read config"));
}
