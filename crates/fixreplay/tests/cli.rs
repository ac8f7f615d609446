//! CLI contract tests for `fixreplay`.
//!
//! Runs the binary against a temp log directory and checks exit codes,
//! text output and the JSON schema of `--output json`.

use assert_cmd::Command;
use fixreplay_core::SequenceKey;
use fixreplay_core::frame::FrameView;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn fixreplay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fixreplay").expect("fixreplay binary");
    cmd.env_remove("RUST_LOG")
        .env_remove("FIXREPLAY_CONFIG")
        .env_remove("FIXREPLAY_LOG_DIR")
        .arg("--log-dir")
        .arg(dir.path())
        .arg("--log-level")
        .arg("warn");
    cmd
}

fn append(dir: &TempDir, session: &str, key: &str, body: &str) {
    fixreplay(dir)
        .args(["append", "--session", session, "--key", key, "--soh", "|", "--body", body])
        .assert()
        .success();
}

fn query_json(dir: &TempDir, args: &[&str]) -> serde_json::Value {
    let output = fixreplay(dir)
        .args(["query", "--output", "json"])
        .args(args)
        .output()
        .expect("run query");
    assert!(output.status.success(), "query failed: {output:?}");
    serde_json::from_slice(&output.stdout).expect("query json")
}

// =============================================================================
// append
// =============================================================================

#[test]
fn append_reports_position_and_index_outcome() {
    let dir = TempDir::new().unwrap();
    fixreplay(&dir)
        .args(["append", "-s", "7", "-k", "1:1", "--body", "35=A"])
        .assert()
        .success()
        .stdout(predicate::str::contains("key=1:1"))
        .stdout(predicate::str::contains("position=32"))
        .stdout(predicate::str::contains("index=indexed"));
}

#[test]
fn append_json_schema() {
    let dir = TempDir::new().unwrap();
    let output = fixreplay(&dir)
        .args(["append", "-s", "7", "-k", "1:1", "--body", "35=A", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["session_id"], 7);
    assert_eq!(value["position"], 32);
    assert_eq!(value["indexed"], true);
    assert_eq!(value["index_outcome"], "indexed");
}

#[test]
fn append_body_file() {
    let dir = TempDir::new().unwrap();
    let body = dir.path().join("body.fix");
    std::fs::write(&body, b"8=FIX.4.4\x0135=0\x01").unwrap();
    fixreplay(&dir)
        .args(["append", "-s", "1", "-k", "1:1", "--body-file"])
        .arg(&body)
        .assert()
        .success();

    let value = query_json(&dir, &["-s", "1"]);
    assert_eq!(value["messages"][0]["body"], "8=FIX.4.4|35=0|");
}

#[test]
fn out_of_order_append_fails_but_keeps_earlier_messages() {
    let dir = TempDir::new().unwrap();
    append(&dir, "1", "1:5", "34=5|");
    fixreplay(&dir)
        .args(["append", "-s", "1", "-k", "1:4", "--body", "34=4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not indexed"));

    let value = query_json(&dir, &["-s", "1"]);
    assert_eq!(value["delivered"], 1);
}

#[test]
fn malformed_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    fixreplay(&dir)
        .args(["append", "-s", "1", "-k", "12", "--body", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sequence index"));
}

// =============================================================================
// query
// =============================================================================

#[test]
fn query_replays_range_in_order() {
    let dir = TempDir::new().unwrap();
    for num in 1..=5 {
        append(&dir, "3", &format!("1:{num}"), &format!("34={num}|"));
    }

    let value = query_json(&dir, &["-s", "3", "--begin", "1:2", "--end", "1:4"]);
    assert_eq!(value["delivered"], 3);
    let numbers: Vec<u64> = value["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sequence_number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![2, 3, 4]);
}

#[test]
fn query_latest_crosses_sequence_reset() {
    let dir = TempDir::new().unwrap();
    append(&dir, "3", "1:1", "35=A|");
    append(&dir, "3", "1:2", "35=D|");
    append(&dir, "3", "2:1", "35=A|");

    fixreplay(&dir)
        .args(["query", "-s", "3", "--begin", "1:2", "--end", "latest"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1:2\t35=D|"))
        .stdout(predicate::str::contains("2:1\t35=A|"))
        .stdout(predicate::str::contains("2 message(s) replayed"));
}

#[test]
fn query_unknown_session_is_empty_and_succeeds() {
    let dir = TempDir::new().unwrap();
    fixreplay(&dir)
        .args(["query", "-s", "99"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 message(s) replayed"));
    assert!(!dir.path().join("replay-index-99-1").exists());
}

#[test]
fn query_hex_prints_whole_frames() {
    let dir = TempDir::new().unwrap();
    append(&dir, "3", "1:1", "A");
    let output = fixreplay(&dir)
        .args(["query", "-s", "3", "--output", "hex"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let line = stdout.lines().next().unwrap();
    // 32-byte header plus one body byte.
    assert_eq!(line.len(), 33 * 2);
    assert!(line.ends_with("41"));
    assert_eq!(line, line.to_ascii_lowercase());

    let frame = hex::decode(line).unwrap();
    let view = FrameView::parse(&frame).unwrap();
    assert_eq!(view.header.session_id, 3);
    assert_eq!(view.header.key, SequenceKey::new(1, 1));
    assert_eq!(view.body, b"A");
}

#[test]
fn stream_id_selects_separate_files() {
    let dir = TempDir::new().unwrap();
    append(&dir, "3", "1:1", "A");
    let value = query_json(&dir, &["--stream-id", "2", "-s", "3"]);
    assert_eq!(value["delivered"], 0);
}

// =============================================================================
// inspect and configuration
// =============================================================================

#[test]
fn inspect_lists_entries() {
    let dir = TempDir::new().unwrap();
    append(&dir, "5", "1:1", "a");
    append(&dir, "5", "1:2", "b");

    fixreplay(&dir)
        .args(["inspect", "-s", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 entries, latest 1:2"));

    let output = fixreplay(&dir)
        .args(["inspect", "-s", "5", "--output", "json"])
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["entries"].as_array().unwrap().len(), 2);
    assert_eq!(value["entries"][1]["key"]["sequence_number"], 2);
}

#[test]
fn config_file_is_honoured_and_flags_override_it() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fixreplay.toml");
    std::fs::write(
        &config,
        "stream_id = 4\nindex_file_size = 4096\narchive_file_size = 65536\n",
    )
    .unwrap();

    fixreplay(&dir)
        .arg("--config")
        .arg(&config)
        .args(["append", "-s", "1", "-k", "1:1", "--body", "x"])
        .assert()
        .success();
    assert!(dir.path().join("replay-index-1-4").exists());
    assert_eq!(
        std::fs::metadata(dir.path().join("replay-index-1-4")).unwrap().len(),
        4096
    );
}

#[test]
fn invalid_config_fails_with_message() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "cache_set_size = 0\n").unwrap();

    fixreplay(&dir)
        .arg("--config")
        .arg(&config)
        .args(["inspect", "-s", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cache_set_size"));
}

#[test]
fn corrupt_index_is_reported_with_failure_exit() {
    let dir = TempDir::new().unwrap();
    append(&dir, "8", "1:1", "a");
    let path = dir.path().join("replay-index-8-1");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[..8].copy_from_slice(b"GARBAGE!");
    std::fs::write(&path, bytes).unwrap();

    fixreplay(&dir)
        .args(["query", "-s", "8"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("storage faults reported"));
}
