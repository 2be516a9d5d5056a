use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn glyco_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_glyco"))
}

fn glyco_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(glyco_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run glyco command {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("glyco-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn write_schedule_file(label: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("glyco-contract-{label}-{}.json", Ulid::new()));
    let contents = r#"{"items":[{"start_offset":0.0,"value":1.2},{"start_offset":21600.0,"value":1.4},{"start_offset":72000.0,"value":1.0}]}"#;
    if let Err(err) = std::fs::write(&path, contents) {
        panic!("failed to write schedule fixture: {err}");
    }
    path
}

#[test]
fn override_help_contract_lists_expected_subcommands() {
    let output = match Command::new(glyco_binary_path())
        .args(["override", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["enable", "disable", "resolve", "show", "wipe"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn enable_show_disable_wipe_history_contract_is_stable_v1() {
    let db_path = temp_db_path("history");

    let output = glyco_output(
        &db_path,
        &[
            "override",
            "enable",
            "--start",
            "2026-03-02T02:00:00Z",
            "--duration-hours",
            "3",
            "--scale-factor",
            "1.5",
        ],
    );
    assert!(
        output.status.success(),
        "enable failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], "override_history.v1");
    assert_eq!(payload["event_count"], 1);
    assert_eq!(payload["skipped_records"], 0);
    assert_eq!(
        payload["events"][0]["override"]["start_date"],
        "2026-03-02T02:00:00Z"
    );
    assert!(payload["events"][0].get("end_date").is_none());

    let output = glyco_output(
        &db_path,
        &["override", "disable", "--at", "2026-03-02T04:00:00Z"],
    );
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["event_count"], 1);
    assert_eq!(
        payload["events"][0]["end_date"],
        "2026-03-02T04:00:00Z"
    );

    let output = glyco_output(&db_path, &["override", "show"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], "override_history.v1");
    assert_eq!(payload["event_count"], 1);

    let output = glyco_output(&db_path, &["override", "wipe"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(payload["event_count"], 0);
    assert_eq!(payload["events"], Value::Array(vec![]));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn resolve_contract_splices_override_into_baseline() {
    let db_path = temp_db_path("resolve");
    let schedule_path = write_schedule_file("resolve");

    let output = glyco_output(
        &db_path,
        &[
            "override",
            "enable",
            "--start",
            "2026-03-02T02:00:00Z",
            "--duration-hours",
            "3",
            "--scale-factor",
            "1.5",
        ],
    );
    assert!(output.status.success());

    let schedule_arg = match schedule_path.to_str() {
        Some(value) => value,
        None => panic!("temp schedule path must be valid UTF-8"),
    };
    let output = glyco_output(
        &db_path,
        &[
            "override",
            "resolve",
            "--schedule",
            schedule_arg,
            "--kind",
            "basal",
            "--at",
            "2026-03-02T05:00:00Z",
        ],
    );
    assert!(
        output.status.success(),
        "resolve failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], "resolved_schedule.v1");
    assert_eq!(payload["kind"], "basal");
    assert_eq!(payload["reference_date"], "2026-03-02T05:00:00Z");

    let items = match payload["schedule"]["items"].as_array() {
        Some(value) => value,
        None => panic!("resolved payload missing schedule items"),
    };
    assert_eq!(items.len(), 5);
    assert_eq!(items[1]["start_offset"], 7200.0);
    let overridden_value = match items[1]["value"].as_f64() {
        Some(value) => value,
        None => panic!("resolved item value must be a number"),
    };
    assert!((overridden_value - 1.8).abs() < 1e-9);

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&schedule_path);
}

#[test]
fn resolve_with_missing_schedule_file_fails_cleanly() {
    let db_path = temp_db_path("missing-schedule");

    let output = glyco_output(
        &db_path,
        &[
            "override",
            "resolve",
            "--schedule",
            "/nonexistent/glyco-schedule.json",
            "--kind",
            "basal",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to read schedule file"),
        "unexpected stderr: {stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
