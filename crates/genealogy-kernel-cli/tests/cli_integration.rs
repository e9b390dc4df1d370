use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_gk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_gk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute gk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_gk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "gk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
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

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

fn write_lines(path: &Path, lines: &[Value]) {
    let body = lines
        .iter()
        .map(|line| {
            serde_json::to_string(line)
                .unwrap_or_else(|err| panic!("failed to serialize fixture line: {err}"))
        })
        .collect::<Vec<_>>()
        .join("\n");
    write_file(path, &body);
}

fn point(x: f64) -> Value {
    json!({
        "position": { "x": x, "y": 0.0, "z": 0.0, "t": x },
        "momentum": { "x": 1.0, "y": 0.0, "z": 0.0, "t": 1.0 }
    })
}

fn step_line(from: f64, to: f64, process: &str) -> Value {
    json!({
        "kind": "step",
        "pre": point(from),
        "post": point(to),
        "process": process,
        "step_length": to - from,
        "time_delta": to - from,
        "velocity": 1.0
    })
}

fn end_line(x: f64, process: &str) -> Value {
    json!({
        "kind": "track_ended",
        "final_point": point(x),
        "process": process,
        "weight": 1.0
    })
}

/// One muon primary with a low-energy photoelectric daughter.
fn single_event_lines() -> Vec<Value> {
    vec![
        json!({
            "kind": "begin_event",
            "truth": [{ "generator": "single", "particle_count": 1 }]
        }),
        json!({
            "kind": "track_created",
            "track_id": 1,
            "parent_id": 0,
            "pdg_code": 13,
            "kinetic_energy": 1.0,
            "mass": 0.1057,
            "primary": { "truth_index": 0, "generated_index": 0, "process": "primary" }
        }),
        step_line(0.0, 1.0, "muIoni"),
        end_line(1.0, "Decay"),
        json!({
            "kind": "track_created",
            "track_id": 2,
            "parent_id": 1,
            "pdg_code": 11,
            "process": "phot",
            "kinetic_energy": 0.0005,
            "mass": 0.000511
        }),
        step_line(1.0, 1.5, "eIoni"),
        end_line(1.5, "eIoni"),
        json!({ "kind": "end_event" }),
    ]
}

#[test]
fn run_with_defaults_keeps_the_full_genealogy() {
    let dir = unique_temp_dir("gk-cli-defaults");
    let events = dir.join("events.ndjson");
    write_lines(&events, &single_event_lines());

    let payload = run_json(["run", "--events", path_str(&events)]);
    assert_eq!(payload["contract_version"], "gk.v1");

    let event = &payload["events"][0];
    let particles = event["particles"]
        .as_array()
        .unwrap_or_else(|| panic!("particles should be an array: {event}"));
    assert_eq!(particles.len(), 2);
    assert_eq!(particles[0]["track_id"], 1);
    assert_eq!(particles[0]["daughters"], json!([2]));
    assert_eq!(particles[1]["track_id"], 2);
    assert_eq!(particles[1]["parent_id"], 1);
    assert_eq!(event["ancestry"], json!({}));
    assert_eq!(event["associations"][0]["generated_index"], 0);
    assert_eq!(event["associations"][1]["generated_index"], Value::Null);
}

#[test]
fn run_with_shower_suppression_reparents_the_daughter() {
    let dir = unique_temp_dir("gk-cli-suppression");
    let events = dir.join("events.ndjson");
    write_lines(&events, &single_event_lines());
    let config = dir.join("config.json");
    write_file(&config, r#"{ "keep_em_shower_daughters": false }"#);

    let payload =
        run_json(["run", "--events", path_str(&events), "--config", path_str(&config)]);

    let event = &payload["events"][0];
    let particles = event["particles"]
        .as_array()
        .unwrap_or_else(|| panic!("particles should be an array: {event}"));
    assert_eq!(particles.len(), 1);
    assert_eq!(particles[0]["track_id"], 1);
    assert_eq!(event["ancestry"], json!({ "1": [2] }));
    assert_eq!(event["rejection_counts"]["phot"], 1);
}

#[test]
fn run_carries_the_track_id_offset_across_events() {
    let dir = unique_temp_dir("gk-cli-offset");
    let events = dir.join("events.ndjson");
    let mut lines = single_event_lines();
    lines.extend(single_event_lines());
    write_lines(&events, &lines);

    let payload = run_json(["run", "--events", path_str(&events)]);
    let events_out = payload["events"]
        .as_array()
        .unwrap_or_else(|| panic!("events should be an array: {payload}"));
    assert_eq!(events_out.len(), 2);
    assert_eq!(events_out[0]["particles"][0]["track_id"], 1);
    // The first event retained IDs 1 and 2, so the second event starts at 3.
    assert_eq!(events_out[1]["particles"][0]["track_id"], 4);
    assert_eq!(events_out[1]["particles"][1]["track_id"], 5);
}

#[test]
fn run_rejects_track_events_outside_an_open_event() {
    let dir = unique_temp_dir("gk-cli-unopened");
    let events = dir.join("events.ndjson");
    write_lines(&events, &[end_line(1.0, "Decay")]);

    let output = run_gk(["run", "--events", path_str(&events)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("outside an open event"), "unexpected stderr: {stderr}");
}

#[test]
fn run_rejects_an_unterminated_event() {
    let dir = unique_temp_dir("gk-cli-unterminated");
    let events = dir.join("events.ndjson");
    let mut lines = single_event_lines();
    lines.pop();
    write_lines(&events, &lines);

    let output = run_gk(["run", "--events", path_str(&events)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unterminated"), "unexpected stderr: {stderr}");
}

#[test]
fn config_default_prints_the_resolved_defaults() {
    let payload = run_json(["config", "default"]);
    assert_eq!(payload["contract_version"], "gk.v1");
    assert_eq!(payload["store_trajectories"], true);
    assert_eq!(payload["keep_em_shower_daughters"], true);
    assert_eq!(payload["energy_cut"], 0.0);
    assert_eq!(payload["not_stored_physics"], json!([]));
    assert_eq!(payload["sparsify_margin"], 0.015);
}
