use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn one_slot_per_time_key_is_enforced_on_create_and_update() {
    let workspace = temp_dir("timetable-slot-dup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Music" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "09:00",
            "endTime": "10:30",
            "actorId": "op-1"
        }),
    );

    // Same key, spelled with an unpadded hour: still the same slot.
    let duplicate = request(
        &mut stdin,
        &mut reader,
        "4",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "9:00",
            "endTime": "10:30",
            "actorId": "op-1"
        }),
    );
    assert_eq!(duplicate.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&duplicate), "duplicate_slot");

    // A different start time is a different key.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "11:00",
            "endTime": "12:30",
            "actorId": "op-1"
        }),
    );
    let other_id = other
        .get("slotId")
        .and_then(|v| v.as_str())
        .expect("slotId")
        .to_string();

    // Rescheduling onto an occupied key is rejected.
    let collide = request(
        &mut stdin,
        &mut reader,
        "6",
        "slots.update",
        json!({
            "slotId": other_id.clone(),
            "patch": { "startTime": "09:00", "endTime": "10:30" },
            "actorId": "op-1"
        }),
    );
    assert_eq!(error_code(&collide), "duplicate_slot");

    // Rescheduling to a fresh key (or keeping your own key) is fine.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "slots.update",
        json!({
            "slotId": other_id.clone(),
            "patch": { "startTime": "11:30", "location": "Room 12" },
            "actorId": "op-1"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "slots.update",
        json!({
            "slotId": other_id.clone(),
            "patch": { "notes": "bring sheet music" },
            "actorId": "op-1"
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "slots.list",
        json!({ "classId": class_id.clone() }),
    );
    let slots = listed.get("slots").and_then(|v| v.as_array()).expect("slots");
    assert_eq!(slots.len(), 2);
    let moved = slots
        .iter()
        .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(other_id.as_str()))
        .expect("rescheduled slot");
    assert_eq!(moved.get("startTime").and_then(|v| v.as_str()), Some("11:30"));
    assert_eq!(moved.get("location").and_then(|v| v.as_str()), Some("Room 12"));
    assert_eq!(
        moved.get("notes").and_then(|v| v.as_str()),
        Some("bring sheet music")
    );

    let bad_times = request(
        &mut stdin,
        &mut reader,
        "10",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "10:00",
            "endTime": "09:00",
            "actorId": "op-1"
        }),
    );
    assert_eq!(error_code(&bad_times), "bad_params");

    let bad_weekday = request(
        &mut stdin,
        &mut reader,
        "11",
        "slots.create",
        json!({
            "classId": class_id,
            "weekday": 7,
            "startTime": "10:00",
            "endTime": "11:00",
            "actorId": "op-1"
        }),
    );
    assert_eq!(error_code(&bad_weekday), "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
