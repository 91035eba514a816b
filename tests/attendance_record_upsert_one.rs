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

#[test]
fn recording_twice_replaces_the_record_in_place() {
    let workspace = temp_dir("timetable-attendance-upsert");
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
        json!({ "name": "History" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id.clone(), "lastName": "Nguyen", "firstName": "Minh" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let slot = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "11:00",
            "endTime": "12:00",
            "actorId": "op-1"
        }),
    );
    let slot_id = slot
        .get("slotId")
        .and_then(|v| v.as_str())
        .expect("slotId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "occurrences.generate",
        json!({
            "slotIds": [slot_id.clone()],
            "startDate": "2025-03-03",
            "endDate": "2025-03-03",
            "actorId": "op-1"
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "occurrences.list",
        json!({ "slotId": slot_id }),
    );
    let occurrence_id = listed
        .get("occurrences")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("occurrence id")
        .to_string();

    // Present sets a check-in stamp.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({
            "occurrenceId": occurrence_id.clone(),
            "studentId": student_id.clone(),
            "status": "present",
            "actorId": "t-dana"
        }),
    );
    assert!(first
        .get("checkedInAt")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false));

    // The second call updates the same row; absent clears the check-in.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.record",
        json!({
            "occurrenceId": occurrence_id.clone(),
            "studentId": student_id.clone(),
            "status": "absent",
            "notes": "called in sick after class",
            "actorId": "t-dana"
        }),
    );
    assert!(second
        .get("checkedInAt")
        .map(|v| v.is_null())
        .unwrap_or(false));

    let matrix = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.matrix",
        json!({ "classId": class_id }),
    );
    let students = matrix
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 1);
    let row = &students[0];
    let cells = row.get("cells").and_then(|v| v.as_array()).expect("cells");
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].get("status").and_then(|v| v.as_str()), Some("absent"));
    assert_eq!(
        cells[0].get("notes").and_then(|v| v.as_str()),
        Some("called in sick after class")
    );
    assert!(cells[0]
        .get("checkedInAt")
        .map(|v| v.is_null())
        .unwrap_or(false));
    let counts = row.get("counts").expect("counts");
    assert_eq!(counts.get("present").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(counts.get("absent").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get("recorded").and_then(|v| v.as_i64()), Some(1));

    let missing = request(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.record",
        json!({
            "occurrenceId": "no-such-occurrence",
            "studentId": student_id.clone(),
            "status": "present",
            "actorId": "t-dana"
        }),
    );
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.record",
        json!({
            "occurrenceId": occurrence_id,
            "studentId": student_id,
            "status": "tardy",
            "actorId": "t-dana"
        }),
    );
    assert_eq!(
        bad_status
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("invalid_status")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
