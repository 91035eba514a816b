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
fn rate_counts_only_recorded_occurrences() {
    let workspace = temp_dir("timetable-matrix-rates");
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
        json!({ "name": "Literature" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let with_records = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id.clone(), "lastName": "Haddad", "firstName": "Lina" }),
    );
    let recorded_student = with_records
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let without_records = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id.clone(), "lastName": "Petrov", "firstName": "Ivan" }),
    );
    let unrecorded_student = without_records
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let slot = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "slots.create",
        json!({
            "classId": class_id.clone(),
            "weekday": 1,
            "startTime": "09:00",
            "endTime": "10:00",
            "actorId": "op-1"
        }),
    );
    let slot_id = slot
        .get("slotId")
        .and_then(|v| v.as_str())
        .expect("slotId")
        .to_string();

    // Four Mondays: 2025-03-03, 10, 17, 24.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "occurrences.generate",
        json!({
            "slotIds": [slot_id.clone()],
            "startDate": "2025-03-01",
            "endDate": "2025-03-28",
            "actorId": "op-1"
        }),
    );
    assert_eq!(report.get("created").and_then(|v| v.as_u64()), Some(4));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "occurrences.list",
        json!({ "slotId": slot_id }),
    );
    let occurrence_ids: Vec<String> = listed
        .get("occurrences")
        .and_then(|v| v.as_array())
        .expect("occurrences")
        .iter()
        .map(|o| {
            o.get("id")
                .and_then(|v| v.as_str())
                .expect("occurrence id")
                .to_string()
        })
        .collect();
    assert_eq!(occurrence_ids.len(), 4);

    for (i, status) in ["present", "present", "absent", "late"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("8-{}", i),
            "attendance.record",
            json!({
                "occurrenceId": occurrence_ids[i].clone(),
                "studentId": recorded_student.clone(),
                "status": status,
                "actorId": "t-dana"
            }),
        );
    }

    let matrix = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.matrix",
        json!({ "classId": class_id }),
    );
    let occurrences = matrix
        .get("occurrences")
        .and_then(|v| v.as_array())
        .expect("occurrence headers");
    assert_eq!(occurrences.len(), 4);
    let students = matrix
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 2);

    let lina = students
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(recorded_student.as_str()))
        .expect("recorded student row");
    let counts = lina.get("counts").expect("counts");
    assert_eq!(counts.get("present").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(counts.get("late").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(counts.get("absent").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(counts.get("excused").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(counts.get("sick").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(lina.get("recorded").and_then(|v| v.as_i64()), Some(4));
    // (2 present + 1 late) / 4 recorded.
    assert_eq!(lina.get("rate").and_then(|v| v.as_i64()), Some(75));
    let cells = lina.get("cells").and_then(|v| v.as_array()).expect("cells");
    let cell_dates: Vec<&str> = cells
        .iter()
        .map(|c| c.get("date").and_then(|v| v.as_str()).expect("date"))
        .collect();
    assert_eq!(
        cell_dates,
        vec!["2025-03-03", "2025-03-10", "2025-03-17", "2025-03-24"]
    );

    // No records at all: rate 0, never a division error, cells all null.
    let ivan = students
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(unrecorded_student.as_str()))
        .expect("unrecorded student row");
    assert_eq!(ivan.get("recorded").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(ivan.get("rate").and_then(|v| v.as_i64()), Some(0));
    let ivan_cells = ivan.get("cells").and_then(|v| v.as_array()).expect("cells");
    assert_eq!(ivan_cells.len(), 4);
    for cell in ivan_cells {
        assert!(cell.get("status").map(|v| v.is_null()).unwrap_or(false));
    }

    let missing_class = request(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.matrix",
        json!({ "classId": "no-such-class" }),
    );
    assert_eq!(
        missing_class
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
