use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, AttendanceStatus, BatchEntry};
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<schedule::SchedError> for HandlerErr {
    fn from(e: schedule::SchedError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key)))?
                .trim()
                .to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let occurrence_id = get_required_str(params, "occurrenceId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status_raw = get_required_str(params, "status")?;
    let actor_id = get_required_str(params, "actorId")?;
    let notes = get_opt_str(params, "notes")?;

    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr {
            code: "invalid_status".to_string(),
            message: format!("unrecognized status: {}", status_raw),
            details: None,
        });
    };

    let outcome = schedule::record_attendance(
        conn,
        &occurrence_id,
        &student_id,
        status,
        notes.as_deref(),
        &actor_id,
    )?;
    Ok(serde_json::to_value(outcome).unwrap_or_else(|_| json!({})))
}

fn attendance_record_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let occurrence_id = get_required_str(params, "occurrenceId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };

    let mut entries = Vec::with_capacity(entries_json.len());
    for item in entries_json {
        // Shape errors become per-entry failures downstream; only a
        // non-object entry is rejected up front.
        if !item.is_object() {
            return Err(HandlerErr::bad_params("entries must be objects"));
        }
        entries.push(BatchEntry {
            student_id: item
                .get("studentId")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string(),
            status_raw: item
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string(),
            notes: item
                .get("notes")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        });
    }

    let report = schedule::record_attendance_batch(conn, &occurrence_id, &entries, &actor_id)?;
    Ok(serde_json::to_value(report).unwrap_or_else(|_| json!({})))
}

fn attendance_matrix(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let matrix = schedule::attendance_matrix(conn, &class_id)?;
    Ok(serde_json::to_value(matrix).unwrap_or_else(|_| json!({})))
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_record_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record_batch(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_matrix(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_matrix(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.recordBatch" => Some(handle_attendance_record_batch(state, req)),
        "attendance.matrix" => Some(handle_attendance_matrix(state, req)),
        _ => None,
    }
}
