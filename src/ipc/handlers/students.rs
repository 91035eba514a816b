use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_bool, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lastName": last.clone(),
                "firstName": first.clone(),
                "displayName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(3)? != 0,
                "sortOrder": r.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match parse_bool(req.params.get("active"), true) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("active {}", m), None),
    };

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            active as i64,
            next_sort,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = patch.get("lastName") {
        match parse_opt_string(Some(v)) {
            Ok(Some(s)) => {
                set_parts.push("last_name = ?".into());
                values.push(s.into());
            }
            _ => return err(&req.id, "bad_params", "lastName must be a string", None),
        }
    }
    if let Some(v) = patch.get("firstName") {
        match parse_opt_string(Some(v)) {
            Ok(Some(s)) => {
                set_parts.push("first_name = ?".into());
                values.push(s.into());
            }
            _ => return err(&req.id, "bad_params", "firstName must be a string", None),
        }
    }
    if let Some(v) = patch.get("active") {
        match v.as_bool() {
            Some(b) => {
                set_parts.push("active = ?".into());
                values.push((b as i64).into());
            }
            None => return err(&req.id, "bad_params", "active must be boolean", None),
        }
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!(
        "UPDATE students SET {} WHERE class_id = ? AND id = ?",
        set_parts.join(", ")
    );
    values.push(class_id.into());
    values.push(student_id.into());
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "updated": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
