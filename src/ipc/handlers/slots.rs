use crate::consolidate;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_bool, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_weekday(v: Option<&serde_json::Value>) -> Result<i64, &'static str> {
    let raw = v.and_then(|v| v.as_i64()).ok_or("missing weekday")?;
    if !(0..=6).contains(&raw) {
        return Err("weekday must be 0 (Sunday) through 6 (Saturday)");
    }
    Ok(raw)
}

fn time_key_taken(
    conn: &Connection,
    class_id: &str,
    weekday: i64,
    start: &str,
    end: &str,
    exclude_slot: Option<&str>,
) -> Result<bool, rusqlite::Error> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM recurring_slots
             WHERE class_id = ? AND weekday = ? AND start_time = ? AND end_time = ?
             LIMIT 1",
            (class_id, weekday, start, end),
            |r| r.get(0),
        )
        .optional()?;
    Ok(match taken {
        Some(id) => exclude_slot != Some(id.as_str()),
        None => false,
    })
}

fn handle_slots_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weekday = match parse_weekday(req.params.get("weekday")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let start_raw = match required_str(req, "startTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_raw = match required_str(req, "endTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(start_time) = schedule::normalize_time_hhmm(&start_raw) else {
        return err(&req.id, "bad_params", "startTime must be HH:MM", None);
    };
    let Some(end_time) = schedule::normalize_time_hhmm(&end_raw) else {
        return err(&req.id, "bad_params", "endTime must be HH:MM", None);
    };
    if end_time <= start_time {
        return err(&req.id, "bad_params", "endTime must be after startTime", None);
    }
    let location = match parse_opt_string(req.params.get("location")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("location {}", m), None),
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
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

    match time_key_taken(conn, &class_id, weekday, &start_time, &end_time, None) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_slot",
                "a slot already exists for this class, weekday, and time",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let slot_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO recurring_slots(
             id, class_id, weekday, start_time, end_time, location, notes,
             created_by, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            &class_id,
            weekday,
            &start_time,
            &end_time,
            &location,
            &notes,
            &actor_id,
            schedule::now_iso(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "recurring_slots" })),
        );
    }

    ok(&req.id, json!({ "slotId": slot_id }))
}

fn handle_slots_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, weekday, start_time, end_time, location, notes, created_at
         FROM recurring_slots
         WHERE class_id = ?
         ORDER BY weekday, start_time, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let slots: Vec<(String, i64, String, String, Option<String>, Option<String>, String)> =
        match stmt
            .query_map([&class_id], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

    let mut out = Vec::with_capacity(slots.len());
    for (id, weekday, start_time, end_time, location, notes, created_at) in slots {
        let teachers = match list_slot_teachers(conn, &id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        out.push(json!({
            "id": id,
            "weekday": weekday,
            "startTime": start_time,
            "endTime": end_time,
            "location": location,
            "notes": notes,
            "createdAt": created_at,
            "teachers": teachers
        }));
    }

    ok(&req.id, json!({ "slots": out }))
}

fn list_slot_teachers(
    conn: &Connection,
    slot_id: &str,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT teacher_id, assigned_at, assigned_by
         FROM slot_teachers
         WHERE slot_id = ?
         ORDER BY assigned_at, teacher_id",
    )?;
    stmt.query_map([slot_id], |r| {
        Ok(json!({
            "teacherId": r.get::<_, String>(0)?,
            "assignedAt": r.get::<_, String>(1)?,
            "assignedBy": r.get::<_, Option<String>>(2)?
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn handle_slots_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let current: Option<(String, i64, String, String)> = match conn
        .query_row(
            "SELECT class_id, weekday, start_time, end_time FROM recurring_slots WHERE id = ?",
            [&slot_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, cur_weekday, cur_start, cur_end)) = current else {
        return err(&req.id, "not_found", "slot not found", None);
    };

    let weekday = match patch.get("weekday") {
        Some(v) => match parse_weekday(Some(v)) {
            Ok(w) => w,
            Err(m) => return err(&req.id, "bad_params", m, None),
        },
        None => cur_weekday,
    };
    let start_time = match patch.get("startTime").and_then(|v| v.as_str()) {
        Some(raw) => match schedule::normalize_time_hhmm(raw) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "startTime must be HH:MM", None),
        },
        None => cur_start,
    };
    let end_time = match patch.get("endTime").and_then(|v| v.as_str()) {
        Some(raw) => match schedule::normalize_time_hhmm(raw) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "endTime must be HH:MM", None),
        },
        None => cur_end,
    };
    if end_time <= start_time {
        return err(&req.id, "bad_params", "endTime must be after startTime", None);
    }

    match time_key_taken(
        conn,
        &class_id,
        weekday,
        &start_time,
        &end_time,
        Some(slot_id.as_str()),
    ) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_slot",
                "a slot already exists for this class, weekday, and time",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // A pure time/location edit only touches the slot row; occurrences carry
    // their own dates and keep pointing at this slot.
    let mut set_parts: Vec<&str> = vec!["weekday = ?", "start_time = ?", "end_time = ?"];
    let mut values: Vec<rusqlite::types::Value> = vec![
        weekday.into(),
        start_time.clone().into(),
        end_time.clone().into(),
    ];
    if patch.contains_key("location") {
        let location = match parse_opt_string(patch.get("location")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("location {}", m), None),
        };
        set_parts.push("location = ?");
        values.push(match location {
            Some(s) => s.into(),
            None => rusqlite::types::Value::Null,
        });
    }
    if patch.contains_key("notes") {
        let notes = match parse_opt_string(patch.get("notes")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
        };
        set_parts.push("notes = ?");
        values.push(match notes {
            Some(s) => s.into(),
            None => rusqlite::types::Value::Null,
        });
    }
    values.push(slot_id.clone().into());
    let sql = format!(
        "UPDATE recurring_slots SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "updated": true }))
}

fn handle_slots_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cascade = match parse_bool(req.params.get("cascade"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("cascade {}", m), None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM recurring_slots WHERE id = ?", [&slot_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "slot not found", None);
    }

    let occurrence_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM occurrences WHERE slot_id = ?",
        [&slot_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if occurrence_count > 0 && !cascade {
        return err(
            &req.id,
            "slot_in_use",
            "occurrences still reference this slot",
            Some(json!({ "occurrenceCount": occurrence_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records
         WHERE occurrence_id IN (SELECT id FROM occurrences WHERE slot_id = ?)",
        [&slot_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM occurrences WHERE slot_id = ?", [&slot_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "occurrences" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM slot_teachers WHERE slot_id = ?", [&slot_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "slot_teachers" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM recurring_slots WHERE id = ?", [&slot_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "recurring_slots" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

fn handle_assign_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM recurring_slots WHERE id = ?", [&slot_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "slot not found", None);
    }

    // Re-assigning the same teacher is a no-op, not an error.
    let added = match conn.execute(
        "INSERT OR IGNORE INTO slot_teachers(slot_id, teacher_id, assigned_at, assigned_by)
         VALUES(?, ?, ?, ?)",
        (&slot_id, &teacher_id, schedule::now_iso(), &actor_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "slot_teachers" })),
            )
        }
    };

    ok(&req.id, json!({ "added": added > 0 }))
}

fn handle_remove_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let removed = match conn.execute(
        "DELETE FROM slot_teachers WHERE slot_id = ? AND teacher_id = ?",
        (&slot_id, &teacher_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "removed": removed > 0 }))
}

fn handle_list_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM recurring_slots WHERE id = ?", [&slot_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "slot not found", None);
    }

    match list_slot_teachers(conn, &slot_id) {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_consolidate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match consolidate::consolidate_slots(conn, &actor_id) {
        Ok(report) => ok(
            &req.id,
            serde_json::to_value(report).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "slots.create" => Some(handle_slots_create(state, req)),
        "slots.list" => Some(handle_slots_list(state, req)),
        "slots.update" => Some(handle_slots_update(state, req)),
        "slots.delete" => Some(handle_slots_delete(state, req)),
        "slots.assignTeacher" => Some(handle_assign_teacher(state, req)),
        "slots.removeTeacher" => Some(handle_remove_teacher(state, req)),
        "slots.teachers" => Some(handle_list_teachers(state, req)),
        "slots.consolidate" => Some(handle_consolidate(state, req)),
        _ => None,
    }
}
