use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_opt_string, parse_required_string_array, required_str};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use serde_json::json;

fn handle_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_ids = match parse_required_string_array(req.params.get("slotIds"), "slotIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_raw = match required_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_raw = match required_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(start) = schedule::parse_iso_date(&start_raw) else {
        return err(&req.id, "bad_params", "startDate must be YYYY-MM-DD", None);
    };
    let Some(end) = schedule::parse_iso_date(&end_raw) else {
        return err(&req.id, "bad_params", "endDate must be YYYY-MM-DD", None);
    };

    match schedule::generate_occurrences(conn, &slot_ids, start, end, &actor_id) {
        Ok(report) => ok(
            &req.id,
            serde_json::to_value(report).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_create_adhoc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_raw = match required_str(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(date) = schedule::parse_iso_date(&date_raw) else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };

    match schedule::create_adhoc_occurrence(conn, &slot_id, date, &actor_id, notes.as_deref()) {
        Ok(occurrence_id) => ok(&req.id, json!({ "occurrenceId": occurrence_id })),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let class_id = match parse_opt_string(req.params.get("classId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("classId {}", m), None),
    };
    let slot_id = match parse_opt_string(req.params.get("slotId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("slotId {}", m), None),
    };
    if class_id.is_none() && slot_id.is_none() {
        return err(&req.id, "bad_params", "missing classId or slotId", None);
    }
    let from = match parse_opt_string(req.params.get("from")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("from {}", m), None),
    };
    let to = match parse_opt_string(req.params.get("to")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("to {}", m), None),
    };
    for bound in [&from, &to].into_iter().flatten() {
        if schedule::parse_iso_date(bound).is_none() {
            return err(&req.id, "bad_params", "date bounds must be YYYY-MM-DD", None);
        }
    }

    let mut sql = String::from(
        "SELECT o.id, o.slot_id, o.teacher_id, o.date, o.status,
                o.started_at, o.ended_at, o.started_by, o.completed_by, o.notes
         FROM occurrences o
         JOIN recurring_slots rs ON rs.id = o.slot_id
         WHERE 1 = 1",
    );
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(class_id) = &class_id {
        sql.push_str(" AND rs.class_id = ?");
        values.push(class_id.clone().into());
    }
    if let Some(slot_id) = &slot_id {
        sql.push_str(" AND o.slot_id = ?");
        values.push(slot_id.clone().into());
    }
    if let Some(from) = &from {
        sql.push_str(" AND o.date >= ?");
        values.push(from.clone().into());
    }
    if let Some(to) = &to {
        sql.push_str(" AND o.date <= ?");
        values.push(to.clone().into());
    }
    sql.push_str(" ORDER BY o.date, o.rowid");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let occurrences = match stmt
        .query_map(rusqlite::params_from_iter(values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "slotId": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
                "date": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "startedAt": r.get::<_, Option<String>>(5)?,
                "endedAt": r.get::<_, Option<String>>(6)?,
                "startedBy": r.get::<_, Option<String>>(7)?,
                "completedBy": r.get::<_, Option<String>>(8)?,
                "notes": r.get::<_, Option<String>>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "occurrences": occurrences }))
}

fn handle_transition(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let occurrence_id = match required_str(req, "occurrenceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match schedule::transition_occurrence(conn, &occurrence_id, &status, &actor_id) {
        Ok(result) => ok(
            &req.id,
            serde_json::to_value(result).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "occurrences.generate" => Some(handle_generate(state, req)),
        "occurrences.createAdhoc" => Some(handle_create_adhoc(state, req)),
        "occurrences.list" => Some(handle_list(state, req)),
        "occurrences.transition" => Some(handle_transition(state, req)),
        _ => None,
    }
}
