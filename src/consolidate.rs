use crate::schedule::{now_iso, SchedError};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub groups: usize,
    pub merged: usize,
    pub duplicates_deleted: usize,
    pub assignments_added: usize,
    pub occurrences_repointed: usize,
    pub teachers_backfilled: usize,
}

#[derive(Debug, Clone)]
struct SlotRow {
    id: String,
    class_id: String,
    weekday: i64,
    start_time: String,
    end_time: String,
    teacher_id: Option<String>,
}

#[derive(Debug, Clone)]
struct AssignmentRow {
    teacher_id: String,
    assigned_at: String,
    assigned_by: Option<String>,
}

/// One-shot repair for workspaces where each weekly time key grew one slot
/// row per teacher instead of one row with several assignments. Groups slots
/// by (class, weekday, start, end) oldest-first, keeps the oldest row per
/// group, moves every teacher and occurrence onto it, and deletes the rest.
/// The whole run executes in a single transaction; re-running after
/// completion is a no-op because no group of size > 1 remains.
///
/// Occurrences are re-pointed, never created or deleted. A keeper and a
/// duplicate both holding an occurrence on the same date would violate the
/// (slot_id, date) constraint on re-point; that aborts the run rather than
/// guessing which row to keep.
pub fn consolidate_slots(
    conn: &Connection,
    actor_id: &str,
) -> Result<ConsolidationReport, SchedError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SchedError::new("db_tx_failed", e.to_string()))?;

    let mut stmt = tx
        .prepare(
            "SELECT id, class_id, weekday, start_time, end_time, teacher_id
             FROM recurring_slots
             ORDER BY created_at, rowid",
        )
        .map_err(db_err)?;
    let slots = stmt
        .query_map([], |r| {
            Ok(SlotRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                weekday: r.get(2)?,
                start_time: r.get(3)?,
                end_time: r.get(4)?,
                teacher_id: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    drop(stmt);

    // Group by time key, preserving oldest-first order within each group.
    let mut order: Vec<(String, i64, String, String)> = Vec::new();
    let mut groups: HashMap<(String, i64, String, String), Vec<SlotRow>> = HashMap::new();
    for slot in slots {
        let key = (
            slot.class_id.clone(),
            slot.weekday,
            slot.start_time.clone(),
            slot.end_time.clone(),
        );
        let entry = groups.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(slot);
    }

    let mut report = ConsolidationReport {
        groups: order.len(),
        ..Default::default()
    };

    for key in &order {
        let group = &groups[key];
        if group.len() < 2 {
            continue;
        }
        report.merged += 1;
        let keeper = &group[0];

        // Union every teacher seen anywhere in the group onto the keeper:
        // assignment rows keep their original metadata, legacy single-teacher
        // columns get a fresh assignment stamped to the migration actor.
        let now = now_iso();
        for member in group {
            let mut stmt = tx
                .prepare(
                    "SELECT teacher_id, assigned_at, assigned_by
                     FROM slot_teachers
                     WHERE slot_id = ?
                     ORDER BY assigned_at, teacher_id",
                )
                .map_err(db_err)?;
            let assignments = stmt
                .query_map([&member.id], |r| {
                    Ok(AssignmentRow {
                        teacher_id: r.get(0)?,
                        assigned_at: r.get(1)?,
                        assigned_by: r.get(2)?,
                    })
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err)?;
            drop(stmt);

            for a in assignments {
                let added = tx
                    .execute(
                        "INSERT OR IGNORE INTO slot_teachers(
                             slot_id, teacher_id, assigned_at, assigned_by
                         ) VALUES(?, ?, ?, ?)",
                        (&keeper.id, &a.teacher_id, &a.assigned_at, &a.assigned_by),
                    )
                    .map_err(|e| SchedError::new("db_insert_failed", e.to_string()))?;
                report.assignments_added += added;
            }
            if let Some(legacy_teacher) = &member.teacher_id {
                let added = tx
                    .execute(
                        "INSERT OR IGNORE INTO slot_teachers(
                             slot_id, teacher_id, assigned_at, assigned_by
                         ) VALUES(?, ?, ?, ?)",
                        (&keeper.id, legacy_teacher, &now, actor_id),
                    )
                    .map_err(|e| SchedError::new("db_insert_failed", e.to_string()))?;
                report.assignments_added += added;
            }
        }

        for duplicate in &group[1..] {
            if let Some(legacy_teacher) = &duplicate.teacher_id {
                let filled = tx
                    .execute(
                        "UPDATE occurrences SET teacher_id = ?
                         WHERE slot_id = ? AND teacher_id IS NULL",
                        (legacy_teacher, &duplicate.id),
                    )
                    .map_err(|e| SchedError::new("db_update_failed", e.to_string()))?;
                report.teachers_backfilled += filled;
            }
            let repointed = tx
                .execute(
                    "UPDATE occurrences SET slot_id = ? WHERE slot_id = ?",
                    (&keeper.id, &duplicate.id),
                )
                .map_err(|e| SchedError::new("db_update_failed", e.to_string()))?;
            report.occurrences_repointed += repointed;

            tx.execute("DELETE FROM slot_teachers WHERE slot_id = ?", [&duplicate.id])
                .map_err(|e| SchedError::new("db_delete_failed", e.to_string()))?;
            tx.execute("DELETE FROM recurring_slots WHERE id = ?", [&duplicate.id])
                .map_err(|e| SchedError::new("db_delete_failed", e.to_string()))?;
            report.duplicates_deleted += 1;
        }

        if let Some(legacy_teacher) = &keeper.teacher_id {
            let filled = tx
                .execute(
                    "UPDATE occurrences SET teacher_id = ?
                     WHERE slot_id = ? AND teacher_id IS NULL",
                    (legacy_teacher, &keeper.id),
                )
                .map_err(|e| SchedError::new("db_update_failed", e.to_string()))?;
            report.teachers_backfilled += filled;
        }
    }

    tx.commit()
        .map_err(|e| SchedError::new("db_commit_failed", e.to_string()))?;
    Ok(report)
}

fn db_err(e: rusqlite::Error) -> SchedError {
    SchedError::new("db_query_failed", e.to_string())
}
