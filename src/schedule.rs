use chrono::{Datelike, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub const OCCURRENCE_STATUSES: [&str; 5] = [
    "scheduled",
    "not_started",
    "in_progress",
    "completed",
    "cancelled",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
    Sick,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "late" => Some(Self::Late),
            "absent" => Some(Self::Absent),
            "excused" => Some(Self::Excused),
            "sick" => Some(Self::Sick),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
            Self::Excused => "excused",
            Self::Sick => "sick",
        }
    }

    /// Check-in is only meaningful when the student actually showed up.
    pub fn sets_check_in(self) -> bool {
        matches!(self, Self::Present | Self::Late)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SchedError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Accepts "H:MM" or "HH:MM", 24h wall clock. Returns the normalized
/// "HH:MM" form so time keys compare as plain strings.
pub fn normalize_time_hhmm(raw: &str) -> Option<String> {
    let t = raw.trim();
    let (h, m) = t.split_once(':')?;
    let hours = h.parse::<u32>().ok()?;
    let minutes = m.parse::<u32>().ok()?;
    if hours > 23 || minutes > 59 || m.len() != 2 {
        return None;
    }
    Some(format!("{:02}:{:02}", hours, minutes))
}

/// Calendar-day weekday, 0 = Sunday .. 6 = Saturday.
pub fn weekday_of(date: NaiveDate) -> i64 {
    date.weekday().num_days_from_sunday() as i64
}

/// Every date in the inclusive range whose weekday matches. An inverted
/// range yields nothing, matching the generator's zero-occurrence contract.
pub fn dates_matching_weekday(start: NaiveDate, end: NaiveDate, weekday: i64) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    if end < start {
        return out;
    }
    let mut day = start;
    while day <= end {
        if weekday_of(day) == weekday {
            out.push(day);
        }
        day = day + Duration::days(1);
    }
    out
}

/// round((present + late) / recorded * 100); 0 when nothing is recorded.
pub fn attendance_rate(present: i64, late: i64, recorded: i64) -> i64 {
    if recorded <= 0 {
        return 0;
    }
    (((present + late) as f64 / recorded as f64) * 100.0).round() as i64
}

/// A slot's default teacher is its earliest assignment. Ordering is explicit
/// (assigned_at, then teacher_id) so resolution does not depend on store
/// return order.
pub fn default_teacher_for_slot(
    conn: &Connection,
    slot_id: &str,
) -> Result<Option<String>, SchedError> {
    conn.query_row(
        "SELECT teacher_id FROM slot_teachers
         WHERE slot_id = ?
         ORDER BY assigned_at, teacher_id
         LIMIT 1",
        [slot_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(SchedError::db)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailure {
    pub slot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub requested: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: Vec<GenerationFailure>,
}

struct SlotRow {
    id: String,
    weekday: i64,
}

/// Expand the slot set against the inclusive date range, one scheduled
/// occurrence per (slot, matching date) not already present. Best-effort
/// bulk job: unknown slots become per-item failures, existing dates are
/// skipped, and a (slot_id, date) conflict from a concurrent generator
/// counts as skipped rather than surfacing.
pub fn generate_occurrences(
    conn: &Connection,
    slot_ids: &[String],
    start: NaiveDate,
    end: NaiveDate,
    actor_id: &str,
) -> Result<GenerationReport, SchedError> {
    let mut report = GenerationReport {
        requested: slot_ids.len(),
        created: 0,
        skipped: 0,
        failed: Vec::new(),
    };
    if slot_ids.is_empty() || end < start {
        return Ok(report);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SchedError::new("db_tx_failed", e.to_string()))?;

    let now = now_iso();
    let start_raw = start.format("%Y-%m-%d").to_string();
    let end_raw = end.format("%Y-%m-%d").to_string();

    for slot_id in slot_ids {
        let slot: Option<SlotRow> = tx
            .query_row(
                "SELECT id, weekday FROM recurring_slots WHERE id = ?",
                [slot_id],
                |r| {
                    Ok(SlotRow {
                        id: r.get(0)?,
                        weekday: r.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(SchedError::db)?;
        let Some(slot) = slot else {
            report.failed.push(GenerationFailure {
                slot_id: slot_id.clone(),
                date: None,
                reason: "slot not found".to_string(),
            });
            continue;
        };

        let mut existing: HashSet<String> = HashSet::new();
        let mut stmt = tx
            .prepare(
                "SELECT date FROM occurrences
                 WHERE slot_id = ? AND date >= ? AND date <= ?",
            )
            .map_err(SchedError::db)?;
        let rows = stmt
            .query_map((&slot.id, &start_raw, &end_raw), |r| {
                r.get::<_, String>(0)
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(SchedError::db)?;
        existing.extend(rows);

        let teacher = default_teacher_for_slot(&tx, &slot.id)?;

        for date in dates_matching_weekday(start, end, slot.weekday) {
            let date_raw = date.format("%Y-%m-%d").to_string();
            if existing.contains(&date_raw) {
                report.skipped += 1;
                continue;
            }
            let inserted = tx
                .execute(
                    "INSERT INTO occurrences(
                         id, slot_id, teacher_id, date, status,
                         generated_by, created_at
                     ) VALUES(?, ?, ?, ?, 'scheduled', ?, ?)
                     ON CONFLICT(slot_id, date) DO NOTHING",
                    (
                        Uuid::new_v4().to_string(),
                        &slot.id,
                        &teacher,
                        &date_raw,
                        actor_id,
                        &now,
                    ),
                )
                .map_err(|e| SchedError::new("db_insert_failed", e.to_string()))?;
            if inserted == 0 {
                report.skipped += 1;
            } else {
                report.created += 1;
            }
        }
    }

    tx.commit()
        .map_err(|e| SchedError::new("db_commit_failed", e.to_string()))?;
    Ok(report)
}

/// Single ad-hoc occurrence, created by a teacher outside batch generation.
/// The actor must hold an assignment on some slot of the target class.
pub fn create_adhoc_occurrence(
    conn: &Connection,
    slot_id: &str,
    date: NaiveDate,
    actor_id: &str,
    notes: Option<&str>,
) -> Result<String, SchedError> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM recurring_slots WHERE id = ?",
            [slot_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(SchedError::db)?;
    let Some(class_id) = class_id else {
        return Err(SchedError::new("not_found", "slot not found"));
    };

    let assigned: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM slot_teachers st
             JOIN recurring_slots rs ON rs.id = st.slot_id
             WHERE rs.class_id = ? AND st.teacher_id = ?
             LIMIT 1",
            (&class_id, actor_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(SchedError::db)?;
    if assigned.is_none() {
        return Err(SchedError::new(
            "unauthorized",
            "actor is not an assigned teacher of this class",
        ));
    }

    let date_raw = date.format("%Y-%m-%d").to_string();
    let occurrence_id = Uuid::new_v4().to_string();
    let inserted = conn
        .execute(
            "INSERT INTO occurrences(
                 id, slot_id, teacher_id, date, status,
                 generated_by, notes, created_at
             ) VALUES(?, ?, ?, ?, 'scheduled', ?, ?, ?)
             ON CONFLICT(slot_id, date) DO NOTHING",
            (
                &occurrence_id,
                slot_id,
                actor_id,
                &date_raw,
                actor_id,
                &notes,
                now_iso(),
            ),
        )
        .map_err(|e| SchedError::new("db_insert_failed", e.to_string()))?;
    if inserted == 0 {
        return Err(SchedError::new(
            "duplicate_occurrence",
            "an occurrence already exists for this slot and date",
        ));
    }
    Ok(occurrence_id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub occurrence_id: String,
    pub status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// Advance an occurrence's lifecycle. Only the recognized-value check is
/// enforced; any recognized target is accepted, including backwards moves.
/// in_progress stamps start metadata, completed stamps end metadata, and
/// nothing is written at all when validation fails.
pub fn transition_occurrence(
    conn: &Connection,
    occurrence_id: &str,
    target: &str,
    actor_id: &str,
) -> Result<TransitionResult, SchedError> {
    let target = target.trim().to_ascii_lowercase();
    if !OCCURRENCE_STATUSES.contains(&target.as_str()) {
        return Err(SchedError::new(
            "invalid_status",
            format!("unrecognized status: {}", target),
        ));
    }

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM occurrences WHERE id = ?", [occurrence_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(SchedError::db)?;
    if exists.is_none() {
        return Err(SchedError::new("not_found", "occurrence not found"));
    }

    let now = now_iso();
    let updated = match target.as_str() {
        "in_progress" => conn.execute(
            "UPDATE occurrences
             SET status = ?1, started_at = ?2, started_by = ?3, updated_at = ?2
             WHERE id = ?4",
            (&target, &now, actor_id, occurrence_id),
        ),
        "completed" => conn.execute(
            "UPDATE occurrences
             SET status = ?1, ended_at = ?2, completed_by = ?3, updated_at = ?2
             WHERE id = ?4",
            (&target, &now, actor_id, occurrence_id),
        ),
        _ => conn.execute(
            "UPDATE occurrences SET status = ?1, updated_at = ?2 WHERE id = ?3",
            (&target, &now, occurrence_id),
        ),
    };
    updated.map_err(|e| SchedError::new("db_update_failed", e.to_string()))?;

    conn.query_row(
        "SELECT status, started_at, ended_at FROM occurrences WHERE id = ?",
        [occurrence_id],
        |r| {
            Ok(TransitionResult {
                occurrence_id: occurrence_id.to_string(),
                status: r.get(0)?,
                started_at: r.get(1)?,
                ended_at: r.get(2)?,
            })
        },
    )
    .map_err(SchedError::db)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub occurrence_id: String,
    pub student_id: String,
    pub status: String,
    pub checked_in_at: Option<String>,
}

/// Upsert one student's record for one occurrence. Recording again for the
/// same pair replaces status, notes, check-in, and recording metadata.
pub fn record_attendance(
    conn: &Connection,
    occurrence_id: &str,
    student_id: &str,
    status: AttendanceStatus,
    notes: Option<&str>,
    actor_id: &str,
) -> Result<RecordOutcome, SchedError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM occurrences WHERE id = ?", [occurrence_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(SchedError::db)?;
    if exists.is_none() {
        return Err(SchedError::new("not_found", "occurrence not found"));
    }

    let now = now_iso();
    let checked_in_at = if status.sets_check_in() {
        Some(now.clone())
    } else {
        None
    };
    conn.execute(
        "INSERT INTO attendance_records(
             id, occurrence_id, student_id, status, notes,
             checked_in_at, recorded_by, recorded_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(occurrence_id, student_id) DO UPDATE SET
           status = excluded.status,
           notes = excluded.notes,
           checked_in_at = excluded.checked_in_at,
           recorded_by = excluded.recorded_by,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            occurrence_id,
            student_id,
            status.as_str(),
            &notes,
            &checked_in_at,
            actor_id,
            &now,
        ),
    )
    .map_err(|e| SchedError::new("db_update_failed", e.to_string()))?;

    Ok(RecordOutcome {
        occurrence_id: occurrence_id.to_string(),
        student_id: student_id.to_string(),
        status: status.as_str().to_string(),
        checked_in_at,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryFailure {
    pub student_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecordReport {
    pub succeeded: usize,
    pub failed: Vec<BatchEntryFailure>,
}

pub struct BatchEntry {
    pub student_id: String,
    pub status_raw: String,
    pub notes: Option<String>,
}

/// Apply the single-record upsert per entry. One bad entry never aborts the
/// batch; it lands in the failed list with its reason.
pub fn record_attendance_batch(
    conn: &Connection,
    occurrence_id: &str,
    entries: &[BatchEntry],
    actor_id: &str,
) -> Result<BatchRecordReport, SchedError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM occurrences WHERE id = ?", [occurrence_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(SchedError::db)?;
    if exists.is_none() {
        return Err(SchedError::new("not_found", "occurrence not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SchedError::new("db_tx_failed", e.to_string()))?;
    let mut report = BatchRecordReport {
        succeeded: 0,
        failed: Vec::new(),
    };

    for entry in entries {
        if entry.student_id.trim().is_empty() {
            report.failed.push(BatchEntryFailure {
                student_id: entry.student_id.clone(),
                reason: "missing studentId".to_string(),
            });
            continue;
        }
        let Some(status) = AttendanceStatus::parse(&entry.status_raw) else {
            report.failed.push(BatchEntryFailure {
                student_id: entry.student_id.clone(),
                reason: format!("unrecognized status: {}", entry.status_raw),
            });
            continue;
        };
        match record_attendance(
            &tx,
            occurrence_id,
            &entry.student_id,
            status,
            entry.notes.as_deref(),
            actor_id,
        ) {
            Ok(_) => report.succeeded += 1,
            Err(e) => report.failed.push(BatchEntryFailure {
                student_id: entry.student_id.clone(),
                reason: e.message,
            }),
        }
    }

    tx.commit()
        .map_err(|e| SchedError::new("db_commit_failed", e.to_string()))?;
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixOccurrence {
    pub occurrence_id: String,
    pub slot_id: String,
    pub date: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixCell {
    pub occurrence_id: String,
    pub date: String,
    pub occurrence_status: String,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub checked_in_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub present: i64,
    pub late: i64,
    pub absent: i64,
    pub excused: i64,
    pub sick: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixStudent {
    pub student_id: String,
    pub display_name: String,
    pub active: bool,
    pub cells: Vec<MatrixCell>,
    pub counts: StatusCounts,
    pub recorded: i64,
    pub rate: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAttendanceMatrix {
    pub class_id: String,
    pub occurrences: Vec<MatrixOccurrence>,
    pub students: Vec<MatrixStudent>,
}

struct StoredRecord {
    status: String,
    notes: Option<String>,
    checked_in_at: Option<String>,
}

/// Read-side matrix for one class: every occurrence reachable through the
/// class's slots, every enrolled student, and every record joining the two.
/// Occurrences with no record for a student stay out of that student's
/// denominator; they are implicitly absent to readers, not counted.
pub fn attendance_matrix(
    conn: &Connection,
    class_id: &str,
) -> Result<ClassAttendanceMatrix, SchedError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(SchedError::db)?;
    if exists.is_none() {
        return Err(SchedError::new("not_found", "class not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT o.id, o.slot_id, o.date, o.status
             FROM occurrences o
             JOIN recurring_slots rs ON rs.id = o.slot_id
             WHERE rs.class_id = ?
             ORDER BY o.date, o.rowid",
        )
        .map_err(SchedError::db)?;
    let occurrences = stmt
        .query_map([class_id], |r| {
            Ok(MatrixOccurrence {
                occurrence_id: r.get(0)?,
                slot_id: r.get(1)?,
                date: r.get(2)?,
                status: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(SchedError::db)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(SchedError::db)?;
    let students = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                format!("{}, {}", last, first),
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(SchedError::db)?;

    let mut records: HashMap<(String, String), StoredRecord> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT ar.occurrence_id, ar.student_id, ar.status, ar.notes, ar.checked_in_at
             FROM attendance_records ar
             JOIN occurrences o ON o.id = ar.occurrence_id
             JOIN recurring_slots rs ON rs.id = o.slot_id
             WHERE rs.class_id = ?",
        )
        .map_err(SchedError::db)?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                StoredRecord {
                    status: r.get(2)?,
                    notes: r.get(3)?,
                    checked_in_at: r.get(4)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(SchedError::db)?;
    for (key, rec) in rows {
        records.insert(key, rec);
    }

    let mut out_students = Vec::with_capacity(students.len());
    for (student_id, display_name, active) in students {
        let mut counts = StatusCounts::default();
        let mut recorded: i64 = 0;
        let mut cells = Vec::with_capacity(occurrences.len());
        for occ in &occurrences {
            let key = (occ.occurrence_id.clone(), student_id.clone());
            let rec = records.get(&key);
            if let Some(rec) = rec {
                recorded += 1;
                match rec.status.as_str() {
                    "present" => counts.present += 1,
                    "late" => counts.late += 1,
                    "absent" => counts.absent += 1,
                    "excused" => counts.excused += 1,
                    "sick" => counts.sick += 1,
                    _ => {}
                }
            }
            cells.push(MatrixCell {
                occurrence_id: occ.occurrence_id.clone(),
                date: occ.date.clone(),
                occurrence_status: occ.status.clone(),
                status: rec.map(|r| r.status.clone()),
                notes: rec.and_then(|r| r.notes.clone()),
                checked_in_at: rec.and_then(|r| r.checked_in_at.clone()),
            });
        }
        let rate = attendance_rate(counts.present, counts.late, recorded);
        out_students.push(MatrixStudent {
            student_id,
            display_name,
            active,
            cells,
            counts,
            recorded,
            rate,
        });
    }

    Ok(ClassAttendanceMatrix {
        class_id: class_id.to_string(),
        occurrences,
        students: out_students,
    })
}
