use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    // recurring_slots.teacher_id is the legacy single-teacher column. The
    // modern API never writes it; the consolidation backfill still reads it.
    // No UNIQUE index on (class_id, weekday, start_time, end_time): older
    // workspaces contain duplicate time keys that slots.consolidate must be
    // able to read and repair. The key is enforced at the application level
    // on create/update.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS recurring_slots(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            location TEXT,
            notes TEXT,
            teacher_id TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_slots_location(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_recurring_slots_class ON recurring_slots(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_recurring_slots_key
         ON recurring_slots(class_id, weekday, start_time, end_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS slot_teachers(
            slot_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            assigned_by TEXT,
            PRIMARY KEY(slot_id, teacher_id),
            FOREIGN KEY(slot_id) REFERENCES recurring_slots(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_slot_teachers_slot ON slot_teachers(slot_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_slot_teachers_teacher ON slot_teachers(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS occurrences(
            id TEXT PRIMARY KEY,
            slot_id TEXT NOT NULL,
            teacher_id TEXT,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            started_by TEXT,
            completed_by TEXT,
            generated_by TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(slot_id) REFERENCES recurring_slots(id),
            UNIQUE(slot_id, date)
        )",
        [],
    )?;
    ensure_occurrences_notes(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_slot ON occurrences(slot_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_occurrences_date ON occurrences(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            occurrence_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            checked_in_at TEXT,
            recorded_by TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(occurrence_id) REFERENCES occurrences(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(occurrence_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_occurrence
         ON attendance_records(occurrence_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_slots_location(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before rooms were tracked lack the column.
    if table_has_column(conn, "recurring_slots", "location")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE recurring_slots ADD COLUMN location TEXT", [])?;
    Ok(())
}

fn ensure_occurrences_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "occurrences", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE occurrences ADD COLUMN notes TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
