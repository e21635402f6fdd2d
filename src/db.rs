use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "schooldesk.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            form_level INTEGER,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            gender TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_students_gender(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT,
            role TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_teachers_contact_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_classes(
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, class_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subjects(
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_classes_class ON teacher_classes(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_subjects_subject ON teacher_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            class_score REAL,
            exam_score REAL,
            total REAL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, subject_id, student_id, term, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_class_term ON marks(class_id, term, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_subject ON marks(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS remarks(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            conduct TEXT,
            interest TEXT,
            teacher_remark TEXT,
            head_remark TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id, term, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_remarks_class_term ON remarks(class_id, term, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_remarks_student ON remarks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            title TEXT NOT NULL,
            kind TEXT NOT NULL,
            out_of REAL NOT NULL,
            held_on TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_assessments_held_on(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_class_subject
         ON assessments(class_id, subject_id, term, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_scores(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            raw_value REAL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assessment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_scores_assessment
         ON assessment_scores(assessment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_scores_student
         ON assessment_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_archives(
            id TEXT PRIMARY KEY,
            term INTEGER NOT NULL,
            year INTEGER NOT NULL,
            label TEXT NOT NULL,
            created_at TEXT NOT NULL,
            marks_json TEXT NOT NULL,
            remarks_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_archives_term ON term_archives(year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

fn ensure_students_gender(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "gender")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN gender TEXT", [])?;
    Ok(())
}

fn ensure_teachers_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces carried only name and role.
    if !table_has_column(conn, "teachers", "email")? {
        conn.execute("ALTER TABLE teachers ADD COLUMN email TEXT", [])?;
    }
    if !table_has_column(conn, "teachers", "active")? {
        conn.execute(
            "ALTER TABLE teachers ADD COLUMN active INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    Ok(())
}

fn ensure_assessments_held_on(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "held_on")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN held_on TEXT", [])?;
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
