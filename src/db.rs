use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradetrack.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            grade_lock INTEGER NOT NULL DEFAULT 1,
            is_retired INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    ensure_subjects_flags(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            total_weight REAL NOT NULL,
            default_name TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_categories_subject ON categories(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            assignment_name TEXT NOT NULL,
            study_time REAL NOT NULL,
            grade REAL,
            weight REAL NOT NULL,
            is_prediction INTEGER NOT NULL DEFAULT 0,
            predicted_grade REAL,
            position INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(category_id) REFERENCES categories(id)
        )",
        [],
    )?;
    // Workspaces created before predictions were persisted lack these columns.
    ensure_assessments_predicted_grade(&conn)?;
    ensure_assessments_position(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_subject ON assessments(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_category ON assessments(category_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_subject_position ON assessments(subject_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspace_settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM workspace_settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO workspace_settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_subjects_flags(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "subjects", "grade_lock")? {
        conn.execute(
            "ALTER TABLE subjects ADD COLUMN grade_lock INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    if !table_has_column(conn, "subjects", "is_retired")? {
        conn.execute(
            "ALTER TABLE subjects ADD COLUMN is_retired INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn ensure_assessments_predicted_grade(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "predicted_grade")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN predicted_grade REAL", [])?;
    Ok(())
}

fn ensure_assessments_position(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "position")? {
        return Ok(());
    }

    conn.execute(
        "ALTER TABLE assessments ADD COLUMN position INTEGER NOT NULL DEFAULT 0",
        [],
    )?;

    // Backfill per subject using insert order.
    let mut subject_stmt = conn.prepare("SELECT id FROM subjects ORDER BY rowid")?;
    let subject_ids = subject_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut row_stmt =
        conn.prepare("SELECT id FROM assessments WHERE subject_id = ? ORDER BY rowid")?;

    for sid in subject_ids {
        let ids = row_stmt
            .query_map([&sid], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for (i, aid) in ids.iter().enumerate() {
            conn.execute(
                "UPDATE assessments SET position = ? WHERE id = ?",
                (i as i64, aid),
            )?;
        }
    }

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
