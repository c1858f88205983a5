//! Ledger schema creation and additive migrations.
//!
//! Tables are created in their original shape and newer columns are added
//! afterwards, so a database written by an older build server upgrades in
//! place without losing rows.

use sqlx::{Row, SqliteConnection};

/// Columns added after the first schema, per table: (column, definition).
const BUILD_RUN_COLUMNS: &[(&str, &str)] = &[
    ("log_content", "TEXT"),
    ("status", "TEXT"),
    ("finished_at", "TEXT"),
];

const PROJECT_RUN_COLUMNS: &[(&str, &str)] = &[("log_content", "TEXT")];

pub(super) async fn migrate(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_runs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at          TEXT    NOT NULL,
            success             INTEGER NOT NULL DEFAULT 0,
            duration_ms         INTEGER NOT NULL DEFAULT 0,
            log_file_path       TEXT,
            error_log_file_path TEXT,
            total_projects      INTEGER NOT NULL,
            successful_projects INTEGER NOT NULL DEFAULT 0,
            failed_projects     INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_runs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id        INTEGER NOT NULL REFERENCES build_runs(id) ON DELETE CASCADE,
            project_name  TEXT    NOT NULL,
            project_path  TEXT    NOT NULL,
            success       INTEGER NOT NULL,
            exit_code     INTEGER NOT NULL,
            command       TEXT    NOT NULL,
            error_message TEXT,
            node_version  TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    add_missing_columns(conn, "build_runs", BUILD_RUN_COLUMNS).await?;
    add_missing_columns(conn, "project_runs", PROJECT_RUN_COLUMNS).await?;

    // Rows from before the status column only know success/failure.
    sqlx::query(
        r#"
        UPDATE build_runs
        SET status = CASE WHEN success = 1 THEN 'completed' ELSE 'failed' END
        WHERE status IS NULL
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_runs_started_at ON build_runs(started_at)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_runs_status ON build_runs(status)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_project_runs_run_id ON project_runs(run_id)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn add_missing_columns(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<(), sqlx::Error> {
    let existing = column_names(conn, table).await?;
    for (name, definition) in columns {
        if !existing.iter().any(|c| c == name) {
            tracing::info!(table, column = name, "adding ledger column");
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {name} {definition}"))
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

pub(super) async fn column_names(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
}
