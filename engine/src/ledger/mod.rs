//! Run Ledger - SQLite history of build runs and per-project results
//!
//! Every operation opens its own connection and closes it when done; nothing
//! holds a connection across a build. The database runs in WAL mode so a
//! history viewer reading while a run is writing does not block either side.
//!
//! Schema (created on [`Ledger::open`], see [`schema`]):
//! ```sql
//! build_runs   (id, started_at, success, duration_ms, log_file_path,
//!               error_log_file_path, total_projects, successful_projects,
//!               failed_projects, log_content, status, finished_at)
//! project_runs (id, run_id, project_name, project_path, success, exit_code,
//!               command, error_message, node_version, log_content)
//! ```

mod history;
mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use shared_types::RunStatus;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, SqliteConnection};
use tracing::{info, warn};

pub use history::LedgerReader;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run {0} is already finalized")]
    AlreadyFinalized(i64),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// Final state written to a run header exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub success: bool,
    pub duration_ms: i64,
    pub log_file_path: Option<String>,
    pub error_log_file_path: Option<String>,
    pub successful_projects: i64,
    pub failed_projects: i64,
    pub full_log: String,
}

/// One project's result within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProjectRecord {
    pub run_id: i64,
    pub project_name: String,
    pub project_path: String,
    pub success: bool,
    pub exit_code: i32,
    pub command: String,
    pub error_message: Option<String>,
    pub node_version: Option<String>,
    pub log_content: String,
}

/// Write handle to the ledger. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path` and bring its schema up
    /// to date.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let ledger = Self {
            path: path.to_path_buf(),
            options,
        };

        let mut conn = ledger.connect().await?;
        schema::migrate(&mut conn).await?;
        conn.close().await?;

        info!(path = %path.display(), "run ledger ready");
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only view for history consumers.
    pub fn reader(&self) -> LedgerReader {
        LedgerReader::new(self.options.clone())
    }

    async fn connect(&self) -> Result<SqliteConnection, LedgerError> {
        Ok(SqliteConnection::connect_with(&self.options).await?)
    }

    /// Insert a placeholder header in `running` state and return its id.
    pub async fn create_run(
        &self,
        started_at: DateTime<Utc>,
        total_projects: i64,
    ) -> Result<i64, LedgerError> {
        let mut conn = self.connect().await?;
        let run_id = sqlx::query(
            r#"
            INSERT INTO build_runs
                (started_at, success, duration_ms, total_projects,
                 successful_projects, failed_projects, status)
            VALUES (?, 0, 0, ?, 0, 0, ?)
            "#,
        )
        .bind(format_timestamp(started_at))
        .bind(total_projects)
        .bind(RunStatus::Running.as_str())
        .execute(&mut conn)
        .await?
        .last_insert_rowid();
        conn.close().await?;
        Ok(run_id)
    }

    /// Write the final state of a run. Only a run still in `running` state
    /// can be finalized.
    pub async fn finalize_run(&self, run_id: i64, fin: &Finalization) -> Result<(), LedgerError> {
        let mut conn = self.connect().await?;
        let updated = sqlx::query(
            r#"
            UPDATE build_runs
            SET success = ?,
                duration_ms = ?,
                log_file_path = ?,
                error_log_file_path = ?,
                successful_projects = ?,
                failed_projects = ?,
                log_content = ?,
                status = ?,
                finished_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(fin.success)
        .bind(fin.duration_ms)
        .bind(&fin.log_file_path)
        .bind(&fin.error_log_file_path)
        .bind(fin.successful_projects)
        .bind(fin.failed_projects)
        .bind(&fin.full_log)
        .bind(RunStatus::from_success(fin.success).as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&mut conn)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM build_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut conn)
                .await?;
            conn.close().await?;
            return Err(match exists {
                Some(_) => LedgerError::AlreadyFinalized(run_id),
                None => LedgerError::NotFound(format!("run {run_id}")),
            });
        }

        conn.close().await?;
        Ok(())
    }

    /// Append one project result to a run and return the record id.
    pub async fn add_project_record(&self, record: &NewProjectRecord) -> Result<i64, LedgerError> {
        let mut conn = self.connect().await?;
        let id = sqlx::query(
            r#"
            INSERT INTO project_runs
                (run_id, project_name, project_path, success, exit_code,
                 command, error_message, node_version, log_content)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id)
        .bind(&record.project_name)
        .bind(&record.project_path)
        .bind(record.success)
        .bind(record.exit_code)
        .bind(&record.command)
        .bind(&record.error_message)
        .bind(&record.node_version)
        .bind(&record.log_content)
        .execute(&mut conn)
        .await?
        .last_insert_rowid();
        conn.close().await?;
        Ok(id)
    }

    /// Mark runs left in `running` by a process that died mid-run as
    /// `interrupted`. Call once at startup, before any new run begins.
    pub async fn mark_interrupted(&self) -> Result<u64, LedgerError> {
        let mut conn = self.connect().await?;
        let count = sqlx::query(
            "UPDATE build_runs SET status = ?, finished_at = ? WHERE status = ?",
        )
        .bind(RunStatus::Interrupted.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(RunStatus::Running.as_str())
        .execute(&mut conn)
        .await?
        .rows_affected();
        conn.close().await?;

        if count > 0 {
            warn!(count, "marked unfinished runs as interrupted");
        }
        Ok(count)
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::InvalidData(format!("timestamp '{raw}': {e}")))
}

pub(crate) fn parse_status(raw: &str) -> Result<RunStatus, LedgerError> {
    raw.parse()
        .map_err(|e: shared_types::UnknownRunStatus| LedgerError::InvalidData(e.to_string()))
}
