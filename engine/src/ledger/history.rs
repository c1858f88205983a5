//! Read paths over the ledger, for history views and the HTTP facade.

use shared_types::{BuildStatistics, ProjectRunSummary, RunDetail, RunStatus, RunSummary};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection, Row, SqliteConnection};

use super::{parse_status, parse_timestamp, LedgerError};

const RUN_COLUMNS: &str = "id, started_at, finished_at, status, success, duration_ms, \
     total_projects, successful_projects, failed_projects, log_file_path, error_log_file_path";

const PROJECT_COLUMNS: &str = "id, run_id, project_name, project_path, success, exit_code, \
     command, error_message, node_version";

/// Read-only handle to the ledger. Large log text is only loaded by the
/// dedicated log getters.
#[derive(Debug, Clone)]
pub struct LedgerReader {
    options: SqliteConnectOptions,
}

impl LedgerReader {
    pub(super) fn new(options: SqliteConnectOptions) -> Self {
        Self { options }
    }

    async fn connect(&self) -> Result<SqliteConnection, LedgerError> {
        Ok(SqliteConnection::connect_with(&self.options).await?)
    }

    /// Newest runs first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<RunSummary>, LedgerError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM build_runs ORDER BY started_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit.max(0))
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunSummary, LedgerError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM build_runs WHERE id = ?"))
            .bind(run_id)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(LedgerError::NotFound(format!("run {run_id}"))),
        }
    }

    /// Project records of one run in insertion order.
    pub async fn list_project_records(
        &self,
        run_id: i64,
    ) -> Result<Vec<ProjectRunSummary>, LedgerError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM project_runs WHERE run_id = ? ORDER BY id"
        ))
        .bind(run_id)
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn get_run_detail(&self, run_id: i64) -> Result<RunDetail, LedgerError> {
        let run = self.get_run(run_id).await?;
        let projects = self.list_project_records(run_id).await?;
        Ok(RunDetail { run, projects })
    }

    /// Aggregate log of a run. `Err(NotFound)` when the run does not exist,
    /// `Ok(None)` when it exists but has no log yet.
    pub async fn get_run_log(&self, run_id: i64) -> Result<Option<String>, LedgerError> {
        self.log_content("build_runs", run_id, "run").await
    }

    /// Log of one project record. `Err(NotFound)` when the record does not
    /// exist, `Ok(None)` when it exists but has no log.
    pub async fn get_project_log(&self, record_id: i64) -> Result<Option<String>, LedgerError> {
        self.log_content("project_runs", record_id, "project record")
            .await
    }

    async fn log_content(
        &self,
        table: &str,
        id: i64,
        what: &str,
    ) -> Result<Option<String>, LedgerError> {
        let mut conn = self.connect().await?;
        let row: Option<(Option<String>,)> =
            sqlx::query_as(&format!("SELECT log_content FROM {table} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&mut conn)
                .await?;
        conn.close().await?;
        match row {
            Some((log,)) => Ok(log),
            None => Err(LedgerError::NotFound(format!("{what} {id}"))),
        }
    }

    /// Counts by status and the mean duration of finished runs. Interrupted
    /// runs count as failed.
    pub async fn statistics(&self) -> Result<BuildStatistics, LedgerError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_runs,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS successful_runs,
                COALESCE(SUM(CASE WHEN status IN ('failed', 'interrupted') THEN 1 ELSE 0 END), 0) AS failed_runs,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS in_progress_runs,
                AVG(CASE WHEN status IN ('completed', 'failed') THEN duration_ms END) AS average_duration_ms
            FROM build_runs
            "#,
        )
        .fetch_one(&mut conn)
        .await?;
        conn.close().await?;

        Ok(BuildStatistics {
            total_runs: row.try_get("total_runs")?,
            successful_runs: row.try_get("successful_runs")?,
            failed_runs: row.try_get("failed_runs")?,
            in_progress_runs: row.try_get("in_progress_runs")?,
            average_duration_ms: row
                .try_get::<Option<f64>, _>("average_duration_ms")?
                .unwrap_or(0.0),
        })
    }
}

fn run_from_row(row: &SqliteRow) -> Result<RunSummary, LedgerError> {
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let status: Option<String> = row.try_get("status")?;
    let success: bool = row.try_get("success")?;
    let status = match status {
        Some(raw) => parse_status(&raw)?,
        None => RunStatus::from_success(success),
    };

    Ok(RunSummary {
        id: row.try_get("id")?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        status,
        success,
        duration_ms: row.try_get("duration_ms")?,
        total_projects: row.try_get("total_projects")?,
        successful_projects: row.try_get("successful_projects")?,
        failed_projects: row.try_get("failed_projects")?,
        log_file_path: row.try_get("log_file_path")?,
        error_log_file_path: row.try_get("error_log_file_path")?,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<ProjectRunSummary, LedgerError> {
    Ok(ProjectRunSummary {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        project_name: row.try_get("project_name")?,
        project_path: row.try_get("project_path")?,
        success: row.try_get("success")?,
        exit_code: row.try_get("exit_code")?,
        command: row.try_get("command")?,
        error_message: row.try_get("error_message")?,
        node_version: row.try_get("node_version")?,
    })
}
