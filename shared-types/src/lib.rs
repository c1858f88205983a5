//! Shared types between the build engine and its front ends
//!
//! These types are used by both:
//! - the orchestration engine and its run ledger
//! - the HTTP facade (and any desktop viewer talking to it)
//!
//! Serializable with serde for JSON over HTTP

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build output directory used when a project does not name one.
pub const DEFAULT_DIST_DIR: &str = "dist";

/// Name of the dependency link created inside each project directory.
pub const NODE_MODULES_DIR: &str = "node_modules";

// ============================================================================
// Project Configuration
// ============================================================================

/// Static configuration of one front-end project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSpec {
    /// Unique name within a run; also the staged artifact directory name
    pub name: String,

    /// Source path relative to the configured root
    pub path: String,

    /// Output partition label
    #[serde(default)]
    pub group: Option<String>,

    /// Shared `node_modules` directory, relative to the configured root
    #[serde(default)]
    pub node_modules_dir: Option<String>,

    /// Build command line, e.g. `npm run build`
    #[serde(default)]
    pub build_cmd: String,

    /// Build output directory inside the project (defaults to `dist`)
    #[serde(default)]
    pub dist_dir: Option<String>,

    /// Participates in build and artifact staging
    #[serde(default = "default_publish")]
    pub publish: bool,

    /// Node.js version tag, e.g. `18.19.0`
    #[serde(default)]
    pub node_version: Option<String>,
}

fn default_publish() -> bool {
    true
}

impl ProjectSpec {
    /// Project path with any leading separators removed, so it always joins
    /// under the root instead of replacing it.
    pub fn relative_path(&self) -> &str {
        trim_leading_separators(&self.path)
    }

    /// Shared dependency path with any leading separators removed.
    pub fn relative_node_modules_dir(&self) -> Option<&str> {
        self.node_modules_dir
            .as_deref()
            .map(trim_leading_separators)
            .filter(|p| !p.is_empty())
    }

    pub fn dist_dir_name(&self) -> &str {
        self.dist_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DIST_DIR)
    }

    pub fn group_name(&self) -> Option<&str> {
        self.group.as_deref().filter(|g| !g.is_empty())
    }
}

fn trim_leading_separators(path: &str) -> &str {
    path.trim_start_matches(['/', '\\'])
}

// ============================================================================
// Run History
// ============================================================================

/// Lifecycle state of a run as stored in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Header created, workflow still executing
    Running,
    /// Every project built successfully
    Completed,
    /// At least one project failed or the workflow hit a fatal error
    Failed,
    /// The owning process stopped before finalizing the run
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status '{0}'")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(UnknownRunStatus(other.to_string())),
        }
    }
}

/// Run header without the aggregate log text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub success: bool,
    pub duration_ms: i64,
    pub total_projects: i64,
    pub successful_projects: i64,
    pub failed_projects: i64,
    pub log_file_path: Option<String>,
    pub error_log_file_path: Option<String>,
}

/// Per-project record of one run, without its log text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRunSummary {
    pub id: i64,
    pub run_id: i64,
    pub project_name: String,
    pub project_path: String,
    pub success: bool,
    pub exit_code: i32,
    pub command: String,
    /// Captured stderr of a failed build
    pub error_message: Option<String>,
    pub node_version: Option<String>,
}

/// A run header together with its project records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunDetail {
    pub run: RunSummary,
    pub projects: Vec<ProjectRunSummary>,
}

/// Aggregate counters across the whole ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildStatistics {
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub in_progress_runs: i64,
    /// Mean duration of finished runs
    pub average_duration_ms: f64,
}

// ============================================================================
// Workflow Results
// ============================================================================

/// Outcome of one project's build process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectResult {
    pub project: String,
    pub command: String,
    /// -1 when the process could not be launched or was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProjectResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Value returned by every workflow invocation, successful or not.
///
/// `error` is only set for fatal workflow errors; build failures show up as
/// `success == false` with the details in `build_results`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowResult {
    pub success: bool,
    /// Ledger identity of the run, absent when the ledger was unavailable
    pub run_id: Option<i64>,
    pub build_results: Vec<ProjectResult>,
    pub full_log: String,
    pub logs: Vec<String>,
    pub error: Option<String>,
}
