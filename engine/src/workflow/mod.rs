//! Orchestration Engine - one end-to-end build-and-deploy run
//!
//! Phases run in a fixed order:
//!
//! ```text
//! Created -> Preparing -> Building -> Copying -> Finalizing -> Completed | Failed
//! ```
//!
//! Preparing and Copying walk the publishable projects one at a time.
//! Building fans out one process per project (bounded by
//! `max_parallel_builds`) and waits for all of them. Finalizing always runs,
//! also after a fatal error or a panic in an earlier phase, so the ledger
//! never keeps a run in `running` state.
//!
//! Each run executes on its own task holding the run lock. A caller that
//! stops waiting does not cancel the run or release the lock early.

mod build;
mod finalize;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use shared_types::{ProjectResult, ProjectSpec, WorkflowResult};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::journal::RunJournal;
use crate::ledger::{Ledger, LedgerError, LedgerReader};
use crate::process::LineSink;
use crate::{deps, stage};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow panicked during {phase}: {message}")]
    Panicked {
        phase: WorkflowPhase,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    Created,
    Preparing,
    Building,
    Copying,
    Finalizing,
    Completed,
    Failed,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowPhase::Created => "created",
            WorkflowPhase::Preparing => "preparing",
            WorkflowPhase::Building => "building",
            WorkflowPhase::Copying => "copying",
            WorkflowPhase::Finalizing => "finalizing",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Mutable state of the run in flight, owned by the orchestration task.
struct RunState {
    journal: RunJournal,
    run_id: Option<i64>,
    projects: Vec<ProjectSpec>,
    /// Build results in project order; `None` until the Building phase ends
    results: Option<Vec<ProjectResult>>,
    phase: WorkflowPhase,
    clock: Instant,
}

impl RunState {
    fn enter(&mut self, phase: WorkflowPhase) {
        debug!(run_id = ?self.run_id, from = %self.phase, to = %phase, "workflow phase");
        self.phase = phase;
    }
}

/// Owns one configuration and the ledger for its lifetime.
pub struct BuildEngine {
    config: EngineConfig,
    ledger: Option<Ledger>,
    line_sink: Option<LineSink>,
    run_lock: Arc<Mutex<()>>,
}

impl BuildEngine {
    /// Engine with the ledger at `config.database_path`. An unusable ledger
    /// is logged and the engine runs untracked.
    pub async fn open(config: EngineConfig) -> Self {
        let ledger = match Ledger::open(&config.database_path).await {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!(
                    path = %config.database_path.display(),
                    "run ledger unavailable, builds will not be tracked: {e}"
                );
                None
            }
        };
        Self::with_ledger(config, ledger)
    }

    pub fn with_ledger(config: EngineConfig, ledger: Option<Ledger>) -> Self {
        Self {
            config,
            ledger,
            line_sink: None,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Forward every captured build output line to `sink`.
    pub fn with_line_sink(mut self, sink: LineSink) -> Self {
        self.line_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only history access, if the ledger is available.
    pub fn ledger(&self) -> Option<LedgerReader> {
        self.ledger.as_ref().map(Ledger::reader)
    }

    /// Mark runs a previous process left unfinished as interrupted.
    pub async fn recover_interrupted_runs(&self) -> Result<u64, LedgerError> {
        match &self.ledger {
            Some(ledger) => ledger.mark_interrupted().await,
            None => Ok(0),
        }
    }

    /// Run the workflow unless one is already in progress on this engine.
    pub async fn try_run_workflow(&self) -> Option<WorkflowResult> {
        let guard = Arc::clone(&self.run_lock).try_lock_owned().ok()?;
        Some(self.spawn_run(guard).await)
    }

    /// Run the workflow, waiting for any run in progress to finish first.
    /// Always returns a result; check `success`.
    pub async fn run_workflow(&self) -> WorkflowResult {
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        self.spawn_run(guard).await
    }

    /// The run lives on its own task and keeps the run lock until it is
    /// finalized. Dropping the returned future only stops waiting for it.
    async fn spawn_run(&self, guard: OwnedMutexGuard<()>) -> WorkflowResult {
        let context = RunContext {
            config: self.config.clone(),
            ledger: self.ledger.clone(),
            line_sink: self.line_sink.clone(),
        };
        let handle = tokio::spawn(async move {
            let result = context.run().await;
            drop(guard);
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("workflow task failed: {e}");
                WorkflowResult {
                    success: false,
                    error: Some(format!("Workflow task failed: {e}")),
                    ..WorkflowResult::default()
                }
            }
        }
    }
}

/// What one run needs from the engine, owned by the run's task.
struct RunContext {
    config: EngineConfig,
    ledger: Option<Ledger>,
    line_sink: Option<LineSink>,
}

impl RunContext {
    async fn run(self) -> WorkflowResult {
        let started_at = Utc::now();
        let projects = self.config.publishable_projects();
        let tag = run_tag();
        let mut run = RunState {
            journal: RunJournal::open(&self.config.logs_dir, &tag),
            run_id: None,
            projects,
            results: None,
            phase: WorkflowPhase::Created,
            clock: Instant::now(),
        };

        if let Some(ledger) = &self.ledger {
            match ledger
                .create_run(started_at, run.projects.len() as i64)
                .await
            {
                Ok(id) => {
                    run.run_id = Some(id);
                    run.journal.info(format!("Build record created with ID: {id}"));
                }
                Err(e) => run
                    .journal
                    .warn(format!("Warning: Failed to create build record: {e}")),
            }
        }

        let outcome = AssertUnwindSafe(self.execute(&mut run))
            .catch_unwind()
            .await;
        let fatal = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(WorkflowError::Panicked {
                phase: run.phase,
                message: panic_message(panic.as_ref()),
            }),
        };

        self.finalize(run, fatal).await
    }

    async fn execute(&self, run: &mut RunState) -> Result<(), WorkflowError> {
        run.journal.info("Starting Workflow...");
        if let Some(path) = run.journal.summary_path().map(|p| p.display().to_string()) {
            run.journal.info(format!("Build log: {path}"));
        }

        run.enter(WorkflowPhase::Preparing);
        run.journal.info("Step 1: Verify node_modules");
        self.prepare_dependencies(run).await;

        run.enter(WorkflowPhase::Building);
        run.journal.info("Step 2: Build");
        let results = self.build_all(run).await;
        if results.iter().any(|r| !r.success()) {
            run.journal
                .info("Build failures detected. Proceeding to copy successful builds...");
        }
        run.results = Some(results);

        run.enter(WorkflowPhase::Copying);
        run.journal.info("Step 3: Copy Artifacts");
        self.stage_artifacts(run).await?;

        run.journal.info("Workflow Completed.");
        Ok(())
    }

    async fn prepare_dependencies(&self, run: &mut RunState) {
        for project in &run.projects {
            let outcome = deps::ensure_linked(project, &self.config.root_dir).await;
            if outcome == deps::LinkOutcome::Skipped {
                continue;
            }
            let message = outcome.describe(&project.name);
            if outcome.is_warning() {
                run.journal.warn(message);
            } else {
                run.journal.info(message);
            }
        }
    }

    async fn stage_artifacts(&self, run: &mut RunState) -> Result<(), WorkflowError> {
        let output_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| WorkflowError::OutputDir {
                path: output_dir.display().to_string(),
                source,
            })?;

        for project in &run.projects {
            let project_dir = self.config.project_dir(project);
            if !project_dir.is_dir() {
                run.journal.warn(format!(
                    "Warning: Project path not found: {}",
                    project_dir.display()
                ));
            }
            let outcome = stage::stage(project, &self.config.root_dir, output_dir).await;
            match outcome {
                stage::StageOutcome::Copied { .. } => run.journal.info(outcome.describe()),
                _ => run.journal.warn(outcome.describe()),
            }
        }
        Ok(())
    }
}

/// Unique per-run suffix for transcript names: local time plus a random tail
/// so runs started within the same second do not collide.
fn run_tag() -> String {
    let id = ulid::Ulid::new().to_string().to_lowercase();
    format!(
        "{}_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        &id[id.len() - 6..]
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_tags_are_unique() {
        let a = run_tag();
        let b = run_tag();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101_120000_abcdef".len());
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
