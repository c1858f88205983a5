use std::fmt::Write as _;

use shared_types::{ProjectResult, ProjectSpec, WorkflowResult};
use tracing::info;

use super::{RunContext, RunState, WorkflowError, WorkflowPhase};
use crate::ledger::{Finalization, NewProjectRecord};

impl RunContext {
    /// Settle the run: per-project ledger records, the final header update
    /// and transcript cleanup. Runs exactly once per run whatever happened
    /// before.
    pub(super) async fn finalize(
        &self,
        mut run: RunState,
        fatal: Option<WorkflowError>,
    ) -> WorkflowResult {
        run.enter(WorkflowPhase::Finalizing);
        let duration_ms = i64::try_from(run.clock.elapsed().as_millis()).unwrap_or(i64::MAX);

        let mut results = run.results.take().unwrap_or_default();
        // Projects the workflow never got to build still count, as failures.
        if results.len() < run.projects.len() {
            let reason = match &fatal {
                Some(e) => format!("Build not started: {e}"),
                None => "Build not started".to_string(),
            };
            for project in &run.projects[results.len()..] {
                results.push(ProjectResult {
                    project: project.name.clone(),
                    command: project.build_cmd.clone(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: reason.clone(),
                });
            }
        }

        let mut full_log = String::from("=== BUILD LOGS ===\n");
        let mut records = Vec::with_capacity(results.len());
        for (project, result) in run.projects.iter().zip(&results) {
            append_project_log(&mut full_log, result);
            if !result.success() {
                if !result.stderr.trim().is_empty() {
                    run.journal.error(format!(
                        "Error in {}: {}",
                        project.name,
                        result.stderr.trim_end()
                    ));
                }
                run.journal.error(format!(
                    "Build failed for {} with exit code {}",
                    project.name, result.exit_code
                ));
            }
            records.push(project_record(project, result));
        }

        let successful = results.iter().filter(|r| r.success()).count() as i64;
        let failed = results.len() as i64 - successful;
        let success = fatal.is_none() && failed == 0;

        let error = fatal.map(|e| {
            let message = e.to_string();
            run.journal.error(format!("Workflow Failed: {message}"));
            let _ = writeln!(full_log, "\nFATAL ERROR: {message}");
            message
        });
        if error.is_none() && !success {
            run.journal.error("Build failures detected!");
        }

        if let (Some(ledger), Some(run_id)) = (&self.ledger, run.run_id) {
            for mut record in records {
                record.run_id = run_id;
                if let Err(e) = ledger.add_project_record(&record).await {
                    run.journal.error(format!(
                        "Warning: Failed to log project record for {} to DB: {e}",
                        record.project_name
                    ));
                }
            }

            let finalization = Finalization {
                success,
                duration_ms,
                log_file_path: run
                    .journal
                    .summary_path()
                    .map(|p| p.display().to_string()),
                error_log_file_path: run
                    .journal
                    .error_path()
                    .map(|p| p.display().to_string()),
                successful_projects: successful,
                failed_projects: failed,
                full_log: full_log.clone(),
            };
            match ledger.finalize_run(run_id, &finalization).await {
                Ok(()) => info!(run_id, duration_ms, success, "build record updated"),
                Err(e) => run
                    .journal
                    .warn(format!("Warning: Failed to update build record: {e}")),
            }
        }

        run.enter(if success {
            WorkflowPhase::Completed
        } else {
            WorkflowPhase::Failed
        });
        let journal = run.journal.close().await;

        WorkflowResult {
            success,
            run_id: run.run_id,
            build_results: results,
            full_log,
            logs: journal.lines,
            error,
        }
    }
}

fn append_project_log(full_log: &mut String, result: &ProjectResult) {
    let _ = writeln!(full_log, "--- Project: {} ---", result.project);
    let _ = writeln!(full_log, "> {}", result.command);
    let _ = writeln!(full_log, "{}", result.stdout);
    if !result.stderr.is_empty() {
        let _ = writeln!(full_log, "[STDERR]: {}", result.stderr);
    }
    full_log.push('\n');
}

/// Ledger record for one project; `run_id` is filled in by the caller.
fn project_record(project: &ProjectSpec, result: &ProjectResult) -> NewProjectRecord {
    let success = result.success();
    let error_message = (!success && !result.stderr.trim().is_empty())
        .then(|| result.stderr.clone());
    NewProjectRecord {
        run_id: 0,
        project_name: project.name.clone(),
        project_path: project.path.clone(),
        success,
        exit_code: result.exit_code,
        command: result.command.clone(),
        error_message,
        node_version: project.node_version.clone(),
        log_content: format!(
            "[CMD] {}\n[EXIT] {}\n[STDOUT]\n{}\n[STDERR]\n{}",
            result.command, result.exit_code, result.stdout, result.stderr
        ),
    }
}
