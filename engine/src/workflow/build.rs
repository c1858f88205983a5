use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use shared_types::{ProjectResult, ProjectSpec};
use tokio::sync::Semaphore;

use super::{RunContext, RunState};
use crate::journal::RunJournal;
use crate::process::{self, Invocation, ProcessResult};

impl RunContext {
    /// Run every project's build command concurrently and wait for all of
    /// them. Results come back in project order.
    pub(super) async fn build_all(&self, run: &mut RunState) -> Vec<ProjectResult> {
        let limit = self.config.max_parallel_builds;
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));

        let mut prepared = Vec::with_capacity(run.projects.len());
        for project in &run.projects {
            prepared.push(self.prepare_invocation(project, &mut run.journal));
        }

        let tasks = prepared.into_iter().map(|prepared| {
            let semaphore = semaphore.clone();
            let sink = self.line_sink.clone();
            async move {
                let invocation = match prepared {
                    Ok(invocation) => invocation,
                    Err(rejected) => return rejected,
                };
                let command = invocation.command_line();
                let handle = tokio::spawn(async move {
                    // The semaphore is never closed, so acquiring cannot fail.
                    let _permit = match semaphore {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    process::run(&invocation, sink.as_ref()).await
                });
                match handle.await {
                    Ok(result) => result,
                    Err(e) => ProcessResult::launch_failure(command, format!("Build task aborted: {e}")),
                }
            }
        });
        let results = join_all(tasks).await;

        run.projects
            .iter()
            .zip(results)
            .map(|(project, result)| {
                run_summary_line(&mut run.journal, project, &result);
                ProjectResult {
                    project: project.name.clone(),
                    command: result.command,
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                }
            })
            .collect()
    }

    /// Resolve the command, working directory, environment and transcript
    /// for one project. A command line that cannot be parsed becomes a
    /// failed result without spawning anything.
    fn prepare_invocation(
        &self,
        project: &ProjectSpec,
        journal: &mut RunJournal,
    ) -> Result<Invocation, ProcessResult> {
        let project_dir = self.config.project_dir(project);
        let invocation =
            Invocation::from_command_line(&project.name, &project.build_cmd, &project_dir)
                .map_err(|e| {
                    journal.error(format!("Invalid build command for {}: {e}", project.name));
                    ProcessResult::launch_failure(project.build_cmd.clone(), e.to_string())
                })?;

        let mut invocation = invocation.transcript(journal.project_transcript(&project.name));
        if let Some(path) = self.node_path(project, journal) {
            invocation = invocation.env("PATH", path);
        }
        journal.info(format!(
            "[{}] {} (in {})",
            project.name,
            invocation.command_line(),
            project_dir.display()
        ));
        Ok(invocation)
    }

    /// `PATH` with the project's pinned Node.js install in front, when one
    /// is configured and present under `node_root`.
    fn node_path(&self, project: &ProjectSpec, journal: &mut RunJournal) -> Option<String> {
        let version = project
            .node_version
            .as_deref()
            .map(|v| v.trim().trim_start_matches('v'))
            .filter(|v| !v.is_empty())?;

        let Some(node_root) = &self.config.node_root else {
            journal.warn(format!(
                "Warning: Node version {version} specified for {} but node_root is not configured.",
                project.name
            ));
            return None;
        };

        let node_dir = node_root.join(format!("v{version}"));
        if !node_dir.is_dir() {
            journal.warn(format!(
                "Warning: Node version v{version} not found in node root: {}",
                node_dir.display()
            ));
            return None;
        }
        journal.info(format!(
            "[{}] Using specific Node: {}",
            project.name,
            node_dir.display()
        ));

        // nvm on Unix keeps binaries in bin/, nvm-windows at the top level.
        let mut entries: Vec<PathBuf> = Vec::new();
        let bin_dir = node_dir.join("bin");
        if bin_dir.is_dir() {
            entries.push(bin_dir);
        }
        entries.push(node_dir);
        if let Some(current) = std::env::var_os("PATH") {
            entries.extend(std::env::split_paths(&current));
        }
        match std::env::join_paths(entries) {
            Ok(joined) => Some(joined.to_string_lossy().into_owned()),
            Err(e) => {
                journal.warn(format!(
                    "Warning: Could not build PATH for {}: {e}",
                    project.name
                ));
                None
            }
        }
    }
}

fn run_summary_line(journal: &mut RunJournal, project: &ProjectSpec, result: &ProcessResult) {
    if result.success() {
        journal.info(format!("[{}] Build succeeded", project.name));
    } else {
        journal.info(format!(
            "[{}] Build exited with code {}",
            project.name, result.exit_code
        ));
    }
}
