//! Artifact Stager - copies build output into the shared output tree.

use std::path::{Path, PathBuf};

use shared_types::ProjectSpec;
use tracing::{info, warn};
use walkdir::WalkDir;

/// What [`stage`] did for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Copied {
        source: PathBuf,
        destination: PathBuf,
        files: usize,
    },
    /// Build output directory does not exist
    SourceMissing { source: PathBuf },
    Failed {
        source: PathBuf,
        destination: PathBuf,
        reason: String,
    },
}

impl StageOutcome {
    pub fn describe(&self) -> String {
        match self {
            StageOutcome::Copied {
                source,
                destination,
                files,
            } => format!(
                "Copied {} to {} ({files} files)",
                source.display(),
                destination.display()
            ),
            StageOutcome::SourceMissing { source } => {
                format!("Warning: Dist directory not found: {}", source.display())
            }
            StageOutcome::Failed {
                source,
                destination,
                reason,
            } => format!(
                "Error: Failed to copy {} to {}: {reason}",
                source.display(),
                destination.display()
            ),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }
}

/// `<root>/<path>/<dist_dir or "dist">`
pub fn source_dir(project: &ProjectSpec, root_dir: &Path) -> PathBuf {
    root_dir
        .join(project.relative_path())
        .join(project.dist_dir_name())
}

/// `<output>/<group>/<name>`, or `<output>/<name>` without a group
pub fn destination_dir(project: &ProjectSpec, output_dir: &Path) -> PathBuf {
    match project.group_name() {
        Some(group) => output_dir.join(group).join(&project.name),
        None => output_dir.join(&project.name),
    }
}

/// Copy the project's build output into the output tree, overwriting
/// existing files. Files already at the destination but absent from the
/// build output are left alone.
pub async fn stage(project: &ProjectSpec, root_dir: &Path, output_dir: &Path) -> StageOutcome {
    let source = source_dir(project, root_dir);
    let destination = destination_dir(project, output_dir);

    if !tokio::fs::metadata(&source)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        warn!(project = %project.name, source = %source.display(), "dist directory not found");
        return StageOutcome::SourceMissing { source };
    }

    let copy = {
        let source = source.clone();
        let destination = destination.clone();
        tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &destination)).await
    };

    match copy {
        Ok(Ok(files)) => {
            info!(
                project = %project.name,
                destination = %destination.display(),
                files,
                "artifacts staged"
            );
            StageOutcome::Copied {
                source,
                destination,
                files,
            }
        }
        Ok(Err(e)) => {
            warn!(project = %project.name, "artifact copy failed: {e}");
            StageOutcome::Failed {
                source,
                destination,
                reason: e.to_string(),
            }
        }
        Err(e) => StageOutcome::Failed {
            source,
            destination,
            reason: format!("copy task aborted: {e}"),
        },
    }
}

/// Recursively copy `source` into `destination`, creating directories as
/// needed. Returns the number of files copied.
pub fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(destination)?;
    let mut files = 0;
    for entry in WalkDir::new(source).follow_links(true).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}
