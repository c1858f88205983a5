//! Dependency Preparer - links a shared `node_modules` into each project.

use std::path::{Path, PathBuf};

use shared_types::{ProjectSpec, NODE_MODULES_DIR};
use tracing::{info, warn};

/// What [`ensure_linked`] did for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Project declares no shared dependency directory
    Skipped,
    /// `node_modules` (directory or link) is already in place
    AlreadyPresent { link: PathBuf },
    Created { link: PathBuf, target: PathBuf },
    /// Configured shared directory does not exist under the root
    TargetMissing { target: PathBuf },
    Failed {
        link: PathBuf,
        target: PathBuf,
        reason: String,
    },
}

impl LinkOutcome {
    /// Human-readable line for the run transcript.
    pub fn describe(&self, project: &str) -> String {
        match self {
            LinkOutcome::Skipped => format!("No shared node_modules configured for {project}"),
            LinkOutcome::AlreadyPresent { .. } => {
                format!("node_modules already exists for {project}")
            }
            LinkOutcome::Created { link, target } => format!(
                "Symlink created for {project}: {} -> {}",
                link.display(),
                target.display()
            ),
            LinkOutcome::TargetMissing { target } => {
                format!("Warning: Target node_modules not found: {}", target.display())
            }
            LinkOutcome::Failed { reason, .. } => {
                format!("Warning: Failed to create symlink for {project}: {reason}")
            }
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            LinkOutcome::TargetMissing { .. } | LinkOutcome::Failed { .. }
        )
    }
}

/// Make sure `<project>/node_modules` points at the project's shared
/// dependency directory. Never fails the run; problems come back as
/// [`LinkOutcome::TargetMissing`] or [`LinkOutcome::Failed`].
pub async fn ensure_linked(project: &ProjectSpec, root_dir: &Path) -> LinkOutcome {
    let Some(shared) = project.relative_node_modules_dir() else {
        return LinkOutcome::Skipped;
    };

    let link = root_dir
        .join(project.relative_path())
        .join(NODE_MODULES_DIR);
    if tokio::fs::symlink_metadata(&link).await.is_ok() {
        info!(project = %project.name, link = %link.display(), "node_modules already present");
        return LinkOutcome::AlreadyPresent { link };
    }

    let target = root_dir.join(shared);
    if !tokio::fs::metadata(&target)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        warn!(project = %project.name, target = %target.display(), "shared node_modules not found");
        return LinkOutcome::TargetMissing { target };
    }

    match create_dir_link(&target, &link).await {
        Ok(()) => {
            info!(
                project = %project.name,
                link = %link.display(),
                target = %target.display(),
                "node_modules symlink created"
            );
            LinkOutcome::Created { link, target }
        }
        Err(e) => {
            warn!(project = %project.name, link = %link.display(), "symlink creation failed: {e}");
            LinkOutcome::Failed {
                link,
                target,
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(unix)]
async fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}
