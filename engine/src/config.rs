use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shared_types::ProjectSpec;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid project '{name}': {reason}")]
    InvalidProject { name: String, reason: String },

    #[error("Duplicate project name '{0}'")]
    DuplicateProject(String),
}

/// Everything one engine instance needs for its lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Checkout root all project paths are relative to
    pub root_dir: PathBuf,
    /// Shared output tree artifacts are staged into
    pub output_dir: PathBuf,
    /// Directory holding `v<version>` Node.js installs
    #[serde(default)]
    pub node_root: Option<PathBuf>,
    /// Run and error transcripts are written below this directory
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// SQLite file backing the run ledger
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Upper bound on concurrently running build processes; 0 = unbounded
    #[serde(default = "default_max_parallel_builds")]
    pub max_parallel_builds: usize,
    #[serde(default)]
    pub projects: Vec<ProjectSpec>,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/builds.db")
}

fn default_max_parallel_builds() -> usize {
    4
}

impl EngineConfig {
    /// Config with default logs/database locations and no projects.
    pub fn new(root_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            output_dir: output_dir.into(),
            node_root: None,
            logs_dir: default_logs_dir(),
            database_path: default_database_path(),
            max_parallel_builds: default_max_parallel_builds(),
            projects: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            projects = config.projects.len(),
            "Loaded engine configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject project lists the workflow cannot run unambiguously.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for project in &self.projects {
            let name = project.name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidProject {
                    name: project.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ConfigError::InvalidProject {
                    name: project.name.clone(),
                    reason: "name must be a single path component".to_string(),
                });
            }
            if project.publish && project.build_cmd.trim().is_empty() {
                return Err(ConfigError::InvalidProject {
                    name: project.name.clone(),
                    reason: "publishable projects need a build command".to_string(),
                });
            }
            if !seen.insert(project.name.as_str()) {
                return Err(ConfigError::DuplicateProject(project.name.clone()));
            }
        }
        Ok(())
    }

    /// Projects that take part in build and staging, in configured order.
    pub fn publishable_projects(&self) -> Vec<ProjectSpec> {
        self.projects.iter().filter(|p| p.publish).cloned().collect()
    }

    pub fn project_dir(&self, project: &ProjectSpec) -> PathBuf {
        self.root_dir.join(project.relative_path())
    }
}
