//! Run-wide transcripts.
//!
//! Layout below the configured logs directory:
//! ```text
//! builds/build_<tag>/_summary.log   every workflow message
//! builds/build_<tag>/<project>.log  one process transcript per project
//! errors/error_<tag>.log            error messages only, removed when empty
//! ```
//!
//! Lines are short appends made from the run's own task and go straight
//! through `std::fs`. Flushing and removing the files on close happen on the
//! blocking pool.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

const SUMMARY_FILE: &str = "_summary.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Collects workflow messages in memory and mirrors them to the summary and
/// error transcripts. Files that cannot be created are skipped; the
/// in-memory log is always kept.
pub struct RunJournal {
    run_dir: PathBuf,
    summary_path: PathBuf,
    error_path: PathBuf,
    summary: Option<File>,
    errors: Option<File>,
    lines: Vec<String>,
    has_errors: bool,
}

/// What is left of a journal once the run is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedJournal {
    pub lines: Vec<String>,
    pub summary_path: Option<PathBuf>,
    /// Only set when at least one error was recorded
    pub error_path: Option<PathBuf>,
}

impl RunJournal {
    pub fn open(logs_dir: &Path, tag: &str) -> Self {
        let run_dir = logs_dir.join("builds").join(format!("build_{tag}"));
        let errors_dir = logs_dir.join("errors");
        let summary_path = run_dir.join(SUMMARY_FILE);
        let error_path = errors_dir.join(format!("error_{tag}.log"));

        let summary = create_file(&run_dir, &summary_path);
        let errors = create_file(&errors_dir, &error_path);

        Self {
            run_dir,
            summary_path,
            error_path,
            summary,
            errors,
            lines: Vec::new(),
            has_errors: false,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Transcript path for one project's build process.
    pub fn project_transcript(&self, project: &str) -> PathBuf {
        self.run_dir.join(format!("{project}.log"))
    }

    pub fn summary_path(&self) -> Option<&Path> {
        self.summary.as_ref().map(|_| self.summary_path.as_path())
    }

    /// Error transcript path, once something has been written to it.
    pub fn error_path(&self) -> Option<&Path> {
        (self.has_errors && self.errors.is_some()).then_some(self.error_path.as_path())
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.record(Level::Info, message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.record(Level::Warn, message.as_ref());
    }

    /// Also lands in the error transcript.
    pub fn error(&mut self, message: impl AsRef<str>) {
        self.record(Level::Error, message.as_ref());
    }

    fn record(&mut self, level: Level, message: &str) {
        match level {
            Level::Info => info!("{message}"),
            Level::Warn => warn!("{message}"),
            Level::Error => error!("{message}"),
        }

        let line = format!(
            "{} - {message}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        write_line(&mut self.summary, &line);
        if level == Level::Error {
            self.has_errors = true;
            write_line(&mut self.errors, &line);
        }
        self.lines.push(line);
    }

    /// Close both transcripts and delete the error transcript if nothing was
    /// written to it.
    pub async fn close(mut self) -> ClosedJournal {
        let summary_path = self.summary_path().map(Path::to_path_buf);
        if let Some(path) = &summary_path {
            self.info(format!("Logs saved to: {}", path.display()));
        }
        let error_path = if self.has_errors && self.errors.is_some() {
            let path = self.error_path.clone();
            self.info(format!("Error log saved to: {}", path.display()));
            Some(path)
        } else {
            None
        };

        let files: Vec<File> = [self.summary.take(), self.errors.take()]
            .into_iter()
            .flatten()
            .collect();
        let stale_error_log = (!self.has_errors).then(|| self.error_path.clone());
        let cleanup = tokio::task::spawn_blocking(move || {
            for file in files {
                if let Err(e) = file.sync_all() {
                    warn!("failed to flush run transcript: {e}");
                }
            }
            if let Some(path) = stale_error_log.filter(|p| p.exists()) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove empty error log: {e}");
                }
            }
        });
        if let Err(e) = cleanup.await {
            warn!("run transcript cleanup failed: {e}");
        }

        ClosedJournal {
            lines: self.lines,
            summary_path,
            error_path,
        }
    }
}

fn create_file(dir: &Path, path: &Path) -> Option<File> {
    let created = std::fs::create_dir_all(dir).and_then(|_| File::create(path));
    match created {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), "failed to create run transcript: {e}");
            None
        }
    }
}

fn write_line(file: &mut Option<File>, line: &str) {
    if let Some(f) = file.as_mut() {
        if let Err(e) = writeln!(f, "{line}") {
            warn!("run transcript write failed: {e}");
            *file = None;
        }
    }
}
