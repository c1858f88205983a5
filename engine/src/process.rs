//! Process Runner - spawns one build command and captures its output
//!
//! Output is read line by line from both pipes while the child runs, so a
//! build that dies half way still leaves everything it printed in the result
//! and in its transcript. Lines keep their arrival order within a stream;
//! stdout and stderr are interleaved in whatever order they arrive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Invalid command line: {0}")]
    Parse(#[from] shell_words::ParseError),
}

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "[OUT]",
            OutputStream::Stderr => "[ERR]",
        }
    }
}

/// One line of live build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Label of the invocation, usually the project name
    pub source: String,
    pub stream: OutputStream,
    pub line: String,
}

/// Receives every captured line exactly once, in arrival order per stream.
pub type LineSink = mpsc::UnboundedSender<OutputLine>;

/// A fully resolved command ready to spawn.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Merged over the inherited environment
    pub env: HashMap<String, String>,
    /// Per-invocation transcript file
    pub transcript: Option<PathBuf>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<String>, working_dir: &Path) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
            env: HashMap::new(),
            transcript: None,
        }
    }

    /// Split a command line such as `npm run build -- --mode "prod"` into
    /// program and arguments.
    pub fn from_command_line(
        label: impl Into<String>,
        command_line: &str,
        working_dir: &Path,
    ) -> Result<Self, ProcessError> {
        let mut words = shell_words::split(command_line)?;
        if words.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        let mut program = words.remove(0);
        // npm is a batch script on Windows and cannot be spawned directly.
        if cfg!(windows) && program == "npm" {
            words.insert(0, program);
            words.insert(0, "/c".to_string());
            program = "cmd".to_string();
        }
        let mut invocation = Self::new(label, program, working_dir);
        invocation.args = words;
        Ok(invocation)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript = Some(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Captured outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub command: String,
    /// -1 when the process never started or was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn launch_failure(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `invocation` to completion.
///
/// Never fails: launch errors come back as a result with `exit_code == -1`
/// and the error text in `stderr`, so one broken project cannot take down a
/// whole batch.
pub async fn run(invocation: &Invocation, sink: Option<&LineSink>) -> ProcessResult {
    let command = invocation.command_line();
    let mut transcript = match &invocation.transcript {
        Some(path) => Transcript::create(path).await,
        None => Transcript::disabled(),
    };

    let working_dir = match tokio::fs::canonicalize(&invocation.working_dir).await {
        Ok(dir) => dir,
        Err(e) => {
            let reason = format!(
                "Working directory {} is not accessible: {e}",
                invocation.working_dir.display()
            );
            warn!(source = %invocation.label, "{reason}");
            transcript.header(&command, &invocation.working_dir).await;
            transcript.write_line(&format!("EXCEPTION: {reason}")).await;
            transcript.finish().await;
            return ProcessResult::launch_failure(command, reason);
        }
    };
    transcript.header(&command, &working_dir).await;

    let spawned = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&working_dir)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("Failed to start '{}': {e}", invocation.program);
            warn!(source = %invocation.label, "{reason}");
            transcript.write_line(&format!("EXCEPTION: {reason}")).await;
            transcript.finish().await;
            return ProcessResult::launch_failure(command, reason);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some((stream, line)) = rx.recv().await {
        let buffer = match stream {
            OutputStream::Stdout => &mut stdout,
            OutputStream::Stderr => &mut stderr,
        };
        buffer.push_str(&line);
        buffer.push('\n');

        debug!(source = %invocation.label, stream = ?stream, "{line}");
        transcript
            .write_line(&format!("{} {line}", stream.tag()))
            .await;
        if let Some(sink) = sink {
            // A dropped receiver only means nobody is watching live output.
            let _ = sink.send(OutputLine {
                source: invocation.label.clone(),
                stream,
                line,
            });
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            let reason = format!("Failed to wait for '{}': {e}", invocation.program);
            warn!(source = %invocation.label, "{reason}");
            stderr.push_str(&reason);
            stderr.push('\n');
            transcript.write_line(&format!("EXCEPTION: {reason}")).await;
            -1
        }
    };
    transcript.finish().await;

    info!(source = %invocation.label, exit_code, "process exited");
    ProcessResult {
        command,
        exit_code,
        stdout,
        stderr,
    }
}

/// Read `reader` until EOF, sending each line without its terminator.
/// Invalid UTF-8 is replaced rather than aborting the capture.
async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = ?stream, "output pipe read failed: {e}");
                break;
            }
        }
    }
}

/// Best-effort transcript writer; the first write error disables it.
struct Transcript {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl Transcript {
    fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    async fn create(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        match File::create(path).await {
            Ok(file) => Self {
                path: Some(path.to_path_buf()),
                file: Some(file),
            },
            Err(e) => {
                warn!(path = %path.display(), "failed to create transcript: {e}");
                Self::disabled()
            }
        }
    }

    async fn header(&mut self, command: &str, working_dir: &Path) {
        self.write_line(&format!("=== Build Log for {command} ==="))
            .await;
        self.write_line(&format!("Dir: {}", working_dir.display()))
            .await;
        self.write_line(&format!(
            "Time: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ))
        .await;
        self.write_line("=========================================")
            .await;
    }

    async fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        if let Err(e) = file.write_all(&bytes).await {
            if let Some(path) = &self.path {
                warn!(path = %path.display(), "transcript write failed: {e}");
            }
            self.file = None;
        }
    }

    async fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!("transcript flush failed: {e}");
            }
        }
    }
}
