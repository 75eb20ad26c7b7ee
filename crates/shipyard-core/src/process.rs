//! External command execution shared by the docker, git and migration adapters.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// A command to run, with optional working directory and timeout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command as a single display string.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl CommandOutput {
    /// stderr when present, stdout otherwise; trimmed.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Why a command produced no output.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {secs} seconds")]
    TimedOut { command: String, secs: u64 },
}

/// Run a command to completion, capturing its output.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::success`] and classify the failure themselves.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();

    let Some((exe, args)) = spec.command.split_first() else {
        return Err(CommandError::Empty);
    };

    let mut command = Command::new(exe);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|source| CommandError::Spawn {
        program: exe.clone(),
        source,
    })?;

    let output = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| CommandError::TimedOut {
                command: spec.display(),
                secs: limit.as_secs(),
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|source| CommandError::Spawn {
        program: exe.clone(),
        source,
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        success: output.status.success(),
    })
}
