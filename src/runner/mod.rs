//! Runner module - process execution layer
//!
//! This module provides the two ways the host starts processes:
//! - `ShellRunner`: runs an external step (conda, pip, git, the program
//!   itself) to completion and captures its combined output
//! - `DetachedLauncher`: starts a worker that outlives the caller, at reduced
//!   priority, with stdout/stderr going to a log file
//!
//! The runner module does NOT:
//! - Decide what a non-zero exit means for a record's status
//! - Wait for detached workers

pub mod detached;
pub mod shell;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::error::HostError;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key=value)
    pub env: Vec<String>,
    /// Working directory
    pub work_dir: Option<std::path::PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    /// `<shell> -c <script>`
    pub fn shell(shell: &str, script: impl Into<String>) -> Self {
        Self::new(shell).with_args(["-c".to_string(), script.into()])
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.clone());
        v
    }

    /// Environment as (key, value) pairs; malformed entries are ignored
    pub(crate) fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|kv| kv.split_once('='))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_vec().join(" "))
    }
}

/// Exit code reported for a command killed by a signal
pub const KILLED_BY_SIGNAL: i32 = -1;

/// Result of a command run to completion
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// Exit code ([`KILLED_BY_SIGNAL`] when killed by a signal)
    pub code: i32,
    /// stdout followed by stderr
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external commands to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Run a command, log its output and fail on a non-zero exit
pub async fn run_checked(runner: &dyn CommandRunner, cmd: &CommandSpec) -> Result<CommandOutput> {
    info!("Running: {}", cmd);
    let out = runner.run(cmd).await?;
    if !out.output.is_empty() {
        info!("Output of `{}`:\n{}", cmd, out.output.trim_end());
    }

    if !out.success() {
        return Err(HostError::CommandFailed {
            command: cmd.to_string(),
            code: out.code,
            output: out.output,
        }
        .into());
    }

    Ok(out)
}

/// A started detached process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Starts processes that outlive the caller
pub trait Launcher: Send + Sync {
    /// Start `cmd` with stdout and stderr written to `log_path`.
    ///
    /// Returns as soon as the process exists; failing to start it at all is
    /// an error.
    fn launch(&self, cmd: &CommandSpec, log_path: &Path) -> Result<ProcessHandle>;
}

// Re-exports
pub use detached::DetachedLauncher;
pub use shell::ShellRunner;
