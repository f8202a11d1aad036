//! Shell runner implementation
//!
//! Executes external steps directly and waits for them.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, CommandRunner, CommandSpec, KILLED_BY_SIGNAL};

/// Runner that executes commands on the host and captures their output
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running command: {:?}", cmd.to_vec());

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in cmd.env_pairs() {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(KILLED_BY_SIGNAL),
            output: combined,
        })
    }
}
