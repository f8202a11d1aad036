//! Detached launcher implementation
//!
//! Workers run in their own session so they survive the caller, and are
//! reniced so heavy installs and runs do not starve the serving process.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::{CommandSpec, Launcher, ProcessHandle};

/// Nice value given to every launched worker
pub const LOW_PRIORITY: i32 = 10;

/// Launcher for long-running workers
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, cmd: &CommandSpec, log_path: &Path) -> Result<ProcessHandle> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let stdout = File::create(log_path)
            .with_context(|| format!("Failed to create log {}", log_path.display()))?;
        let stderr = stdout.try_clone().context("Failed to duplicate log handle")?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for (key, value) in cmd.env_pairs() {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let mut child = spawn_with_low_priority(&mut command)
            .with_context(|| format!("Failed to launch {}", cmd.program))?;
        let pid = child.id();

        // reap so a long-lived caller does not collect zombies
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        info!("Launched {} (pid {}), log {}", cmd, pid, log_path.display());
        Ok(ProcessHandle { pid })
    }
}

/// Spawn in a new session at reduced priority.
///
/// Failing to renice is logged and otherwise ignored.
#[cfg(unix)]
pub fn spawn_with_low_priority(command: &mut Command) -> io::Result<Child> {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }
    let child = command.spawn()?;

    // SAFETY: plain syscall on the pid we just spawned
    let rc = unsafe {
        nix::libc::setpriority(
            nix::libc::PRIO_PROCESS,
            child.id() as nix::libc::id_t,
            LOW_PRIORITY,
        )
    };
    if rc != 0 {
        warn!(
            "Failed to lower priority of pid {}: {}",
            child.id(),
            io::Error::last_os_error()
        );
    }

    Ok(child)
}

#[cfg(not(unix))]
pub fn spawn_with_low_priority(command: &mut Command) -> io::Result<Child> {
    warn!("Lowering process priority is not supported on this platform, spawning normally");
    command.spawn()
}
