//! Host context shared by every orchestrator operation

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::warn;

use crate::config::HostConfig;
use crate::notify::{Notifier, SendmailNotifier};
use crate::runner::{CommandRunner, CommandSpec, DetachedLauncher, Launcher, ShellRunner};
use crate::store::records::RunStatus;
use crate::store::Tables;
use crate::sysload::{LoadProbe, ProcStatProbe};

/// Outcome of a request that hands work to a detached worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Accepted; the worker runs as `pid`
    Started { pid: u32 },
    /// Refused, with a message for the user
    Rejected(String),
}

impl Submission {
    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Submission::Rejected(message.into())
    }
}

/// Work currently in flight on this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub installing: usize,
    /// Runs whose worker has not reached admission yet
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
}

/// Configuration, tables and the process/system seams
pub struct Host {
    pub(crate) config: HostConfig,
    pub(crate) tables: Tables,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) probe: Arc<dyn LoadProbe>,
    pub(crate) notifier: Arc<dyn Notifier>,
    interrupt: Notify,
}

impl Host {
    /// Create the storage layout under `config.root` and open the tables
    pub fn open(config: HostConfig) -> Result<Self> {
        for dir in [
            config.programs_dir(),
            config.runs_dir(),
            config.libs_dir(),
            config.files_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let tables = Tables::open(&config)?;
        let probe = ProcStatProbe::new(config.sample_window());
        let notifier = SendmailNotifier::from_config(&config);

        Ok(Self {
            config,
            tables,
            runner: Arc::new(ShellRunner),
            launcher: Arc::new(DetachedLauncher),
            probe: Arc::new(probe),
            notifier: Arc::new(notifier),
            interrupt: Notify::new(),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Counts of installs and runs that have not reached a terminal status
    pub fn activity(&self) -> Result<Activity> {
        let mut activity = Activity {
            installing: self
                .tables
                .programs
                .load()?
                .iter()
                .filter(|p| !p.status.is_terminal())
                .count(),
            ..Activity::default()
        };
        for run in self.tables.runs.load()? {
            match run.status {
                RunStatus::SetUp => activity.pending += 1,
                RunStatus::Queued(_) => activity.queued += 1,
                RunStatus::Running => activity.running += 1,
                _ => {}
            }
        }
        Ok(activity)
    }

    /// Interrupt the install or run this host is performing, as SIGTERM would.
    ///
    /// An interrupt sent before the work starts is kept until it does.
    pub fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    /// Resolves on [`Host::interrupt`], SIGTERM or SIGINT
    pub(crate) async fn interrupted(&self) {
        tokio::select! {
            _ = self.interrupt.notified() => {}
            _ = shutdown_signal() => {}
        }
    }

    /// `<shell> -c <script>` with the configured shell
    pub(crate) fn shell(&self, script: impl Into<String>) -> CommandSpec {
        CommandSpec::shell(&self.config.shell, script)
    }

    /// This executable in worker mode: `gep-host --config <cfg> worker <args>`
    pub(crate) fn worker_command(&self, args: &[&str]) -> Result<CommandSpec> {
        let exe = std::env::current_exe().context("Failed to locate the gep-host executable")?;
        let config = self
            .config
            .source_path
            .as_ref()
            .context("Worker mode needs a host opened from a config file")?;

        let mut full = vec![
            "--config".to_string(),
            config.display().to_string(),
            "worker".to_string(),
        ];
        full.extend(args.iter().map(|a| a.to_string()));

        Ok(CommandSpec::new(exe.display().to_string())
            .with_args(full)
            .with_work_dir(&self.config.root))
    }
}

/// Resolves when the worker receives SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
