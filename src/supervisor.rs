//! Stopping runs and reconciling records with the process table

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::admission::renumber_queue;
use crate::error::{Failure, HostError};
use crate::host::Host;
use crate::process::{descendants, is_alive, terminate, Termination};
use crate::run::archive_run;
use crate::store::records::{ProgramStatus, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No worker was recorded; nothing to stop
    AlreadyCompleted,
    /// A worker was recorded but no longer exists
    WorkerGone,
    Stopped(Termination),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub outcome: StopOutcome,
    /// Non-fatal problems met on the way
    pub warnings: Vec<String>,
}

/// Records marked as lost by [`Host::reconcile`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub programs: Vec<String>,
    pub runs: Vec<String>,
}

impl Host {
    /// Terminate a run's worker and everything it started, then mark the run
    /// `Completed (terminated)` and archive what it produced so far.
    pub async fn request_stop(&self, program: &str, purpose: &str) -> Result<StopReport> {
        let record = self
            .tables
            .runs
            .find(|r| r.is(program, purpose))?
            .ok_or_else(|| HostError::Rejected(format!("Run {}/{} not found", program, purpose)))?;

        let pid = match record.pid {
            Some(pid) if !record.status.is_terminal() => pid,
            _ => {
                return Ok(StopReport {
                    outcome: StopOutcome::AlreadyCompleted,
                    warnings: Vec::new(),
                })
            }
        };

        let mut warnings = Vec::new();
        let outcome = if is_alive(pid) {
            // deepest first
            for child in descendants(pid).into_iter().rev() {
                match terminate(child, self.config.stop_timeout()).await {
                    Ok(Termination::StillAlive) => warnings.push(format!("Child process {} survived SIGKILL", child)),
                    Ok(_) => {}
                    Err(e) => warnings.push(format!("Failed to stop child process {}: {:#}", child, e)),
                }
            }
            let termination = terminate(pid, self.config.stop_timeout())
                .await
                .with_context(|| format!("Failed to stop pid {}", pid))?;
            if termination == Termination::StillAlive {
                warnings.push(format!("Worker {} did not exit in time", pid));
            }
            StopOutcome::Stopped(termination)
        } else {
            StopOutcome::WorkerGone
        };

        self.tables.runs.update(|rows| {
            if let Some(row) = rows.iter_mut().find(|r| r.is(program, purpose)) {
                row.status = RunStatus::Terminated;
                row.pid = None;
            }
            renumber_queue(rows);
            Ok(())
        })?;

        let workspace = self.config.run_dir(program, purpose);
        if workspace.exists() {
            if let Err(e) = archive_run(&workspace, &record.id()).await {
                warnings.push(format!("Failed to archive the run: {:#}", e));
            }
        }

        for warning in &warnings {
            warn!("Stopping {}: {}", record.id(), warning);
        }
        info!("Run {} stopped ({:?})", record.id(), outcome);
        Ok(StopReport { outcome, warnings })
    }

    /// Mark installs and runs whose recorded worker no longer exists as lost
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let programs = self.tables.programs.update(|rows| {
            let mut lost = Vec::new();
            for row in rows.iter_mut().filter(|r| !r.status.is_terminal()) {
                if row.pid.is_some_and(|pid| !is_alive(pid)) {
                    row.status = ProgramStatus::Failed(Failure::WorkerLost.install_code());
                    row.pid = None;
                    lost.push(row.name.clone());
                }
            }
            Ok(lost)
        })?;

        let runs = self.tables.runs.update(|rows| {
            let mut lost = Vec::new();
            for row in rows.iter_mut().filter(|r| !r.status.is_terminal()) {
                if row.pid.is_some_and(|pid| !is_alive(pid)) {
                    row.status = RunStatus::Failed(Failure::WorkerLost.run_code());
                    row.pid = None;
                    lost.push(row.id());
                }
            }
            renumber_queue(rows);
            Ok(lost)
        })?;

        let report = ReconcileReport { programs, runs };
        for name in &report.programs {
            warn!("Installation of {} lost its worker", name);
        }
        for id in &report.runs {
            warn!("Run {} lost its worker", id);
        }
        Ok(report)
    }
}
