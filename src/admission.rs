//! CPU-gated FIFO admission for runs
//!
//! The queue lives in the runs table as `queue <rank>` statuses. Ranks are
//! only assigned or renumbered inside a locked `update`, so they stay dense
//! (`1..=K`) and promotion is strictly in rank order.

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Failure;
use crate::host::Host;
use crate::process::is_alive;
use crate::store::records::{RunRecord, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStep {
    Admitted,
    Queued { rank: u32 },
}

/// Close gaps in the queue ranks, keeping their order. Returns whether
/// anything changed.
pub fn renumber_queue(rows: &mut [RunRecord]) -> bool {
    let mut queued: Vec<(u32, usize)> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.status.queue_rank().map(|rank| (rank, i)))
        .collect();
    // stable: equal ranks keep table order
    queued.sort_by_key(|&(rank, _)| rank);

    let mut changed = false;
    for (new_rank, (rank, i)) in (1u32..).zip(queued) {
        if rank != new_rank {
            rows[i].status = RunStatus::Queued(new_rank);
            changed = true;
        }
    }
    changed
}

/// Mark queued runs whose worker is gone as lost. Returns their ids.
pub fn drop_dead_entries(rows: &mut [RunRecord], alive: impl Fn(u32) -> bool) -> Vec<String> {
    let mut dropped = Vec::new();
    for row in rows.iter_mut() {
        if let (RunStatus::Queued(_), Some(pid)) = (&row.status, row.pid) {
            if !alive(pid) {
                row.status = RunStatus::Failed(Failure::WorkerLost.run_code());
                row.pid = None;
                dropped.push(row.id());
            }
        }
    }
    if !dropped.is_empty() {
        renumber_queue(rows);
    }
    dropped
}

/// One admission decision for `program/purpose`; the caller holds the lock.
pub fn admission_step(
    rows: &mut [RunRecord],
    program: &str,
    purpose: &str,
    load_ok: bool,
) -> Result<AdmissionStep> {
    renumber_queue(rows);

    let index = rows
        .iter()
        .position(|r| r.is(program, purpose))
        .with_context(|| format!("Run {}/{} has no record", program, purpose))?;
    let queued = rows.iter().filter(|r| r.status.queue_rank().is_some()).count() as u32;
    let current = rows[index].status.queue_rank();

    let first_in_line = match current {
        Some(rank) => rank == 1,
        None => queued == 0,
    };
    if load_ok && first_in_line {
        rows[index].status = RunStatus::Running;
        renumber_queue(rows);
        return Ok(AdmissionStep::Admitted);
    }

    let rank = match current {
        Some(rank) => rank,
        None => {
            rows[index].status = RunStatus::Queued(queued + 1);
            queued + 1
        }
    };
    Ok(AdmissionStep::Queued { rank })
}

impl Host {
    /// Block until the run may start, then leave it `running`
    pub async fn await_admission(&self, program: &str, purpose: &str) -> Result<()> {
        let threshold = self.config.admission.cpu_threshold;
        let mut last_rank = None;

        loop {
            let load_ok = match self.probe.cpu_percent().await {
                Ok(load) => load <= threshold,
                Err(e) => {
                    warn!("Failed to sample CPU load: {:#}", e);
                    false
                }
            };

            let (step, dropped) = self.tables.runs.update(|rows| {
                let dropped = drop_dead_entries(rows, is_alive);
                let step = admission_step(rows, program, purpose, load_ok)?;
                Ok((step, dropped))
            })?;
            for id in dropped {
                warn!("Run {} lost its worker while queued", id);
            }

            match step {
                AdmissionStep::Admitted => {
                    info!("Run {}/{} admitted", program, purpose);
                    return Ok(());
                }
                AdmissionStep::Queued { rank } => {
                    if last_rank != Some(rank) {
                        info!("Run {}/{} waiting in queue at {}", program, purpose, rank);
                        last_rank = Some(rank);
                    }
                }
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}
