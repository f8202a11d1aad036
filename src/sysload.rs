//! CPU utilization sampling for run admission

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Source of the current CPU utilization
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Utilization in percent (0-100) over the probe's window
    async fn cpu_percent(&self) -> Result<f32>;
}

/// Aggregate counters from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
}

impl CpuTimes {
    /// Parse `cpu  user nice system idle iowait irq softirq steal ...`
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|v| v.parse().ok())
            .collect::<Option<_>>()?;
        if values.len() < 4 {
            return None;
        }

        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let total: u64 = values.iter().sum();
        Some(Self {
            busy: total - idle,
            idle,
        })
    }

    /// Utilization between two samples
    pub fn percent_since(&self, earlier: &CpuTimes) -> f32 {
        let busy = self.busy.saturating_sub(earlier.busy);
        let idle = self.idle.saturating_sub(earlier.idle);
        let total = busy + idle;
        if total == 0 {
            return 0.0;
        }
        busy as f32 * 100.0 / total as f32
    }
}

/// Samples `/proc/stat` twice, `window` apart
#[derive(Debug, Clone)]
pub struct ProcStatProbe {
    window: Duration,
}

impl ProcStatProbe {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    async fn sample() -> Result<CpuTimes> {
        let stat = tokio::fs::read_to_string("/proc/stat")
            .await
            .context("Failed to read /proc/stat")?;
        CpuTimes::parse(&stat).context("Unexpected /proc/stat format")
    }
}

#[async_trait]
impl LoadProbe for ProcStatProbe {
    async fn cpu_percent(&self) -> Result<f32> {
        let first = Self::sample().await?;
        tokio::time::sleep(self.window).await;
        let second = Self::sample().await?;
        Ok(second.percent_since(&first))
    }
}
