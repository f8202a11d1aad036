//! OS process table access: liveness, descendants and termination

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Gone after SIGTERM (or already gone)
    Exited,
    /// Needed SIGKILL
    Killed,
    /// Still present after SIGKILL
    StillAlive,
}

/// `(state, ppid)` from the contents of `/proc/<pid>/stat`
pub fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // comm may contain spaces and parentheses
    let after_comm = stat.get(stat.rfind(')')? + 1..)?;
    let mut fields = after_comm.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn read_stat(pid: u32) -> Option<(char, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&stat)
}

/// Whether `pid` names a live (non-zombie) process
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !matches!(read_stat(pid), Some(('Z', _))),
        Err(Errno::ESRCH) => false,
        // exists but belongs to someone else
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Parent -> children map of the whole process table
pub fn process_tree() -> HashMap<u32, Vec<u32>> {
    let mut tree: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return tree;
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Some((_, ppid)) = read_stat(pid) {
            tree.entry(ppid).or_default().push(pid);
        }
    }
    tree
}

/// All descendants of `pid`, parents before their children
pub fn descendants(pid: u32) -> Vec<u32> {
    descendants_in(&process_tree(), pid)
}

pub fn descendants_in(tree: &HashMap<u32, Vec<u32>>, pid: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(next) = queue.pop_front() {
        for &child in tree.get(&next).into_iter().flatten() {
            if child != pid && !out.contains(&child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    out
}

/// Send `signal` to `pid`; a process that is already gone is not an error
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to send {} to pid {}: {}", signal, pid, e)),
    }
}

async fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL).await;
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL
#[cfg(unix)]
pub async fn terminate(pid: u32, timeout: Duration) -> Result<Termination> {
    use nix::sys::signal::Signal;

    if !is_alive(pid) {
        return Ok(Termination::Exited);
    }

    debug!("Sending SIGTERM to pid {}", pid);
    send_signal(pid, Signal::SIGTERM)?;
    if wait_gone(pid, timeout).await {
        return Ok(Termination::Exited);
    }

    warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, timeout);
    send_signal(pid, Signal::SIGKILL)?;
    if wait_gone(pid, KILL_GRACE).await {
        Ok(Termination::Killed)
    } else {
        Ok(Termination::StillAlive)
    }
}

#[cfg(not(unix))]
pub async fn terminate(pid: u32, _timeout: Duration) -> Result<Termination> {
    anyhow::bail!("Terminating pid {} is not supported on this platform", pid)
}
