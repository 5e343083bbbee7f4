//! Freeze-then-signal termination of a run's whole process tree.
//!
//! Signalling a live tree member by member races against fork: a process
//! can spawn a child between enumeration and delivery. Freezing the
//! group first parks every member, so the sweep sees a stable snapshot.
//! Frozen tasks only act on queued signals once thawed, hence the
//! freeze, sweep, thaw ordering. If members survive the graceful phase,
//! bounded SIGKILL sweeps escalate until the group is empty.

use crate::cgroup::CgroupHandle;
use crate::error::{Result, RunError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::thread;
use std::time::{Duration, Instant};

/// Time a tree gets between SIGTERM and the first SIGKILL sweep.
pub(crate) const DEFAULT_GRACE: Duration = Duration::from_millis(250);

/// Upper bound on freeze-kill-thaw escalation rounds.
const MAX_KILL_SWEEPS: u32 = 20;
/// Pause between escalation rounds.
const SWEEP_PAUSE: Duration = Duration::from_millis(50);
/// Poll cadence while waiting out the graceful phase.
const GRACE_POLL: Duration = Duration::from_millis(10);

/// Worst-case duration of a full [`kill_group`] escalation, used by the
/// executor to bound how long it waits for a triggered kill to land.
pub(crate) fn kill_window(grace: Duration) -> Duration {
    grace + SWEEP_PAUSE * MAX_KILL_SWEEPS + Duration::from_millis(500)
}

/// SIGKILL a single pid, tolerating processes that are already gone.
pub(crate) fn send_sigkill(pid: u32) {
    signal_member(pid, Signal::SIGKILL);
}

fn signal_member(pid: u32, sig: Signal) {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {}
        // Exited between enumeration and delivery.
        Err(Errno::ESRCH) => {}
        Err(err) => log::warn!("failed to send {} to pid {}: {}", sig, pid, err),
    }
}

/// Terminate every process in `group`: freeze, SIGTERM sweep, thaw,
/// grace period, then escalating SIGKILL sweeps until the group is
/// empty. Returns [`RunError::KillTimeout`] if members survive all
/// sweeps, which points at a kernel-side wedge (unkillable D-state
/// tasks) rather than a misbehaving run.
pub(crate) fn kill_group(group: &CgroupHandle, grace: Duration) -> Result<()> {
    if group.is_empty()? {
        return Ok(());
    }

    if let Err(err) = group.freeze() {
        log::warn!("freeze before SIGTERM sweep failed: {}", err);
    }
    let members = group.procs()?;
    log::debug!(
        "terminating group {}: {} member(s) get SIGTERM",
        group.id(),
        members.len()
    );
    for pid in &members {
        signal_member(*pid, Signal::SIGTERM);
    }
    group.thaw()?;

    let grace_deadline = Instant::now() + grace;
    while Instant::now() < grace_deadline {
        if group.is_empty()? {
            return Ok(());
        }
        thread::sleep(GRACE_POLL);
    }

    for sweep in 0..MAX_KILL_SWEEPS {
        if group.is_empty()? {
            return Ok(());
        }
        if let Err(err) = group.freeze() {
            log::warn!("freeze before SIGKILL sweep {} failed: {}", sweep, err);
        }
        // Kernels with cgroup.kill take out the frozen tree in one write.
        if let Some(kill_file) = group.kill_file() {
            if let Err(err) = std::fs::write(&kill_file, "1") {
                log::warn!("write to {} failed: {}", kill_file.display(), err);
            }
        }
        for pid in group.procs()? {
            send_sigkill(pid);
        }
        group.thaw()?;
        thread::sleep(SWEEP_PAUSE);
    }

    let survivors = group.procs()?;
    if survivors.is_empty() {
        return Ok(());
    }
    Err(RunError::KillTimeout(format!(
        "group {} still has {} member(s) after {} SIGKILL sweeps: {:?}",
        group.id(),
        survivors.len(),
        MAX_KILL_SWEEPS,
        survivors
    )))
}
