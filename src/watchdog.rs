//! Limit enforcement thread.
//!
//! One watchdog per run polls the group's counters on a fixed tick and
//! fires at most once. Checks run in a fixed order so that a single
//! tick observing several breaches reports a deterministic reason:
//! external cancellation, then memory, then CPU time, then wall time.
//! The kill itself happens on the watchdog thread; the executor learns
//! of the trigger through an atomic and bounds its own drain wait.

use crate::cgroup::CgroupHandle;
use crate::error::Result;
use crate::killer;
use crate::spec::ResourceLimits;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Memory is considered at its ceiling when current usage is within
/// this margin of the limit (the kernel clamps usage below the limit,
/// so exact equality is rarely observable).
const MEMORY_HEADROOM: u64 = 1024 * 1024;

/// Cooperative cancellation for an in-flight run. Cloneable; cancelling
/// any clone terminates the run's whole process tree.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the watchdog fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Trigger {
    Cancelled,
    Memory,
    Cpu,
    Wall,
}

impl Trigger {
    fn as_u8(self) -> u8 {
        match self {
            Trigger::Cancelled => 1,
            Trigger::Memory => 2,
            Trigger::Cpu => 3,
            Trigger::Wall => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Trigger> {
        match raw {
            1 => Some(Trigger::Cancelled),
            2 => Some(Trigger::Memory),
            3 => Some(Trigger::Cpu),
            4 => Some(Trigger::Wall),
            _ => None,
        }
    }
}

pub(crate) struct Watchdog {
    stop_tx: Sender<()>,
    fired: Arc<AtomicU8>,
    handle: JoinHandle<Option<Trigger>>,
}

impl Watchdog {
    pub(crate) fn start(
        group: Arc<CgroupHandle>,
        limits: &ResourceLimits,
        started: Instant,
        token: CancelToken,
        poll_interval: Duration,
        kill_grace: Duration,
    ) -> Result<Watchdog> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let fired = Arc::new(AtomicU8::new(0));
        let limits = limits.clone();
        let fired_in_thread = Arc::clone(&fired);

        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", group.id()))
            .spawn(move || {
                let ticker = tick(poll_interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => return None,
                        recv(ticker) -> _ => {
                            if let Some(trigger) = check(&group, &limits, started, &token) {
                                fired_in_thread.store(trigger.as_u8(), Ordering::SeqCst);
                                log::info!(
                                    "watchdog fired ({:?}) for group {}",
                                    trigger,
                                    group.id()
                                );
                                if let Err(err) = killer::kill_group(&group, kill_grace) {
                                    log::error!(
                                        "kill after {:?} trigger failed: {}",
                                        trigger,
                                        err
                                    );
                                }
                                // Park until the executor joins us.
                                let _ = stop_rx.recv();
                                return Some(trigger);
                            }
                        }
                    }
                }
            })?;

        Ok(Watchdog {
            stop_tx,
            fired,
            handle,
        })
    }

    /// The trigger recorded so far, if any. Visible to the executor
    /// before the thread is joined.
    pub(crate) fn trigger(&self) -> Option<Trigger> {
        Trigger::from_u8(self.fired.load(Ordering::SeqCst))
    }

    /// Idempotent; wakes the thread whether it is ticking or parked.
    pub(crate) fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub(crate) fn join(self) -> Option<Trigger> {
        self.stop();
        match self.handle.join() {
            Ok(trigger) => trigger,
            Err(_) => {
                log::error!("watchdog thread panicked");
                Trigger::from_u8(self.fired.load(Ordering::SeqCst))
            }
        }
    }
}

fn check(
    group: &CgroupHandle,
    limits: &ResourceLimits,
    started: Instant,
    token: &CancelToken,
) -> Option<Trigger> {
    if token.is_cancelled() {
        return Some(Trigger::Cancelled);
    }

    // Counters can vanish mid-poll while a kill races group teardown;
    // skip the cycle rather than misfire.
    let usage = match group.usage() {
        Ok(usage) => Some(usage),
        Err(err) => {
            log::debug!("usage poll failed for group {}: {}", group.id(), err);
            None
        }
    };

    if let Some(limit) = limits.memory {
        match group.oom_kills() {
            Ok(kills) if kills > 0 => return Some(Trigger::Memory),
            Ok(_) => {}
            Err(err) => log::debug!("oom counter poll failed: {}", err),
        }
        if let Some(usage) = &usage {
            let headroom = (limit / 20).min(MEMORY_HEADROOM);
            if usage.current_memory.saturating_add(headroom) >= limit {
                return Some(Trigger::Memory);
            }
        }
    }

    if let (Some(limit), Some(usage)) = (limits.cpu_time, &usage) {
        if usage.cpu_time >= limit {
            return Some(Trigger::Cpu);
        }
    }

    if let Some(limit) = limits.wall_time {
        if started.elapsed() >= limit {
            return Some(Trigger::Wall);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_codes_round_trip() {
        for trigger in [Trigger::Cancelled, Trigger::Memory, Trigger::Cpu, Trigger::Wall] {
            assert_eq!(Trigger::from_u8(trigger.as_u8()), Some(trigger));
        }
        assert_eq!(Trigger::from_u8(0), None);
        assert_eq!(Trigger::from_u8(99), None);
    }

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        // Cancelling twice is fine.
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
