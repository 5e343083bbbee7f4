//! Run orchestration.
//!
//! One [`RunExecutor`] per host facility; each `execute` call owns a
//! fresh control group, spawns the target enrolled in it, supervises it
//! with a watchdog thread, and only returns once the group is empty and
//! measured. The group is the sole source of truth for tree membership,
//! so completion means "no process of the run exists anymore", not
//! "the root exited".

use crate::cgroup::{self, CgroupHandle, CgroupVersion};
use crate::error::{Result, RunError};
use crate::host::{self, Topology};
use crate::killer;
use crate::measure;
use crate::result::{FinalUsage, LimitKind, RunResult, RunStatus};
use crate::spawn::{self, SpawnedChild};
use crate::spec::{ResourceLimits, RunSpec};
use crate::watchdog::{CancelToken, Trigger, Watchdog};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Cadence of the executor's own wait loop (root reap + tree-empty).
const REAP_POLL: Duration = Duration::from_millis(10);

pub struct RunExecutor {
    version: CgroupVersion,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl RunExecutor {
    /// Probe the host's cgroup facility and reclaim any groups left by
    /// crashed earlier invocations. Fails with `ResourceUnavailable`
    /// when a required facet (cpu accounting, memory, cpuset, freezer)
    /// is missing, so that per-run calls never have to discover this.
    pub fn new() -> Result<RunExecutor> {
        let version = cgroup::probe_facility()?;
        cgroup::reaper::reap_once(version);
        log::debug!("executor ready on cgroup {}", version.name());
        Ok(RunExecutor {
            version,
            poll_interval: DEFAULT_POLL_INTERVAL,
            kill_grace: killer::DEFAULT_GRACE,
        })
    }

    pub fn cgroup_version(&self) -> CgroupVersion {
        self.version
    }

    /// Limit-check cadence of the watchdog. Clamped to at least 1 ms.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Time a tree gets between SIGTERM and SIGKILL escalation.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Execute `spec` to completion. Blocks until every process of the
    /// run is gone and the final measurement is taken.
    pub fn execute(&self, spec: &RunSpec) -> Result<RunResult> {
        self.execute_with_token(spec, CancelToken::new())
    }

    /// Like [`execute`](Self::execute), but the run can be aborted from
    /// another thread through `token`; a cancelled run reports
    /// [`RunStatus::Cancelled`] with measurements intact.
    pub fn execute_with_token(&self, spec: &RunSpec, token: CancelToken) -> Result<RunResult> {
        spec.validate()?;

        let topology = Topology::probe()?;
        if let Some(cores) = &spec.limits.cores {
            topology.verify_cores(cores)?;
        }
        if let Some(nodes) = &spec.limits.memory_nodes {
            topology.verify_nodes(nodes)?;
        }
        // Held to the end of the run; concurrent runs with overlapping
        // pinning are refused rather than silently sharing cores.
        let _claim = host::claim(spec.limits.cores.as_ref(), spec.limits.memory_nodes.as_ref())?;

        let group = Arc::new(CgroupHandle::create(self.version, &spec.limits)?);
        log::info!("run {} starting: {:?}", group.id(), spec.argv[0]);

        let SpawnedChild {
            mut child,
            pid,
            started,
            stdout_reader,
            stderr_reader,
        } = match spawn::spawn(spec, &group) {
            Ok(spawned) => spawned,
            Err(err) => {
                destroy_group(&group);
                return Err(err);
            }
        };

        let watchdog = match Watchdog::start(
            Arc::clone(&group),
            &spec.limits,
            started,
            token,
            self.poll_interval,
            self.kill_grace,
        ) {
            Ok(watchdog) => watchdog,
            Err(err) => {
                abort_tree(&group, self.kill_grace);
                destroy_group(&group);
                return Err(err);
            }
        };

        let waited = self.wait_for_tree(&group, &mut child, &watchdog);
        let trigger = watchdog.join();
        let wall_time = started.elapsed();

        let exit_status = match waited {
            Ok(status) => status,
            Err(err) => {
                abort_tree(&group, self.kill_grace);
                destroy_group(&group);
                return Err(err);
            }
        };

        // Tree is empty here: counters are final and nothing can still
        // be charging them.
        let measurement = measure::collect(&group);
        let oom_kills = group.oom_kills().unwrap_or_else(|err| {
            log::debug!("oom counter read at completion failed: {}", err);
            0
        });
        destroy_group(&group);

        let stdout = reader_output(stdout_reader);
        let stderr = reader_output(stderr_reader);

        let exit_code = exit_status.code();
        let term_signal = exit_status.signal();
        let (usage, measurement_error) = match measurement {
            Ok(usage) => (Some(usage), None),
            Err(detail) => {
                log::warn!(
                    "measurement lost for run {} (pid {}): {}",
                    group.id(),
                    pid,
                    detail
                );
                (None, Some(detail))
            }
        };

        let (status, limit) = classify(
            trigger,
            oom_kills,
            term_signal,
            &spec.limits,
            usage.as_ref(),
            wall_time,
        );
        log::info!(
            "run {} finished: {:?} after {:.3}s",
            group.id(),
            status,
            wall_time.as_secs_f64()
        );

        Ok(RunResult {
            status,
            exit_code,
            term_signal,
            limit,
            wall_time,
            usage,
            measurement_error,
            stdout,
            stderr,
        })
    }

    /// Block until the whole tree is gone: reap the root via `try_wait`
    /// (its zombie leaves the group at exit), then wait for the group to
    /// empty. Once the watchdog has fired, the wait is bounded by the
    /// kill escalation's worst case; exceeding it means the kernel could
    /// not reclaim the tree and the run fails with `KillTimeout`.
    fn wait_for_tree(
        &self,
        group: &CgroupHandle,
        child: &mut Child,
        watchdog: &Watchdog,
    ) -> Result<ExitStatus> {
        let mut root_status: Option<ExitStatus> = None;
        let mut kill_deadline: Option<Instant> = None;

        loop {
            if root_status.is_none() {
                root_status = child.try_wait()?;
            }
            if let Some(status) = root_status {
                if group.is_empty()? {
                    return Ok(status);
                }
            }

            if kill_deadline.is_none() && watchdog.trigger().is_some() {
                kill_deadline = Some(Instant::now() + killer::kill_window(self.kill_grace));
            }
            if let Some(deadline) = kill_deadline {
                if Instant::now() > deadline {
                    let survivors = group.procs().unwrap_or_default();
                    return Err(RunError::KillTimeout(format!(
                        "group {} still holds {} process(es) after kill escalation",
                        group.id(),
                        survivors.len()
                    )));
                }
            }

            thread::sleep(REAP_POLL);
        }
    }
}

/// Deterministic status classification, in one place. Cancellation wins
/// outright; kernel OOM evidence beats whatever the watchdog believed;
/// a breach that lands between the watchdog's last poll and natural
/// exit is still caught by re-checking the final numbers.
fn classify(
    trigger: Option<Trigger>,
    oom_kills: u64,
    term_signal: Option<i32>,
    limits: &ResourceLimits,
    usage: Option<&FinalUsage>,
    wall_time: Duration,
) -> (RunStatus, Option<LimitKind>) {
    if trigger == Some(Trigger::Cancelled) {
        return (RunStatus::Cancelled, None);
    }
    if oom_kills > 0 {
        return (RunStatus::LimitExceeded, Some(LimitKind::Memory));
    }
    match trigger {
        Some(Trigger::Memory) => return (RunStatus::LimitExceeded, Some(LimitKind::Memory)),
        Some(Trigger::Cpu) => return (RunStatus::LimitExceeded, Some(LimitKind::Cpu)),
        Some(Trigger::Wall) => return (RunStatus::LimitExceeded, Some(LimitKind::Wall)),
        Some(Trigger::Cancelled) | None => {}
    }
    if let (Some(limit), Some(usage)) = (limits.cpu_time, usage) {
        if usage.cpu_time >= limit {
            return (RunStatus::LimitExceeded, Some(LimitKind::Cpu));
        }
    }
    if let Some(limit) = limits.wall_time {
        if wall_time >= limit {
            return (RunStatus::LimitExceeded, Some(LimitKind::Wall));
        }
    }
    if term_signal.is_some() {
        return (RunStatus::Signaled, None);
    }
    (RunStatus::Exited, None)
}

/// Best-effort tree termination on failure paths. Errors are logged;
/// the caller is already propagating the primary failure.
fn abort_tree(group: &CgroupHandle, grace: Duration) {
    if let Err(err) = killer::kill_group(group, grace) {
        log::error!("tree abort for group {} failed: {}", group.id(), err);
    }
}

fn destroy_group(group: &CgroupHandle) {
    if let Err(err) = group.destroy() {
        log::warn!(
            "group {} teardown incomplete, left to the startup reaper: {}",
            group.id(),
            err
        );
    }
}

fn reader_output(handle: Option<JoinHandle<Vec<u8>>>) -> Option<String> {
    handle.map(|handle| match handle.join() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            log::error!("capture reader thread panicked");
            String::new()
        }
    })
}
