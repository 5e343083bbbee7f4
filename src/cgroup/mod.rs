//! Run-scoped control groups: the single source of truth for process-tree
//! membership and resource accounting.
//!
//! Each run owns exactly one group named `runcage-<owner pid>-<nonce>`.
//! The owner pid in the name is what lets a later invocation recognize and
//! reap groups whose owner crashed.

pub(crate) mod backend;
pub(crate) mod reaper;
mod v1;
mod v2;

pub use backend::CgroupVersion;

use crate::error::{Result, RunError};
use crate::spec::ResourceLimits;
use backend::{detect_version, GroupBackend};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Confirm the host can support runs at all: a mounted cgroup hierarchy
/// with cpu accounting, memory limits and peak, cpuset, and a freezer.
pub(crate) fn probe_facility() -> Result<CgroupVersion> {
    match detect_version() {
        Some(CgroupVersion::V2) => {
            v2::probe()?;
            Ok(CgroupVersion::V2)
        }
        Some(CgroupVersion::V1) => {
            v1::probe()?;
            Ok(CgroupVersion::V1)
        }
        None => Err(RunError::ResourceUnavailable(
            "no cgroup hierarchy mounted under /sys/fs/cgroup".to_string(),
        )),
    }
}

fn new_group_id() -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("runcage-{}-{}", std::process::id(), &nonce[..8])
}

/// Usage totals of a group at one instant.
pub(crate) struct UsageSnapshot {
    pub cpu_time: Duration,
    pub current_memory: u64,
    /// Max of the kernel high-water mark and every `current_memory` this
    /// handle has observed.
    pub peak_memory: u64,
}

/// Exclusive handle on one run's control group.
pub struct CgroupHandle {
    id: String,
    version: CgroupVersion,
    backend: Box<dyn GroupBackend>,
    observed_peak: AtomicU64,
    destroyed: AtomicBool,
}

impl CgroupHandle {
    /// Create the group and apply kernel-enforced limits. A half-created
    /// group is torn down before the error is returned.
    pub(crate) fn create(version: CgroupVersion, limits: &ResourceLimits) -> Result<CgroupHandle> {
        let id = new_group_id();
        let backend: Box<dyn GroupBackend> = match version {
            CgroupVersion::V1 => Box::new(v1::V1Group::new(&id)),
            CgroupVersion::V2 => Box::new(v2::V2Group::new(&id)),
        };
        if let Err(e) = backend.create(limits) {
            let _ = backend.destroy();
            return Err(e);
        }
        log::debug!("created {} group {}", version.name(), id);
        Ok(CgroupHandle {
            id,
            version,
            backend,
            observed_peak: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Pre-opened `cgroup.procs` handles for enrollment between fork and
    /// exec. One per hierarchy on v1, a single one on v2.
    pub(crate) fn enroll_files(&self) -> Result<Vec<File>> {
        self.backend.enroll_files()
    }

    /// Current member pids, including any sub-groups the tree created.
    pub(crate) fn procs(&self) -> Result<Vec<u32>> {
        self.backend.procs()
    }

    /// True once no process remains in the group. Zombies have already
    /// left their group, so this does not wait on the caller reaping them.
    pub(crate) fn is_empty(&self) -> Result<bool> {
        Ok(self.backend.procs()?.is_empty())
    }

    /// Read the group counters and fold the current memory into the
    /// observed peak, so kernels without a peak counter still report one.
    pub(crate) fn usage(&self) -> Result<UsageSnapshot> {
        let raw = self.backend.usage()?;
        let prev = self
            .observed_peak
            .fetch_max(raw.current_memory, Ordering::Relaxed);
        let observed = prev.max(raw.current_memory);
        Ok(UsageSnapshot {
            cpu_time: raw.cpu_time,
            current_memory: raw.current_memory,
            peak_memory: raw.kernel_peak.unwrap_or(0).max(observed),
        })
    }

    /// OOM kills charged to the group so far.
    pub(crate) fn oom_kills(&self) -> Result<u64> {
        self.backend.oom_kills()
    }

    pub(crate) fn freeze(&self) -> Result<()> {
        self.backend.freeze()
    }

    pub(crate) fn thaw(&self) -> Result<()> {
        self.backend.thaw()
    }

    /// `cgroup.kill` path when the kernel provides one.
    pub(crate) fn kill_file(&self) -> Option<PathBuf> {
        self.backend.kill_file()
    }

    /// Remove the group directories. Failure is reported but never blocks
    /// a result; the startup reaper of a later invocation finishes the job.
    pub(crate) fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::Relaxed);
        self.backend.destroy()
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::Relaxed) {
            if let Err(e) = self.backend.destroy() {
                log::warn!("group {} left behind: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_carry_owner_pid_and_differ() {
        let a = new_group_id();
        let b = new_group_id();
        let prefix = format!("runcage-{}-", std::process::id());
        assert!(a.starts_with(&prefix));
        assert!(b.starts_with(&prefix));
        assert_ne!(a, b);
        assert_eq!(a.len(), prefix.len() + 8);
    }
}
