//! Backend abstraction over the v1 split hierarchies and the v2 unified tree.

use crate::error::Result;
use crate::spec::ResourceLimits;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const CGROUP_FS: &str = "/sys/fs/cgroup";

/// Scope directory name under which every run group lives.
pub(crate) const SCOPE: &str = "runcage";

/// Counters read from the group in one pass.
pub(crate) struct GroupUsage {
    /// Accumulated CPU time of every process that was ever a member.
    pub cpu_time: Duration,
    /// Current memory charged to the group.
    pub current_memory: u64,
    /// Kernel-maintained high-water mark, when the kernel exposes one.
    pub kernel_peak: Option<u64>,
}

/// One run-scoped control group. Implementations own the directory layout
/// of their cgroup version; callers go through [`super::CgroupHandle`].
pub(crate) trait GroupBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Create the group directories and apply kernel-enforced limits.
    fn create(&self, limits: &ResourceLimits) -> Result<()>;

    /// Pre-opened `cgroup.procs` handles, one per hierarchy, for enrollment
    /// between fork and exec.
    fn enroll_files(&self) -> Result<Vec<File>>;

    /// Current member pids, deduplicated across hierarchies.
    fn procs(&self) -> Result<Vec<u32>>;

    fn usage(&self) -> Result<GroupUsage>;

    /// OOM kills charged to the group so far.
    fn oom_kills(&self) -> Result<u64>;

    /// Freeze the group, waiting a bounded time for confirmation.
    fn freeze(&self) -> Result<()>;

    fn thaw(&self) -> Result<()>;

    /// `cgroup.kill` path when the kernel provides one (v2, 5.14+).
    fn kill_file(&self) -> Option<PathBuf>;

    /// Remove the group directories. The caller is responsible for the
    /// tree being empty; stragglers are moved out first as a last resort.
    fn destroy(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    pub fn name(self) -> &'static str {
        match self {
            CgroupVersion::V1 => "cgroup-v1",
            CgroupVersion::V2 => "cgroup-v2",
        }
    }
}

/// Detect the mounted cgroup version: unified v2 preferred, split v1
/// hierarchies as fallback.
pub(crate) fn detect_version() -> Option<CgroupVersion> {
    if Path::new(CGROUP_FS).join("cgroup.controllers").exists() {
        return Some(CgroupVersion::V2);
    }
    if Path::new(CGROUP_FS).join("memory").exists()
        && Path::new(CGROUP_FS).join("freezer").exists()
    {
        return Some(CgroupVersion::V1);
    }
    None
}

/// Write a control file, naming the file in the error.
pub(crate) fn write_ctl(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|e| {
        crate::error::RunError::Cgroup(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Read a control file, naming the file in the error.
pub(crate) fn read_ctl(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        crate::error::RunError::Cgroup(format!("failed to read {}: {}", path.display(), e))
    })
}

/// Read a control file holding a single integer.
pub(crate) fn read_ctl_u64(path: &Path) -> Result<u64> {
    let content = read_ctl(path)?;
    content.trim().parse().map_err(|e| {
        crate::error::RunError::Cgroup(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Parse one `key value` counter line out of a flat stat file.
pub(crate) fn stat_value(content: &str, key: &str) -> Option<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            return parts.next().and_then(|v| v.parse().ok());
        }
    }
    None
}

/// Collect member pids of a group directory and every sub-group below it.
/// Unreadable entries are skipped: a vanished directory means its members
/// are gone.
pub(crate) fn collect_members(dir: &Path, members: &mut std::collections::BTreeSet<u32>) {
    if let Ok(content) = std::fs::read_to_string(dir.join("cgroup.procs")) {
        for line in content.lines() {
            if let Ok(pid) = line.trim().parse::<u32>() {
                members.insert(pid);
            }
        }
    }
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_members(&path, members);
            }
        }
    }
}

const REMOVE_WAIT: Duration = Duration::from_secs(1);
const REMOVE_POLL: Duration = Duration::from_millis(10);

/// Remove one cgroup directory, retrying EBUSY while exiting members settle.
pub(crate) fn remove_dir_retry(dir: &Path) -> std::io::Result<()> {
    let deadline = std::time::Instant::now() + REMOVE_WAIT;
    loop {
        match std::fs::remove_dir(dir) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                let busy = e.raw_os_error() == Some(libc::EBUSY);
                if !busy || std::time::Instant::now() >= deadline {
                    return Err(e);
                }
            }
        }
        std::thread::sleep(REMOVE_POLL);
    }
}

/// Remove a group directory and any sub-groups the tree created inside it,
/// innermost first.
pub(crate) fn remove_group_tree(dir: &Path) -> std::io::Result<()> {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let _ = remove_group_tree(&path);
            }
        }
    }
    remove_dir_retry(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_version_does_not_panic() {
        let _ = detect_version();
    }

    #[test]
    fn version_names() {
        assert_eq!(CgroupVersion::V1.name(), "cgroup-v1");
        assert_eq!(CgroupVersion::V2.name(), "cgroup-v2");
    }

    #[test]
    fn stat_value_finds_keys() {
        let stat = "usage_usec 123456\nuser_usec 100\nsystem_usec 23\n";
        assert_eq!(stat_value(stat, "usage_usec"), Some(123456));
        assert_eq!(stat_value(stat, "system_usec"), Some(23));
        assert_eq!(stat_value(stat, "missing"), None);
    }

    #[test]
    fn stat_value_ignores_prefix_matches() {
        let stat = "oom 0\noom_kill 2\noom_group_kill 1\n";
        assert_eq!(stat_value(stat, "oom"), Some(0));
        assert_eq!(stat_value(stat, "oom_kill"), Some(2));
    }
}
