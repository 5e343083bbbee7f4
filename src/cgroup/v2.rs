//! Cgroup v2 backend: one directory in the unified hierarchy per run.

use crate::cgroup::backend::{
    collect_members, read_ctl, read_ctl_u64, remove_group_tree, stat_value, write_ctl,
    GroupBackend, GroupUsage, CGROUP_FS, SCOPE,
};
use crate::error::{Result, RunError};
use crate::host::format_cpu_list;
use crate::spec::ResourceLimits;
use std::collections::BTreeSet;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const REQUIRED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "cpuset"];

const FREEZE_CONFIRM: Duration = Duration::from_secs(1);
const THAW_CONFIRM: Duration = Duration::from_millis(500);
const STATE_POLL: Duration = Duration::from_millis(2);

pub(crate) struct V2Group {
    id: String,
    dir: PathBuf,
}

impl V2Group {
    pub(crate) fn new(id: &str) -> Self {
        V2Group {
            id: id.to_string(),
            dir: Path::new(CGROUP_FS).join(SCOPE).join(id),
        }
    }

    fn events_flag(&self, key: &str) -> Result<u64> {
        let events = read_ctl(&self.dir.join("cgroup.events"))?;
        stat_value(&events, key).ok_or_else(|| {
            RunError::Cgroup(format!(
                "cgroup.events of group {} has no {} field",
                self.id, key
            ))
        })
    }

    fn set_frozen(&self, target: u64, confirm_within: Duration) -> Result<()> {
        write_ctl(&self.dir.join("cgroup.freeze"), &target.to_string())?;

        let deadline = Instant::now() + confirm_within;
        loop {
            if self.events_flag("frozen")? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "group {}: frozen did not reach {} within {:?}",
                    self.id,
                    target,
                    confirm_within
                );
                return Ok(());
            }
            thread::sleep(STATE_POLL);
        }
    }
}

fn scope_dir() -> PathBuf {
    Path::new(CGROUP_FS).join(SCOPE)
}

/// Verify the unified hierarchy grants the controllers a run needs and
/// prepare the scope directory. Called once at executor construction.
pub(crate) fn probe() -> Result<()> {
    let root = Path::new(CGROUP_FS);
    let available = fs::read_to_string(root.join("cgroup.controllers")).map_err(|e| {
        RunError::ResourceUnavailable(format!("cannot read cgroup.controllers: {}", e))
    })?;
    for controller in REQUIRED_CONTROLLERS {
        if !available.split_whitespace().any(|c| c == controller) {
            return Err(RunError::ResourceUnavailable(format!(
                "cgroup v2 controller {} is not available (have: {})",
                controller,
                available.trim()
            )));
        }
    }

    let scope = scope_dir();
    fs::create_dir_all(&scope).map_err(|e| {
        RunError::ResourceUnavailable(format!("cannot create {}: {}", scope.display(), e))
    })?;

    // Delegate the controllers down to the per-run directories. One token
    // per write so an already-enabled controller cannot fail the others.
    for controller in REQUIRED_CONTROLLERS {
        let _ = fs::write(root.join("cgroup.subtree_control"), format!("+{}", controller));
        let _ = fs::write(
            scope.join("cgroup.subtree_control"),
            format!("+{}", controller),
        );
    }

    let delegated = fs::read_to_string(scope.join("cgroup.subtree_control")).map_err(|e| {
        RunError::ResourceUnavailable(format!("cannot read scope subtree_control: {}", e))
    })?;
    for controller in REQUIRED_CONTROLLERS {
        if !delegated.split_whitespace().any(|c| c == controller) {
            return Err(RunError::ResourceUnavailable(format!(
                "cgroup v2 controller {} could not be delegated to {}",
                controller,
                scope.display()
            )));
        }
    }

    if !scope.join("cgroup.freeze").exists() {
        return Err(RunError::ResourceUnavailable(
            "cgroup v2 freezer (cgroup.freeze) is not available".to_string(),
        ));
    }
    Ok(())
}

impl GroupBackend for V2Group {
    fn backend_name(&self) -> &'static str {
        "cgroup-v2"
    }

    fn create(&self, limits: &ResourceLimits) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            RunError::Cgroup(format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        if let Some(bytes) = limits.memory {
            write_ctl(&self.dir.join("memory.max"), &bytes.to_string())?;

            // Without a swap cap the tree can thrash in swap instead of
            // hitting the limit. Best effort: swap accounting may be off.
            let swap_max = self.dir.join("memory.swap.max");
            if swap_max.exists() {
                if let Err(e) = fs::write(&swap_max, "0") {
                    log::debug!("swap cap not applied for {}: {}", self.id, e);
                }
            }
        }
        if let Some(cores) = &limits.cores {
            write_ctl(&self.dir.join("cpuset.cpus"), &format_cpu_list(cores))?;
        }
        if let Some(nodes) = &limits.memory_nodes {
            write_ctl(&self.dir.join("cpuset.mems"), &format_cpu_list(nodes))?;
        }
        Ok(())
    }

    fn enroll_files(&self) -> Result<Vec<File>> {
        let procs = self.dir.join("cgroup.procs");
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|e| RunError::Cgroup(format!("failed to open {}: {}", procs.display(), e)))?;
        Ok(vec![file])
    }

    fn procs(&self) -> Result<Vec<u32>> {
        let mut members = BTreeSet::new();
        collect_members(&self.dir, &mut members);
        Ok(members.into_iter().collect())
    }

    fn usage(&self) -> Result<GroupUsage> {
        let cpu_stat = read_ctl(&self.dir.join("cpu.stat"))?;
        let usage_usec = stat_value(&cpu_stat, "usage_usec").ok_or_else(|| {
            RunError::Cgroup(format!("cpu.stat of group {} has no usage_usec", self.id))
        })?;
        let current = read_ctl_u64(&self.dir.join("memory.current"))?;

        // memory.peak needs 5.19; older kernels rely on the observed peak
        // maintained by the handle.
        let peak_file = self.dir.join("memory.peak");
        let kernel_peak = if peak_file.exists() {
            Some(read_ctl_u64(&peak_file)?)
        } else {
            None
        };

        Ok(GroupUsage {
            cpu_time: Duration::from_micros(usage_usec),
            current_memory: current,
            kernel_peak,
        })
    }

    fn oom_kills(&self) -> Result<u64> {
        let events = read_ctl(&self.dir.join("memory.events"))?;
        Ok(stat_value(&events, "oom_kill").unwrap_or(0))
    }

    fn freeze(&self) -> Result<()> {
        self.set_frozen(1, FREEZE_CONFIRM)
    }

    fn thaw(&self) -> Result<()> {
        self.set_frozen(0, THAW_CONFIRM)
    }

    fn kill_file(&self) -> Option<PathBuf> {
        let kill = self.dir.join("cgroup.kill");
        if kill.exists() {
            Some(kill)
        } else {
            None
        }
    }

    fn destroy(&self) -> Result<()> {
        let _ = self.thaw();

        if !self.dir.exists() {
            return Ok(());
        }

        // Stragglers go to the hierarchy root: the scope directory has
        // controllers delegated and cannot hold processes itself.
        if let Ok(content) = fs::read_to_string(self.dir.join("cgroup.procs")) {
            let root_procs = Path::new(CGROUP_FS).join("cgroup.procs");
            for line in content.lines() {
                if let Ok(pid) = line.trim().parse::<u32>() {
                    log::warn!("group {}: moving straggler pid {} out", self.id, pid);
                    let _ = fs::write(&root_procs, pid.to_string());
                }
            }
        }

        remove_group_tree(&self.dir).map_err(|e| {
            RunError::Cgroup(format!("failed to remove group {}: {}", self.id, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lives_under_scope() {
        let group = V2Group::new("runcage-7-deadbeef");
        assert_eq!(
            group.dir,
            PathBuf::from("/sys/fs/cgroup/runcage/runcage-7-deadbeef")
        );
    }

    #[test]
    fn required_controllers_are_cpu_memory_cpuset() {
        assert_eq!(REQUIRED_CONTROLLERS, ["cpu", "memory", "cpuset"]);
    }
}
