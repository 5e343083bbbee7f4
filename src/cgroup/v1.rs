//! Cgroup v1 backend: split cpuacct, memory, cpuset and freezer hierarchies.

use crate::cgroup::backend::{
    collect_members, read_ctl, read_ctl_u64, remove_group_tree, stat_value, write_ctl,
    GroupBackend, GroupUsage, CGROUP_FS, SCOPE,
};
use crate::error::{Result, RunError};
use crate::host::format_cpu_list;
use crate::spec::ResourceLimits;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Hierarchies a run group spans. Freezer first: enrollment follows this
/// order, and a process must be freezable before anything else matters.
pub(crate) const HIERARCHIES: [&str; 4] = ["freezer", "cpuset", "memory", "cpuacct"];

const FREEZE_CONFIRM: Duration = Duration::from_secs(1);
const THAW_CONFIRM: Duration = Duration::from_millis(500);
const STATE_POLL: Duration = Duration::from_millis(2);

pub(crate) struct V1Group {
    id: String,
    /// Hierarchy name to per-run child directory.
    dirs: HashMap<String, PathBuf>,
}

impl V1Group {
    pub(crate) fn new(id: &str) -> Self {
        let mut dirs = HashMap::new();
        for hierarchy in HIERARCHIES {
            dirs.insert(
                hierarchy.to_string(),
                Path::new(CGROUP_FS).join(hierarchy).join(SCOPE).join(id),
            );
        }
        V1Group {
            id: id.to_string(),
            dirs,
        }
    }

    fn dir(&self, hierarchy: &str) -> Result<&PathBuf> {
        self.dirs.get(hierarchy).ok_or_else(|| {
            RunError::Cgroup(format!("hierarchy {} missing for group {}", hierarchy, self.id))
        })
    }

    fn freezer_state(&self) -> Result<String> {
        let state = read_ctl(&self.dir("freezer")?.join("freezer.state"))?;
        Ok(state.trim().to_string())
    }

    fn set_freezer_state(&self, target: &str, confirm_within: Duration) -> Result<()> {
        let state_file = self.dir("freezer")?.join("freezer.state");
        write_ctl(&state_file, target)?;

        let deadline = Instant::now() + confirm_within;
        loop {
            if self.freezer_state()? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                // FREEZING can persist when a task sits in an uninterruptible
                // syscall. Signaling still queues, so the caller proceeds.
                log::warn!(
                    "group {}: freezer did not reach {} within {:?}",
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

/// Verify the split hierarchies carry everything a run needs and prepare
/// the scope directories. Called once at executor construction.
pub(crate) fn probe() -> Result<()> {
    for hierarchy in HIERARCHIES {
        let root = Path::new(CGROUP_FS).join(hierarchy);
        if !root.exists() {
            return Err(RunError::ResourceUnavailable(format!(
                "cgroup v1 hierarchy {} is not mounted",
                hierarchy
            )));
        }
        let scope = root.join(SCOPE);
        fs::create_dir_all(&scope).map_err(|e| {
            RunError::ResourceUnavailable(format!(
                "cannot create {}: {}",
                scope.display(),
                e
            ))
        })?;
    }

    // The cpuset scope starts empty and rejects member processes until its
    // cpus and mems are seeded from the hierarchy root.
    let cpuset_root = Path::new(CGROUP_FS).join("cpuset");
    seed_cpuset(&cpuset_root.join(SCOPE), &cpuset_root)
        .map_err(|e| RunError::ResourceUnavailable(e.to_string()))?;

    let checks = [
        ("freezer", "freezer.state"),
        ("memory", "memory.limit_in_bytes"),
        ("memory", "memory.max_usage_in_bytes"),
        ("cpuacct", "cpuacct.usage"),
    ];
    for (hierarchy, file) in checks {
        let path = Path::new(CGROUP_FS).join(hierarchy).join(SCOPE).join(file);
        if let Err(e) = fs::read_to_string(&path) {
            return Err(RunError::ResourceUnavailable(format!(
                "required control file {} is not readable: {}",
                path.display(),
                e
            )));
        }
    }
    Ok(())
}

fn seed_cpuset(child: &Path, parent: &Path) -> Result<()> {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        let value = read_ctl(&parent.join(file))?;
        write_ctl(&child.join(file), value.trim())?;
    }
    Ok(())
}

impl GroupBackend for V1Group {
    fn backend_name(&self) -> &'static str {
        "cgroup-v1"
    }

    fn create(&self, limits: &ResourceLimits) -> Result<()> {
        for hierarchy in HIERARCHIES {
            let dir = self.dir(hierarchy)?;
            fs::create_dir_all(dir).map_err(|e| {
                RunError::Cgroup(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        let cpuset = self.dir("cpuset")?.clone();
        seed_cpuset(&cpuset, &Path::new(CGROUP_FS).join("cpuset").join(SCOPE))?;
        if let Some(cores) = &limits.cores {
            write_ctl(&cpuset.join("cpuset.cpus"), &format_cpu_list(cores))?;
        }
        if let Some(nodes) = &limits.memory_nodes {
            write_ctl(&cpuset.join("cpuset.mems"), &format_cpu_list(nodes))?;
        }

        if let Some(bytes) = limits.memory {
            let memory = self.dir("memory")?;
            write_ctl(&memory.join("memory.limit_in_bytes"), &bytes.to_string())?;

            // Cap memory+swap to the same value so the tree cannot escape
            // the limit into swap. Kernels without swap accounting lack
            // the file; the plain limit still holds.
            let memsw = memory.join("memory.memsw.limit_in_bytes");
            if memsw.exists() {
                if let Err(e) = fs::write(&memsw, bytes.to_string()) {
                    log::debug!("memsw limit not applied for {}: {}", self.id, e);
                }
            }
            let swappiness = memory.join("memory.swappiness");
            if swappiness.exists() {
                let _ = fs::write(&swappiness, "0");
            }
        }
        Ok(())
    }

    fn enroll_files(&self) -> Result<Vec<File>> {
        let mut files = Vec::with_capacity(HIERARCHIES.len());
        for hierarchy in HIERARCHIES {
            let procs = self.dir(hierarchy)?.join("cgroup.procs");
            let file = fs::OpenOptions::new().write(true).open(&procs).map_err(|e| {
                RunError::Cgroup(format!("failed to open {}: {}", procs.display(), e))
            })?;
            files.push(file);
        }
        Ok(files)
    }

    fn procs(&self) -> Result<Vec<u32>> {
        let mut members = BTreeSet::new();
        for hierarchy in HIERARCHIES {
            collect_members(self.dir(hierarchy)?, &mut members);
        }
        Ok(members.into_iter().collect())
    }

    fn usage(&self) -> Result<GroupUsage> {
        let cpu_ns = read_ctl_u64(&self.dir("cpuacct")?.join("cpuacct.usage"))?;
        let memory = self.dir("memory")?;
        let current = read_ctl_u64(&memory.join("memory.usage_in_bytes"))?;
        let peak = read_ctl_u64(&memory.join("memory.max_usage_in_bytes"))?;
        Ok(GroupUsage {
            cpu_time: Duration::from_nanos(cpu_ns),
            current_memory: current,
            kernel_peak: Some(peak),
        })
    }

    fn oom_kills(&self) -> Result<u64> {
        let memory = self.dir("memory")?;
        let stat = read_ctl(&memory.join("memory.stat"))?;
        let mut kills = stat_value(&stat, "oom_kill").unwrap_or(0);

        // Older kernels lack the oom_kill counter; the under_oom flag from
        // memory.oom_control is the remaining signal.
        if kills == 0 {
            if let Ok(control) = read_ctl(&memory.join("memory.oom_control")) {
                if control.contains("under_oom 1") {
                    kills = 1;
                }
            }
        }
        Ok(kills)
    }

    fn freeze(&self) -> Result<()> {
        self.set_freezer_state("FROZEN", FREEZE_CONFIRM)
    }

    fn thaw(&self) -> Result<()> {
        self.set_freezer_state("THAWED", THAW_CONFIRM)
    }

    fn kill_file(&self) -> Option<PathBuf> {
        None
    }

    fn destroy(&self) -> Result<()> {
        // A frozen group cannot be emptied: thaw first so stragglers can
        // run their pending kills and any move-out takes effect.
        let _ = self.thaw();

        let mut errors = Vec::new();
        for hierarchy in HIERARCHIES {
            let dir = self.dir(hierarchy)?;
            if !dir.exists() {
                continue;
            }

            // Last resort for pids that never died: move them to the
            // hierarchy root so rmdir can succeed.
            if let Ok(content) = fs::read_to_string(dir.join("cgroup.procs")) {
                let root_procs = Path::new(CGROUP_FS).join(hierarchy).join("cgroup.procs");
                for line in content.lines() {
                    if let Ok(pid) = line.trim().parse::<u32>() {
                        log::warn!("group {}: moving straggler pid {} out", self.id, pid);
                        let _ = fs::write(&root_procs, pid.to_string());
                    }
                }
            }

            if let Err(e) = remove_group_tree(dir) {
                errors.push(format!("{}: {}", hierarchy, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunError::Cgroup(format!(
                "failed to remove group {}: {}",
                self.id,
                errors.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_spans_all_hierarchies() {
        let group = V1Group::new("runcage-1-abc12345");
        for hierarchy in HIERARCHIES {
            assert_eq!(
                group.dirs[hierarchy],
                PathBuf::from(format!(
                    "/sys/fs/cgroup/{}/runcage/runcage-1-abc12345",
                    hierarchy
                ))
            );
        }
    }

    #[test]
    fn freezer_is_enrolled_first() {
        assert_eq!(HIERARCHIES[0], "freezer");
    }

    #[test]
    fn v1_has_no_kill_file() {
        assert!(V1Group::new("runcage-1-x").kill_file().is_none());
    }
}
