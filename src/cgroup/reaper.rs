//! Startup reaper for groups orphaned by a crashed owner.
//!
//! `destroy` failures are deliberately non-fatal at run time, so a group
//! directory can outlive its run. Every group name embeds the owner pid;
//! on the first run of a new executor this module sweeps the scope
//! directories, kill-sweeps any group whose owner is gone, and removes it.

use crate::cgroup::backend::{collect_members, remove_group_tree, CGROUP_FS, SCOPE};
use crate::cgroup::{v1, CgroupVersion};
use crate::killer::send_sigkill;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

static REAPED: OnceLock<()> = OnceLock::new();

/// Sweep orphaned groups. Runs at most once per process.
pub(crate) fn reap_once(version: CgroupVersion) {
    REAPED.get_or_init(|| {
        let reclaimed = sweep(version);
        if reclaimed > 0 {
            log::info!("reaped {} orphaned group(s)", reclaimed);
        }
    });
}

fn scope_roots(version: CgroupVersion) -> Vec<PathBuf> {
    match version {
        CgroupVersion::V1 => v1::HIERARCHIES
            .iter()
            .map(|h| Path::new(CGROUP_FS).join(h).join(SCOPE))
            .collect(),
        CgroupVersion::V2 => vec![Path::new(CGROUP_FS).join(SCOPE)],
    }
}

fn sweep(version: CgroupVersion) -> usize {
    let self_pid = std::process::id();
    let mut reclaimed = 0;

    for root in scope_roots(version) {
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(owner) = owner_pid(&name.to_string_lossy()) else {
                continue;
            };
            if owner == self_pid || process_alive(owner) {
                continue;
            }

            log::info!(
                "reclaiming group {} (owner pid {} is gone)",
                path.display(),
                owner
            );
            reclaim(&path, version);
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Owner pid embedded in a `runcage-<pid>-<nonce>` group name.
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("runcage-")?;
    let (pid, nonce) = rest.split_once('-')?;
    if nonce.is_empty() {
        return None;
    }
    pid.parse().ok()
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Kill whatever still lives in an orphaned group, then remove it.
fn reclaim(dir: &Path, version: CgroupVersion) {
    // The owner may have crashed mid-kill with the group frozen; frozen
    // tasks cannot die, so thaw before signaling.
    match version {
        CgroupVersion::V1 => {
            let state = dir.join("freezer.state");
            if state.exists() {
                let _ = fs::write(&state, "THAWED");
            }
        }
        CgroupVersion::V2 => {
            let kill = dir.join("cgroup.kill");
            if kill.exists() {
                let _ = fs::write(&kill, "1");
            }
            let freeze = dir.join("cgroup.freeze");
            if freeze.exists() {
                let _ = fs::write(&freeze, "0");
            }
        }
    }

    let mut members = BTreeSet::new();
    collect_members(dir, &mut members);
    for pid in &members {
        send_sigkill(*pid);
    }
    if !members.is_empty() {
        thread::sleep(Duration::from_millis(20));
    }

    if let Err(e) = remove_group_tree(dir) {
        log::warn!("could not remove orphaned group {}: {}", dir.display(), e);
    }
}
