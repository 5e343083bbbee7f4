//! Host CPU/NUMA topology and the process-wide pinning claim table.
//!
//! Core pinning is only meaningful if two concurrent runs in the same
//! process never share a core, so claims live in one explicit global table
//! rather than in per-run state.

use crate::error::{Result, RunError};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

const CPU_ONLINE: &str = "/sys/devices/system/cpu/online";
const NODE_ONLINE: &str = "/sys/devices/system/node/online";

/// Parse a Linux cpu-list string such as `0,3-5` into a set of ids.
///
/// This is the format of `cpuset.cpus`, `cpuset.mems` and the `/sys`
/// online masks. An empty (or whitespace-only) string parses to the
/// empty set.
pub fn parse_cpu_list(s: &str) -> std::result::Result<BTreeSet<u32>, String> {
    let mut out = BTreeSet::new();
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(out);
    }

    for part in trimmed.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty entry in cpu list {:?}", s));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range start {:?} in cpu list", part))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid range end {:?} in cpu list", part))?;
                if lo > hi {
                    return Err(format!("descending range {:?} in cpu list", part));
                }
                out.extend(lo..=hi);
            }
            None => {
                let id: u32 = part
                    .parse()
                    .map_err(|_| format!("invalid entry {:?} in cpu list", part))?;
                out.insert(id);
            }
        }
    }
    Ok(out)
}

/// Format a set of ids as a Linux cpu-list string (`0-2,5`).
pub fn format_cpu_list(set: &BTreeSet<u32>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = set.iter().copied();
    let Some(mut run_start) = iter.next() else {
        return String::new();
    };
    let mut run_end = run_start;

    for id in iter {
        if id == run_end + 1 {
            run_end = id;
        } else {
            parts.push(format_run(run_start, run_end));
            run_start = id;
            run_end = id;
        }
    }
    parts.push(format_run(run_start, run_end));
    parts.join(",")
}

fn format_run(start: u32, end: u32) -> String {
    if start == end {
        format!("{}", start)
    } else {
        format!("{}-{}", start, end)
    }
}

/// Online CPU cores and NUMA memory nodes of this host.
#[derive(Clone, Debug)]
pub struct Topology {
    pub online_cpus: BTreeSet<u32>,
    pub online_nodes: BTreeSet<u32>,
}

impl Topology {
    /// Read the host topology from `/sys`. Hosts without a NUMA tree report
    /// a single node 0.
    pub fn probe() -> Result<Topology> {
        let cpus_raw = fs::read_to_string(CPU_ONLINE).map_err(|e| {
            RunError::ResourceUnavailable(format!("cannot read {}: {}", CPU_ONLINE, e))
        })?;
        let online_cpus = parse_cpu_list(&cpus_raw)
            .map_err(|e| RunError::ResourceUnavailable(format!("{}: {}", CPU_ONLINE, e)))?;

        let online_nodes = if Path::new(NODE_ONLINE).exists() {
            let nodes_raw = fs::read_to_string(NODE_ONLINE).map_err(|e| {
                RunError::ResourceUnavailable(format!("cannot read {}: {}", NODE_ONLINE, e))
            })?;
            parse_cpu_list(&nodes_raw)
                .map_err(|e| RunError::ResourceUnavailable(format!("{}: {}", NODE_ONLINE, e)))?
        } else {
            BTreeSet::from([0])
        };

        Ok(Topology {
            online_cpus,
            online_nodes,
        })
    }

    pub fn verify_cores(&self, requested: &BTreeSet<u32>) -> Result<()> {
        let unknown: BTreeSet<u32> = requested.difference(&self.online_cpus).copied().collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(RunError::ResourceUnavailable(format!(
                "cores {} are not online (online: {})",
                format_cpu_list(&unknown),
                format_cpu_list(&self.online_cpus)
            )))
        }
    }

    pub fn verify_nodes(&self, requested: &BTreeSet<u32>) -> Result<()> {
        let unknown: BTreeSet<u32> = requested.difference(&self.online_nodes).copied().collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(RunError::ResourceUnavailable(format!(
                "memory nodes {} are not online (online: {})",
                format_cpu_list(&unknown),
                format_cpu_list(&self.online_nodes)
            )))
        }
    }
}

#[derive(Default)]
struct ClaimTable {
    cores: BTreeSet<u32>,
    nodes: BTreeSet<u32>,
}

static CLAIM_TABLE: OnceLock<Mutex<ClaimTable>> = OnceLock::new();

fn claim_table() -> &'static Mutex<ClaimTable> {
    CLAIM_TABLE.get_or_init(|| Mutex::new(ClaimTable::default()))
}

/// RAII claim on a set of cores and nodes. Dropping the guard releases the
/// claim for subsequent runs.
#[derive(Debug)]
pub struct ClaimGuard {
    cores: BTreeSet<u32>,
    nodes: BTreeSet<u32>,
}

/// Claim pinned cores and memory nodes for one run.
///
/// Overlap with a claim held by another in-flight run is rejected; unpinned
/// runs claim nothing and always succeed.
pub fn claim(
    cores: Option<&BTreeSet<u32>>,
    nodes: Option<&BTreeSet<u32>>,
) -> Result<ClaimGuard> {
    let cores = cores.cloned().unwrap_or_default();
    let nodes = nodes.cloned().unwrap_or_default();

    let mut table = claim_table().lock().unwrap_or_else(|e| e.into_inner());

    let core_overlap: BTreeSet<u32> = table.cores.intersection(&cores).copied().collect();
    if !core_overlap.is_empty() {
        return Err(RunError::ResourceUnavailable(format!(
            "cores {} are pinned by a concurrent run",
            format_cpu_list(&core_overlap)
        )));
    }
    let node_overlap: BTreeSet<u32> = table.nodes.intersection(&nodes).copied().collect();
    if !node_overlap.is_empty() {
        return Err(RunError::ResourceUnavailable(format!(
            "memory nodes {} are pinned by a concurrent run",
            format_cpu_list(&node_overlap)
        )));
    }

    table.cores.extend(cores.iter().copied());
    table.nodes.extend(nodes.iter().copied());
    Ok(ClaimGuard { cores, nodes })
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut table = claim_table().lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.cores {
            table.cores.remove(id);
        }
        for id in &self.nodes {
            table.nodes.remove(id);
        }
    }
}
