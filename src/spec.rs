//! Run specification: the command to execute and the limits to enforce.

use crate::error::{Result, RunError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// One run of one untrusted command.
///
/// Immutable once handed to [`crate::RunExecutor::execute`]. The environment
/// of the spawned tree is the executor's own environment with
/// `env_overrides` applied on top.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSpec {
    /// Program and arguments. Must be non-empty; `argv[0]` is the program.
    pub argv: Vec<OsString>,
    /// Working directory for the root process. Inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// Environment entries applied over the inherited environment.
    pub env_overrides: Vec<(OsString, OsString)>,
    /// Hard resource limits.
    pub limits: ResourceLimits,
    pub stdin: StdinSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

/// Hard limits for one run. `None` means unlimited for that dimension.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time accumulated across the whole process tree.
    pub cpu_time: Option<Duration>,
    /// Wall-clock time from spawn to tree-empty.
    pub wall_time: Option<Duration>,
    /// Memory ceiling in bytes, enforced by the kernel on the whole tree.
    pub memory: Option<u64>,
    /// CPU cores the tree may run on (`cpuset.cpus`).
    pub cores: Option<BTreeSet<u32>>,
    /// NUMA nodes the tree may allocate from (`cpuset.mems`).
    pub memory_nodes: Option<BTreeSet<u32>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StdinSource {
    /// `/dev/null`.
    #[default]
    Null,
    /// Redirect stdin from an existing file.
    File(PathBuf),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputSink {
    /// Discard the stream.
    #[default]
    Null,
    /// Truncate and write the stream to a file.
    File(PathBuf),
    /// Collect the stream in memory and return it in the result.
    Capture,
}

impl RunSpec {
    /// A spec with the given argv, no limits, and all streams discarded.
    pub fn new(argv: Vec<OsString>) -> Self {
        RunSpec {
            argv,
            working_dir: None,
            env_overrides: Vec::new(),
            limits: ResourceLimits::default(),
            stdin: StdinSource::Null,
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        }
    }

    /// Reject specs that cannot describe a valid run: empty argv, zero
    /// limits, or empty pinning sets.
    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(RunError::InvalidSpec("argv is empty".to_string()));
        }
        if self.argv[0].is_empty() {
            return Err(RunError::InvalidSpec("argv[0] is empty".to_string()));
        }
        if self.limits.cpu_time == Some(Duration::ZERO) {
            return Err(RunError::InvalidSpec(
                "CPU time limit of zero".to_string(),
            ));
        }
        if self.limits.wall_time == Some(Duration::ZERO) {
            return Err(RunError::InvalidSpec(
                "wall time limit of zero".to_string(),
            ));
        }
        if self.limits.memory == Some(0) {
            return Err(RunError::InvalidSpec("memory limit of zero".to_string()));
        }
        if let Some(cores) = &self.limits.cores {
            if cores.is_empty() {
                return Err(RunError::InvalidSpec("empty core set".to_string()));
            }
        }
        if let Some(nodes) = &self.limits.memory_nodes {
            if nodes.is_empty() {
                return Err(RunError::InvalidSpec(
                    "empty memory node set".to_string(),
                ));
            }
        }
        Ok(())
    }
}
