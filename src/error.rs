//! Error taxonomy for run execution.
//!
//! Limit hits and lost measurements are not errors: they are reported inside
//! [`crate::result::RunResult`]. This enum covers the conditions that prevent
//! a run from producing a result at all.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected control-group filesystem failure after the run started.
    #[error("Cgroup error: {0}")]
    Cgroup(String),

    /// Required facility is missing up front: no usable cgroup hierarchy,
    /// unknown CPU cores or memory nodes, or a pinning claimed by a
    /// concurrent run.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The target program could not be started (missing, not executable,
    /// or a redirection target could not be opened).
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Invalid run spec: {0}")]
    InvalidSpec(String),

    /// The process tree survived the bounded kill escalation. Processes may
    /// be leaked; the run produces no result.
    #[error("Kill timeout: {0}")]
    KillTimeout(String),
}

impl From<nix::errno::Errno> for RunError {
    fn from(err: nix::errno::Errno) -> Self {
        RunError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for runcage operations.
pub type Result<T> = std::result::Result<T, RunError>;
