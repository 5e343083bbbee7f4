//! Run outcome: how the tree ended and what it consumed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of one completed run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    /// How the run ended.
    pub status: RunStatus,
    /// Exit code of the root process, when it exited normally.
    pub exit_code: Option<i32>,
    /// Signal that terminated the root process, when it was signaled.
    pub term_signal: Option<i32>,
    /// Which limit ended the run, when `status` is `LimitExceeded`.
    pub limit: Option<LimitKind>,
    /// Wall-clock time from spawn until the process tree was empty,
    /// measured on a monotonic clock.
    pub wall_time: Duration,
    /// Final resource usage. `None` means the measurement was lost;
    /// usage values are never fabricated.
    pub usage: Option<FinalUsage>,
    /// Detail for a lost measurement.
    pub measurement_error: Option<String>,
    /// Captured stdout, only for [`crate::spec::OutputSink::Capture`].
    /// Lossily decoded as UTF-8.
    pub stdout: Option<String>,
    /// Captured stderr, only for [`crate::spec::OutputSink::Capture`].
    pub stderr: Option<String>,
}

/// Terminal state of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    /// The root process exited on its own and the tree drained.
    #[serde(rename = "exited")]
    Exited,
    /// The root process was killed by a signal not attributable to a limit.
    #[serde(rename = "signaled")]
    Signaled,
    /// A hard limit ended the run; see [`RunResult::limit`].
    #[serde(rename = "limit")]
    LimitExceeded,
    /// The caller's cancel token ended the run.
    #[serde(rename = "cancelled")]
    Cancelled,
}

/// The limit dimension that ended a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LimitKind {
    #[serde(rename = "cputime")]
    Cpu,
    #[serde(rename = "walltime")]
    Wall,
    #[serde(rename = "memory")]
    Memory,
}

/// Usage totals for the whole tree, collected after the last member exited.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalUsage {
    /// CPU time accumulated by every process that was ever in the group.
    pub cpu_time: Duration,
    /// Peak memory of the group in bytes.
    pub peak_memory: u64,
}

impl LimitKind {
    pub fn as_reason(&self) -> &'static str {
        match self {
            LimitKind::Cpu => "cputime",
            LimitKind::Wall => "walltime",
            LimitKind::Memory => "memory",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_reason())
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Exited => "exited",
            RunStatus::Signaled => "signaled",
            RunStatus::LimitExceeded => "limit",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl RunResult {
    /// True when the run completed normally with exit code zero.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Exited && self.exit_code == Some(0)
    }

    /// Termination reason string: the limit name, or `killed` for an
    /// externally cancelled run. `None` for natural terminations.
    pub fn termination_reason(&self) -> Option<&'static str> {
        match self.status {
            RunStatus::LimitExceeded => self.limit.map(|l| l.as_reason()),
            RunStatus::Cancelled => Some("killed"),
            RunStatus::Exited | RunStatus::Signaled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: RunStatus) -> RunResult {
        RunResult {
            status,
            exit_code: None,
            term_signal: None,
            limit: None,
            wall_time: Duration::from_millis(5),
            usage: None,
            measurement_error: None,
            stdout: None,
            stderr: None,
        }
    }

    #[test]
    fn limit_kinds_serialize_to_reason_strings() {
        assert_eq!(
            serde_json::to_value(LimitKind::Cpu).unwrap(),
            serde_json::json!("cputime")
        );
        assert_eq!(
            serde_json::to_value(LimitKind::Wall).unwrap(),
            serde_json::json!("walltime")
        );
        assert_eq!(
            serde_json::to_value(LimitKind::Memory).unwrap(),
            serde_json::json!("memory")
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(RunStatus::LimitExceeded).unwrap(),
            serde_json::json!("limit")
        );
        assert_eq!(
            serde_json::to_value(RunStatus::Cancelled).unwrap(),
            serde_json::json!("cancelled")
        );
    }

    #[test]
    fn termination_reason_mapping() {
        let mut r = result(RunStatus::LimitExceeded);
        r.limit = Some(LimitKind::Wall);
        assert_eq!(r.termination_reason(), Some("walltime"));

        assert_eq!(
            result(RunStatus::Cancelled).termination_reason(),
            Some("killed")
        );
        assert_eq!(result(RunStatus::Exited).termination_reason(), None);
        assert_eq!(result(RunStatus::Signaled).termination_reason(), None);
    }

    #[test]
    fn success_requires_clean_exit() {
        let mut r = result(RunStatus::Exited);
        r.exit_code = Some(0);
        assert!(r.success());

        r.exit_code = Some(1);
        assert!(!r.success());

        let mut r = result(RunStatus::LimitExceeded);
        r.exit_code = Some(0);
        assert!(!r.success());
    }

    #[test]
    fn result_round_trips_through_json() {
        let mut r = result(RunStatus::Exited);
        r.exit_code = Some(3);
        r.usage = Some(FinalUsage {
            cpu_time: Duration::from_millis(120),
            peak_memory: 4096,
        });
        r.stdout = Some("hello\n".to_string());

        let text = serde_json::to_string(&r).unwrap();
        let back: RunResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, RunStatus::Exited);
        assert_eq!(back.exit_code, Some(3));
        assert_eq!(back.usage, r.usage);
        assert_eq!(back.stdout.as_deref(), Some("hello\n"));
    }
}
