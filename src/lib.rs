//! runcage: measured execution of untrusted process trees under hard
//! resource limits, with Linux cgroups as the single source of truth
//! for membership and accounting.
//!
//! One [`RunExecutor`] drives the full lifecycle of a run: a fresh
//! control group per run, enrollment of the target between fork and
//! exec, a watchdog thread enforcing CPU/wall/memory limits, freeze
//! aware kill escalation, and a final measurement taken only once the
//! whole tree is gone.
//!
//! # Architecture
//!
//! - [`executor`]: run orchestration and result classification
//! - `cgroup` (private): v1/v2 backends behind one handle, startup
//!   reaper for groups left behind by crashed invocations
//! - `spawn` (private): `Command` wiring plus the pre-exec enrollment
//!   hook
//! - `watchdog` / `killer` (private): limit polling and freeze-then-
//!   signal termination of the whole tree
//! - [`host`]: online core/node topology and the process-wide pinning
//!   claim table
//! - [`spec`] / [`result`]: the data model, [`RunSpec`] in,
//!   [`RunResult`] out
//! - [`cli`]: the single-run command line front end
//!
//! # Guarantees
//!
//! 1. **No instruction outside the group** - enrollment happens between
//!    fork and exec and aborts the exec on failure
//! 2. **No leaked processes** - a run only completes once its group is
//!    empty, and kill sweeps operate on frozen snapshots so forks
//!    cannot escape
//! 3. **No fabricated numbers** - unreadable counters surface as a
//!    measurement error, never as zeros
//!
//! # Example
//!
//! ```no_run
//! use runcage::{ResourceLimits, RunExecutor, RunSpec};
//! use std::time::Duration;
//!
//! # fn main() -> runcage::Result<()> {
//! let mut spec = RunSpec::new(vec!["echo".into(), "hello".into()]);
//! spec.limits = ResourceLimits {
//!     cpu_time: Some(Duration::from_secs(10)),
//!     wall_time: Some(Duration::from_secs(15)),
//!     memory: Some(512 << 20),
//!     ..Default::default()
//! };
//!
//! let executor = RunExecutor::new()?;
//! let result = executor.execute(&spec)?;
//! println!("{}: {:?}", result.status, result.usage);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod error;
pub mod executor;
pub mod host;
pub mod result;
pub mod spec;

mod cgroup;
mod killer;
mod measure;
mod spawn;
mod watchdog;

pub use cgroup::CgroupVersion;
pub use error::{Result, RunError};
pub use executor::RunExecutor;
pub use result::{FinalUsage, LimitKind, RunResult, RunStatus};
pub use spec::{OutputSink, ResourceLimits, RunSpec, StdinSource};
pub use watchdog::CancelToken;
