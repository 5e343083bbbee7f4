//! Final counter collection.
//!
//! Runs in the window after the tree is empty and before the group is
//! destroyed, so the counters cover every process the run ever held and
//! nothing can still be adding to them. An unreadable counter yields an
//! error string for the result's `measurement_error`, never a zero.

use crate::cgroup::CgroupHandle;
use crate::result::FinalUsage;

pub(crate) fn collect(group: &CgroupHandle) -> std::result::Result<FinalUsage, String> {
    match group.usage() {
        Ok(usage) => {
            log::debug!(
                "final usage for group {}: cpu {:?}, peak {} bytes",
                group.id(),
                usage.cpu_time,
                usage.peak_memory
            );
            Ok(FinalUsage {
                cpu_time: usage.cpu_time,
                peak_memory: usage.peak_memory,
            })
        }
        Err(err) => Err(format!("final counter read failed: {}", err)),
    }
}
