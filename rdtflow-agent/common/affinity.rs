use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::{RdtError, Result};

/// Pins the calling thread to one CPU until dropped
///
/// MSR accesses through `/dev/cpu/N/msr` are executed on CPU N by the kernel
/// already; pinning additionally keeps CPUID results and any per-thread
/// register state on the CPU whose registers are being programmed.
pub struct AffinityGuard {
    old_affinity: CpuSet,
    cpu: u32,
}

impl AffinityGuard {
    pub fn new(cpu: u32) -> Result<Self> {
        if cpu as usize >= CpuSet::count() {
            return Err(RdtError::AffinityError(format!(
                "CPU {cpu} exceeds affinity mask size {}",
                CpuSet::count()
            )));
        }

        let old_affinity = sched_getaffinity(Pid::from_raw(0))
            .map_err(|e| RdtError::AffinityError(format!("Failed to get affinity: {e}")))?;

        let mut pinned = CpuSet::new();
        pinned.set(cpu as usize).map_err(|e| {
            RdtError::AffinityError(format!("Failed to set CPU {cpu} in set: {e}"))
        })?;

        sched_setaffinity(Pid::from_raw(0), &pinned).map_err(|e| {
            RdtError::AffinityError(format!("Failed to set affinity to CPU {cpu}: {e}"))
        })?;

        Ok(Self { old_affinity, cpu })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        let _ = sched_setaffinity(Pid::from_raw(0), &self.old_affinity);
    }
}
