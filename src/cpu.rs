//! CPU-id partitioning and the thin affinity capability used by the session
//! controller (§4.5 step 3) and the profiler probe (§4.4).
//!
//! `CpuPartition` itself is a pure data type; actual topology detection is
//! out of scope (the controller consumes an already-built partition). The
//! affinity calls are gathered behind a tiny platform capability so the rest
//! of the crate never touches `nix`/`libc` types directly.

use std::collections::BTreeSet;

use crate::error::{AdaptystError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuPartition {
    profiler_set: BTreeSet<usize>,
    command_set: BTreeSet<usize>,
}

impl CpuPartition {
    pub fn new(profiler_set: BTreeSet<usize>, command_set: BTreeSet<usize>) -> Result<Self> {
        if !profiler_set.is_disjoint(&command_set) {
            return Err(AdaptystError::Env(
                "profiler and command CPU sets must be disjoint".into(),
            ));
        }
        Ok(Self {
            profiler_set,
            command_set,
        })
    }

    pub fn profiler_set(&self) -> &BTreeSet<usize> {
        &self.profiler_set
    }

    pub fn command_set(&self) -> &BTreeSet<usize> {
        &self.command_set
    }
}

/// Number of hardware threads available, used to clamp `--post-process`
/// (`0..=hw_threads-3`, clamped to >= 1).
pub fn hardware_thread_count() -> usize {
    num_cpus::get()
}

pub fn max_post_process_threads(hw_threads: usize) -> u32 {
    hw_threads.saturating_sub(3).max(1) as u32
}

/// Splits `0..hw_threads` into a low `profiler_set` of size `post_process`
/// (at least 1 CPU, so probes are never left to inherit the whole machine's
/// affinity) and a `command_set` covering the rest (§4.5 step 3).
pub fn partition_for_post_process(hw_threads: usize, post_process: u32) -> Result<CpuPartition> {
    let profiler_count = (post_process as usize).max(1).min(hw_threads.saturating_sub(1).max(1));
    let profiler_set: BTreeSet<usize> = (0..profiler_count).collect();
    let command_set: BTreeSet<usize> = (profiler_count..hw_threads).collect();
    CpuPartition::new(profiler_set, command_set)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod affinity {
    use super::*;

    fn cpu_set(cpus: &BTreeSet<usize>) -> Result<nix::sched::CpuSet> {
        let mut set = nix::sched::CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)
                .map_err(|e| AdaptystError::Env(format!("invalid CPU id {cpu}: {e}")))?;
        }
        Ok(set)
    }

    /// Pin the calling thread to `cpus`. A no-op on an empty set (inherit the
    /// caller's current affinity), per the spec's CpuPartition invariant that
    /// the union need not cover all CPUs and isolation can be disabled.
    pub fn pin_current_thread(cpus: &BTreeSet<usize>) -> Result<()> {
        if cpus.is_empty() {
            return Ok(());
        }
        let set = cpu_set(cpus)?;
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)
            .map_err(|e| AdaptystError::Env(format!("failed to set CPU affinity: {e}")))
    }

    /// Pin an already-running (or freshly forked, pre-exec) process to `cpus`.
    pub fn pin_pid(pid: u32, cpus: &BTreeSet<usize>) -> Result<()> {
        if cpus.is_empty() {
            return Ok(());
        }
        let set = cpu_set(cpus)?;
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(pid as i32), &set).map_err(|e| {
            AdaptystError::Env(format!("failed to set CPU affinity for pid {pid}: {e}"))
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use affinity::{pin_current_thread, pin_pid};

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pin_current_thread(_cpus: &BTreeSet<usize>) -> Result<()> {
    Err(AdaptystError::Env(
        "CPU affinity control is only supported on Linux".into(),
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pin_pid(_pid: u32, _cpus: &BTreeSet<usize>) -> Result<()> {
    Err(AdaptystError::Env(
        "CPU affinity control is only supported on Linux".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_partition_ok() {
        let profiler: BTreeSet<usize> = [0, 1].into_iter().collect();
        let command: BTreeSet<usize> = [2, 3].into_iter().collect();
        assert!(CpuPartition::new(profiler, command).is_ok());
    }

    #[test]
    fn overlapping_partition_rejected() {
        let profiler: BTreeSet<usize> = [0, 1].into_iter().collect();
        let command: BTreeSet<usize> = [1, 2].into_iter().collect();
        assert!(CpuPartition::new(profiler, command).is_err());
    }

    #[test]
    fn post_process_clamping() {
        assert_eq!(max_post_process_threads(4), 1);
        assert_eq!(max_post_process_threads(3), 1);
        assert_eq!(max_post_process_threads(2), 1);
        assert_eq!(max_post_process_threads(8), 5);
    }

    #[test]
    fn partition_for_post_process_splits_low_cpus_to_profiler() {
        let partition = partition_for_post_process(8, 3).unwrap();
        assert_eq!(partition.profiler_set(), &[0, 1, 2].into_iter().collect());
        assert_eq!(
            partition.command_set(),
            &[3, 4, 5, 6, 7].into_iter().collect()
        );
    }

    #[test]
    fn partition_for_post_process_keeps_at_least_one_profiler_cpu() {
        let partition = partition_for_post_process(4, 0).unwrap();
        assert_eq!(partition.profiler_set().len(), 1);
    }
}
