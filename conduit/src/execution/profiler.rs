use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::execution::context::StageProfile;
use crate::stream::StageObserver;

/// Samples the resident set size of the current process.
#[derive(Debug)]
pub struct MemorySampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl MemorySampler {
    /// Creates a new sampler for the current process.
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }

    /// Returns the resident set size of the process.
    pub fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system.process(pid).map(|process| process.memory())
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregates per stage timings and memory deltas of one run.
///
/// Memory is only sampled when profiling is enabled.
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    sampler: MemorySampler,
    stages: Mutex<IndexMap<String, StageProfile>>,
    peak_memory: AtomicU64,
}

impl Profiler {
    /// Creates a new profiler. A disabled profiler only tracks peak memory.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sampler: MemorySampler::new(),
            stages: Mutex::new(IndexMap::new()),
            peak_memory: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock_stages(&self) -> MutexGuard<'_, IndexMap<String, StageProfile>> {
        self.stages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Samples memory and tracks the peak. Works with profiling disabled.
    pub fn sample(&self) -> Option<u64> {
        let resident = self.sampler.resident_bytes()?;
        self.peak_memory.fetch_max(resident, Ordering::Relaxed);
        Some(resident)
    }

    pub fn record(&self, stage: &str, elapsed: Duration, memory_delta: Option<i64>) {
        if !self.enabled {
            return;
        }

        self.lock_stages()
            .entry(stage.to_string())
            .or_default()
            .record(elapsed, memory_delta);
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }

    /// Returns the profile of every stage observed so far.
    pub fn stages(&self) -> IndexMap<String, StageProfile> {
        self.lock_stages().clone()
    }
}

impl StageObserver for Profiler {
    fn sample_memory(&self) -> Option<u64> {
        if self.enabled { self.sample() } else { None }
    }

    fn observe(&self, stage: &str, elapsed: Duration, memory_delta: Option<i64>) {
        self.record(stage, elapsed, memory_delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_when_enabled() {
        let disabled = Profiler::new(false);
        disabled.observe("transform", Duration::from_millis(1), Some(8));
        assert!(disabled.stages().is_empty());
        assert_eq!(disabled.sample_memory(), None);

        let enabled = Profiler::new(true);
        enabled.observe("transform", Duration::from_millis(1), Some(8));
        enabled.observe("transform", Duration::from_millis(3), Some(-2));

        let stages = enabled.stages();
        assert_eq!(stages["transform"].count, 2);
        assert_eq!(stages["transform"].memory_delta_bytes, 6);
    }

    #[test]
    fn samples_the_current_process() {
        let profiler = Profiler::new(true);
        let resident = profiler.sample().unwrap();

        assert!(resident > 0);
        assert_eq!(profiler.peak_memory(), resident);
    }
}
