use conduit_config::shared::StreamConfig;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Below this many records a run is processed sequentially.
pub const SEQUENTIAL_THRESHOLD: u64 = 10_000;
/// Above this many records a run is streamed.
pub const STREAMING_THRESHOLD: u64 = 100_000;
/// Function transforms above which the transform stage runs in parallel.
pub const COMPLEXITY_THRESHOLD: usize = 8;
/// Cores at or above which the transform stage runs in parallel.
pub const ABUNDANT_CORES: usize = 8;
const LOW_MEMORY_FREE_RATIO: f64 = 0.3;
const HIGH_CPU_USAGE_PERCENT: f32 = 80.0;
const HIGH_CPU_MAX_CONCURRENCY: usize = 2;

/// How source records are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Fixed size pages read in line with processing.
    Sequential,
    /// Pages whose size adapts to the measured throughput.
    Batched,
    /// Pages read ahead by a producer task into a bounded buffer.
    Streaming,
}

/// Host resources a strategy is chosen for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub cores: usize,
    /// Fraction of memory still available, in `[0, 1]`.
    pub free_memory_ratio: f64,
    /// Global CPU usage in percent.
    pub cpu_usage: f32,
}

impl ResourceSnapshot {
    /// Reads the current resources of the host, honouring cgroup memory limits.
    ///
    /// CPU usage needs two refreshes some time apart, so this waits for
    /// [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`].
    pub async fn sample() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::nothing().with_ram())
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();

        let (free, total) = match system.cgroup_limits() {
            Some(limits) => (limits.free_memory, limits.total_memory),
            None => (system.available_memory(), system.total_memory()),
        };
        let free_memory_ratio = if total == 0 {
            1.0
        } else {
            (free as f64 / total as f64).clamp(0.0, 1.0)
        };

        Self {
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            free_memory_ratio,
            cpu_usage: system.global_cpu_usage(),
        }
    }

    pub fn is_memory_low(&self) -> bool {
        self.free_memory_ratio < LOW_MEMORY_FREE_RATIO
    }

    pub fn is_cpu_busy(&self) -> bool {
        self.cpu_usage > HIGH_CPU_USAGE_PERCENT
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cores: 1,
            free_memory_ratio: 1.0,
            cpu_usage: 0.0,
        }
    }
}

/// Processing plan of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStrategy {
    pub read_mode: ReadMode,
    pub page_size: usize,
    /// Items in flight in the transform stage. `1` means sequential.
    pub concurrency: usize,
}

impl ExecutionStrategy {
    /// Picks a plan from the estimated record count, the number of function transforms of the
    /// mapping and the host resources.
    pub fn select(
        estimated_records: Option<u64>,
        function_transforms: usize,
        resources: &ResourceSnapshot,
        stream: &StreamConfig,
    ) -> Self {
        let mut read_mode = match estimated_records {
            Some(n) if n < SEQUENTIAL_THRESHOLD => ReadMode::Sequential,
            Some(n) if n <= STREAMING_THRESHOLD => ReadMode::Batched,
            Some(_) => ReadMode::Streaming,
            // Unknown sizes are read adaptively.
            None => ReadMode::Batched,
        };

        let mut page_size = stream.chunk_size.max(1);
        if resources.is_memory_low() {
            page_size = (page_size / 2).max(1);
            read_mode = ReadMode::Streaming;
        }

        let mut concurrency = if function_transforms > COMPLEXITY_THRESHOLD || resources.cores >= ABUNDANT_CORES {
            stream.max_concurrency.max(1)
        } else {
            1
        };
        if resources.is_cpu_busy() {
            concurrency = concurrency.min(HIGH_CPU_MAX_CONCURRENCY);
        }

        Self {
            read_mode,
            page_size,
            concurrency,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.concurrency > 1
    }
}
