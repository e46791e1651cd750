use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
    total_nanos: AtomicU64,
    buffered: AtomicUsize,
    buffer_high_water: AtomicUsize,
    backpressure_events: AtomicU64,
}

/// Shared counters of one stream or pipeline stage.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    counters: Arc<Counters>,
}

impl StreamStats {
    /// Creates a new set of zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.counters
            .backpressure_events
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Updates the number of buffered items, returning the new value.
    pub(crate) fn buffer_added(&self) -> usize {
        let buffered = self.counters.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters
            .buffer_high_water
            .fetch_max(buffered, Ordering::Relaxed);
        buffered
    }

    pub(crate) fn buffer_removed(&self) -> usize {
        let previous = self
            .counters
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    pub fn buffered(&self) -> usize {
        self.counters.buffered.load(Ordering::Acquire)
    }

    /// Returns a copy of the counters.
    pub fn snapshot(&self) -> StreamMetrics {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.counters.total_nanos.load(Ordering::Relaxed));

        StreamMetrics {
            processed,
            errors: self.counters.errors.load(Ordering::Relaxed),
            average_processing_time_ms: if processed == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1_000.0 / processed as f64
            },
            buffer_high_water_mark: self.counters.buffer_high_water.load(Ordering::Relaxed),
            backpressure_events: self.counters.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

/// Point in time view of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub processed: u64,
    pub errors: u64,
    pub average_processing_time_ms: f64,
    pub buffer_high_water_mark: usize,
    pub backpressure_events: u64,
}
