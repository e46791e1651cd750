use std::time::Duration;

use conduit_config::shared::StreamConfig;
use tracing::debug;

use crate::adapter::PageSize;

const GROWTH_FACTOR: f64 = 1.5;

/// Tunes a shared [`PageSize`] from observed throughput.
///
/// Starts at `chunk_size`, grows by half when the throughput of the last page improved on the
/// previous one (capped at `high_water_mark`) and halves on backpressure or failures.
#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    page_size: PageSize,
    max_size: usize,
    enabled: bool,
    last_throughput: Option<f64>,
}

impl AdaptiveBatchSizer {
    /// Creates a new sizer starting at the configured chunk size.
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            page_size: PageSize::new(config.chunk_size),
            max_size: config.high_water_mark.max(config.chunk_size).max(1),
            enabled: config.enable_adaptive_buffering,
            last_throughput: None,
        }
    }

    /// Uses an existing handle, starting from its current size.
    pub fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns the page size handle this sizer tunes.
    pub fn page_size(&self) -> PageSize {
        self.page_size.clone()
    }

    /// Returns the current size.
    pub fn current(&self) -> usize {
        self.page_size.get()
    }

    /// Records a page of `records` handled in `elapsed`.
    pub fn record_page(&mut self, records: usize, elapsed: Duration) {
        if !self.enabled || records == 0 {
            return;
        }

        let throughput = records as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let improved = self
            .last_throughput
            .is_some_and(|previous| throughput > previous);
        self.last_throughput = Some(throughput);

        if improved {
            let current = self.page_size.get();
            let grown = ((current as f64 * GROWTH_FACTOR).ceil() as usize).min(self.max_size);
            if grown != current {
                debug!(from = current, to = grown, "growing page size");
                self.page_size.set(grown);
            }
        }
    }

    /// Halves the size after a backpressure event, when adaptive buffering is enabled.
    pub fn on_backpressure(&mut self) {
        self.shrink("backpressure");
    }

    /// Same as [`Self::on_backpressure`], after a failed write.
    pub fn on_error(&mut self) {
        self.shrink("error");
    }

    fn shrink(&mut self, reason: &'static str) {
        if !self.enabled {
            return;
        }

        let current = self.page_size.get();
        let shrunk = (current / 2).max(1);
        if shrunk != current {
            debug!(from = current, to = shrunk, reason, "shrinking page size");
            self.page_size.set(shrunk);
        }
        // The next page starts a fresh comparison.
        self.last_throughput = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig {
            chunk_size: 100,
            high_water_mark: 200,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn grows_on_improvement_up_to_the_high_water_mark() {
        let mut sizer = AdaptiveBatchSizer::new(&config());

        sizer.record_page(100, Duration::from_millis(100));
        assert_eq!(sizer.current(), 100);

        sizer.record_page(100, Duration::from_millis(50));
        assert_eq!(sizer.current(), 150);

        sizer.record_page(150, Duration::from_millis(50));
        assert_eq!(sizer.current(), 200);

        // Slower page, no growth.
        sizer.record_page(200, Duration::from_secs(1));
        assert_eq!(sizer.current(), 200);
    }

    #[test]
    fn halves_on_backpressure_and_errors() {
        let mut sizer = AdaptiveBatchSizer::new(&config());
        sizer.on_backpressure();
        assert_eq!(sizer.current(), 50);
        sizer.on_error();
        assert_eq!(sizer.current(), 25);

        for _ in 0..10 {
            sizer.on_error();
        }
        assert_eq!(sizer.current(), 1);
    }

    #[test]
    fn disabled_sizer_keeps_the_chunk_size() {
        let mut sizer = AdaptiveBatchSizer::new(&StreamConfig {
            enable_adaptive_buffering: false,
            ..config()
        });
        sizer.record_page(100, Duration::from_millis(100));
        sizer.record_page(100, Duration::from_millis(1));
        sizer.on_backpressure();

        assert_eq!(sizer.current(), 100);
    }
}
