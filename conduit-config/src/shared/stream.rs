use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Buffering, batching and concurrency of streaming stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Buffered items at which a stream reports backpressure and stops reading upstream.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    /// Buffered items below which a stream resumes reading upstream.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Items in flight inside a parallel stage.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Initial read page size.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_true")]
    pub enable_backpressure_control: bool,
    #[serde(default = "default_true")]
    pub enable_adaptive_buffering: bool,
    /// Maximum time a partial batch waits for more items, in milliseconds.
    #[serde(rename = "flushTimeout", default)]
    pub flush_timeout_ms: Option<u64>,
}

impl StreamConfig {
    pub const DEFAULT_HIGH_WATER_MARK: usize = 1_000;

    pub const DEFAULT_LOW_WATER_MARK: usize = 250;

    pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

    pub const DEFAULT_CHUNK_SIZE: usize = 100;

    /// Returns the flush timeout of partial batches, if any.
    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_ms.map(Duration::from_millis)
    }

    /// Validates the stream settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.high_water_mark == 0 {
            return Err(ValidationError::invalid(
                "stream.highWaterMark",
                "must be greater than 0",
            ));
        }

        if self.low_water_mark > self.high_water_mark {
            return Err(ValidationError::invalid(
                "stream.lowWaterMark",
                "must be less than or equal to `highWaterMark`",
            ));
        }

        if self.max_concurrency == 0 {
            return Err(ValidationError::invalid(
                "stream.maxConcurrency",
                "must be greater than 0",
            ));
        }

        if self.chunk_size == 0 {
            return Err(ValidationError::invalid(
                "stream.chunkSize",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            max_concurrency: default_max_concurrency(),
            chunk_size: default_chunk_size(),
            enable_backpressure_control: true,
            enable_adaptive_buffering: true,
            flush_timeout_ms: None,
        }
    }
}

fn default_high_water_mark() -> usize {
    StreamConfig::DEFAULT_HIGH_WATER_MARK
}

fn default_low_water_mark() -> usize {
    StreamConfig::DEFAULT_LOW_WATER_MARK
}

fn default_max_concurrency() -> usize {
    StreamConfig::DEFAULT_MAX_CONCURRENCY
}

fn default_chunk_size() -> usize {
    StreamConfig::DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}
