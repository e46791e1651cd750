//! Metric names recorded through the `metrics` facade.
//!
//! The library never installs an exporter; binaries decide where these go.

/// Label for the mapping id.
pub const MAPPING_ID_LABEL: &str = "mapping_id";

/// Label for the pool name.
pub const POOL_LABEL: &str = "pool";

/// Label for the stream or pipeline stage name.
pub const STAGE_LABEL: &str = "stage";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

// Execution metrics

/// Counter for records written to a target.
pub const CONDUIT_RECORDS_PROCESSED_TOTAL: &str = "conduit_records_processed_total";

/// Counter for records that failed and were recorded in the context.
pub const CONDUIT_RECORDS_FAILED_TOTAL: &str = "conduit_records_failed_total";

/// Counter for batches written to a target.
pub const CONDUIT_BATCHES_WRITTEN_TOTAL: &str = "conduit_batches_written_total";

/// Counter for retried operations.
pub const CONDUIT_RETRIES_TOTAL: &str = "conduit_retries_total";

/// Histogram of run durations in seconds.
pub const CONDUIT_EXECUTION_DURATION_SECONDS: &str = "conduit_execution_duration_seconds";

// Pool metrics

/// Counter for successful acquires.
pub const CONDUIT_POOL_ACQUIRES_TOTAL: &str = "conduit_pool_acquires_total";

/// Counter for acquires that timed out.
pub const CONDUIT_POOL_TIMEOUTS_TOTAL: &str = "conduit_pool_timeouts_total";

/// Gauge for idle connections.
pub const CONDUIT_POOL_IDLE_CONNECTIONS: &str = "conduit_pool_idle_connections";

/// Gauge for connections handed out to callers.
pub const CONDUIT_POOL_ACTIVE_CONNECTIONS: &str = "conduit_pool_active_connections";

/// Histogram of time spent waiting for a connection, in seconds.
pub const CONDUIT_POOL_ACQUIRE_WAIT_SECONDS: &str = "conduit_pool_acquire_wait_seconds";

// Stream metrics

/// Counter for backpressure activations.
pub const CONDUIT_BACKPRESSURE_EVENTS_TOTAL: &str = "conduit_backpressure_events_total";

/// Gauge for the number of buffered records of a stream.
pub const CONDUIT_STREAM_BUFFERED_RECORDS: &str = "conduit_stream_buffered_records";

/// Histogram of pipeline stage durations in seconds.
pub const CONDUIT_STAGE_DURATION_SECONDS: &str = "conduit_stage_duration_seconds";

// Validation metrics

/// Counter for validation cache hits.
pub const CONDUIT_VALIDATION_CACHE_HITS_TOTAL: &str = "conduit_validation_cache_hits_total";

/// Counter for validation cache misses.
pub const CONDUIT_VALIDATION_CACHE_MISSES_TOTAL: &str = "conduit_validation_cache_misses_total";
