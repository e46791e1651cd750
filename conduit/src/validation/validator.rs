use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::validation::result::ValidationResult;

/// Per-call information handed to validators.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Path prefix prepended to the fields of reported issues.
    pub path: String,
    /// Treat warnings as errors.
    pub strict: bool,
    pub mapping_id: Option<String>,
}

impl ValidationContext {
    /// Creates options treating warnings as errors.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Path of `field` below the current prefix.
    pub fn field_path(&self, field: &str) -> String {
        join_path(&self.path, field)
    }
}

pub(crate) fn join_path(prefix: &str, field: &str) -> String {
    match (prefix.is_empty(), field.is_empty()) {
        (true, _) => field.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}.{field}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorOptions {
    /// Disabled validators accept everything.
    pub enabled: bool,
    /// Stop at the first error instead of collecting all of them.
    pub stop_on_error: bool,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_on_error: false,
        }
    }
}

/// Counters of one validator.
#[derive(Debug, Default)]
pub struct ValidatorStats {
    validations: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
}

impl ValidatorStats {
    pub fn record(&self, result: &ValidationResult, elapsed: Duration) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if !result.valid {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Returns a copy of the counters.
    pub fn snapshot(&self) -> ValidatorMetrics {
        let validations = self.validations.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed));

        ValidatorMetrics {
            validations,
            failures: self.failures.load(Ordering::Relaxed),
            average_time_us: if validations == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1_000_000.0 / validations as f64
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorMetrics {
    pub validations: u64,
    pub failures: u64,
    pub average_time_us: f64,
}

/// Checks a JSON document and reports what is wrong with it.
///
/// Implementations provide [`Validator::check`]; callers use [`Validator::validate`], which honours
/// the enabled flag and records metrics.
pub trait Validator: Send + Sync + fmt::Debug {
    /// Name used in cache keys, logs and composite results.
    fn name(&self) -> &str;

    fn options(&self) -> ValidatorOptions {
        ValidatorOptions::default()
    }

    fn stats(&self) -> &ValidatorStats;

    fn check(&self, data: &serde_json::Value, context: &ValidationContext) -> ValidationResult;

    fn validate(&self, data: &serde_json::Value, context: &ValidationContext) -> ValidationResult {
        if !self.options().enabled {
            return ValidationResult::valid();
        }

        let started = Instant::now();
        let mut result = self.check(data, context);
        if context.strict {
            result.promote_warnings();
        }
        self.stats().record(&result, started.elapsed());

        result
    }

    fn metrics(&self) -> ValidatorMetrics {
        self.stats().snapshot()
    }
}
