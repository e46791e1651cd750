use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// How record level failures are routed during a mapping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the whole run on the first record error.
    Stop,
    /// Record the error, drop the record and continue.
    #[default]
    Skip,
    /// Retry transient record errors with exponential backoff, then fail the run.
    Retry,
}

/// Options of a single mapping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Wall clock budget of the run, in milliseconds.
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries attempted for a transient failure before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay before the first retry, in milliseconds. Doubles on every attempt.
    #[serde(rename = "retryDelay", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound of the retry delay, in milliseconds.
    #[serde(rename = "maxRetryDelay", default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Promotes validation warnings to errors and fails the run on invalid records.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_true")]
    pub validate_input: bool,
    #[serde(default)]
    pub validate_output: bool,
    #[serde(default = "default_true")]
    pub collect_metrics: bool,
    #[serde(default)]
    pub enable_profiling: bool,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl ExecutionConfig {
    pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

    pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

    /// Returns the run timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the delay before the first retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Returns the upper bound of the retry backoff.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Ensures the timeout is set and the retry delays are consistent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::invalid(
                "execution.timeout",
                "must be greater than 0",
            ));
        }

        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(ValidationError::invalid(
                "execution.maxRetryDelay",
                "must be greater than or equal to `retryDelay`",
            ));
        }

        Ok(())
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            strict_mode: false,
            validate_input: true,
            validate_output: false,
            collect_metrics: true,
            enable_profiling: false,
            error_policy: ErrorPolicy::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    ExecutionConfig::DEFAULT_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    ExecutionConfig::DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    ExecutionConfig::DEFAULT_RETRY_DELAY_MS
}

fn default_max_retry_delay_ms() -> u64 {
    ExecutionConfig::DEFAULT_MAX_RETRY_DELAY_MS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_documented_keys() {
        let config: ExecutionConfig = serde_json::from_value(serde_json::json!({
            "timeout": 5000,
            "retryAttempts": 1,
            "retryDelay": 10,
            "strictMode": true,
            "errorPolicy": "stop"
        }))
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_attempts, 1);
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert!(config.strict_mode);
        assert!(config.validate_input);
        assert_eq!(config.error_policy, ErrorPolicy::Stop);
    }

    #[test]
    fn rejects_retry_delay_above_cap() {
        let config = ExecutionConfig {
            retry_delay_ms: 10_000,
            max_retry_delay_ms: 100,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }
}
