use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Sizing and timing of a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Connections kept open while the pool is healthy.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Hard cap on idle plus acquired connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long an acquirer waits in the queue, in milliseconds.
    #[serde(rename = "acquireTimeout", default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle time after which a connection above the minimum is reaped, in milliseconds.
    #[serde(rename = "idleTimeout", default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Bound on a single connection creation, in milliseconds.
    #[serde(rename = "createTimeout", default = "default_create_timeout_ms")]
    pub create_timeout_ms: u64,
    #[serde(rename = "reapInterval", default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[serde(
        rename = "healthCheckInterval",
        default = "default_health_check_interval_ms"
    )]
    pub health_check_interval_ms: u64,
    /// Creation attempts made before a waiter is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl PoolConfig {
    pub const DEFAULT_MIN_CONNECTIONS: usize = 2;

    pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

    pub const DEFAULT_CREATE_TIMEOUT_MS: u64 = 10_000;

    pub const DEFAULT_REAP_INTERVAL_MS: u64 = 1_000;

    pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Returns how long an acquire waits for a connection.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Returns how long an idle connection is kept.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Returns the time limit for opening one connection.
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    /// Returns the interval between idle reaping passes.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Returns the interval between health checks of idle connections.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Ensures `0 < max` and `min <= max`, and that every interval is non zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                "pool.maxConnections",
                "must be greater than 0",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ValidationError::invalid(
                "pool.minConnections",
                "must be less than or equal to `maxConnections`",
            ));
        }

        let intervals = [
            ("pool.acquireTimeout", self.acquire_timeout_ms),
            ("pool.createTimeout", self.create_timeout_ms),
            ("pool.reapInterval", self.reap_interval_ms),
            ("pool.healthCheckInterval", self.health_check_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ValidationError::invalid(field, "must be greater than 0"));
            }
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            create_timeout_ms: default_create_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_min_connections() -> usize {
    PoolConfig::DEFAULT_MIN_CONNECTIONS
}

fn default_max_connections() -> usize {
    PoolConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_acquire_timeout_ms() -> u64 {
    PoolConfig::DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> u64 {
    PoolConfig::DEFAULT_IDLE_TIMEOUT_MS
}

fn default_create_timeout_ms() -> u64 {
    PoolConfig::DEFAULT_CREATE_TIMEOUT_MS
}

fn default_reap_interval_ms() -> u64 {
    PoolConfig::DEFAULT_REAP_INTERVAL_MS
}

fn default_health_check_interval_ms() -> u64 {
    PoolConfig::DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    PoolConfig::DEFAULT_MAX_RETRIES
}
